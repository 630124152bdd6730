//! Error types for traceroute operations.
//!
//! Only fatal conditions become errors: setup failures (sockets, source-IP
//! discovery, configuration, DNS) and the engine's own packet construction.
//! Peer-originated noise never surfaces here — malformed replies are dropped
//! by the codec, and per-probe send failures complete that one probe as
//! unsuccessful without an error crossing the run boundary.

use std::net::IpAddr;
use thiserror::Error;

/// Main error type for traceroute operations.
#[derive(Error, Debug)]
pub enum TracerouteError {
    // Socket/IO errors
    #[error("Failed to create {proto} socket: {source}")]
    SocketCreation {
        proto: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind to address {addr}: {source}")]
    SocketBind {
        addr: IpAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Opening a raw {proto} socket requires CAP_NET_RAW or root")]
    RawSocketPermission { proto: &'static str },

    #[error("Failed to discover local source address: {0}")]
    SourceIpDiscovery(#[source] std::io::Error),

    // Packet errors
    #[error("Failed to build probe packet: {0}")]
    PacketBuild(String),

    // DNS errors
    #[error("Failed to resolve hostname {hostname}: {source}")]
    DnsResolutionFailed {
        hostname: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Destination {0} resolved to no usable IPv4 addresses")]
    NoAddresses(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for traceroute operations.
pub type TracerouteResult<T> = Result<T, TracerouteError>;
