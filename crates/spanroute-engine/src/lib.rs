//! Parallel, protocol-aware traceroute engine.
//!
//! The engine discovers the routers between this host and a destination by
//! sending TTL-scoped probes and correlating the ICMP errors (and, for TCP,
//! direct SYN-ACK/RST replies) they elicit. Probes run in parallel up to a
//! configured bound, each one wrapped in a tracing span.
//!
//! Composition, leaves first: a [`listener`](listener) per receive socket
//! feeds raw datagrams onto a bounded queue; the
//! [`registry`](registry::InflightRegistry) maps correlation keys to
//! outstanding probes with atomic take semantics; the
//! [`limiter`](limiter::ParallelLimiter) bounds probes in flight; the
//! per-protocol orchestrators ([`TcpTraceroute`], [`UdpTraceroute`]) drive
//! sending, dispatching, timeout sweeping, and result aggregation.

pub mod limiter;
pub mod listener;
pub mod registry;
mod session;
pub mod tcp;
pub mod udp;

pub use tcp::TcpTraceroute;
pub use udp::UdpTraceroute;
