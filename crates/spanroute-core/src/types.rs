//! Core types for traceroute runs.

use crate::tracer::{NoopTracer, TraceContext, Tracer};
use crate::TracerouteError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Probe protocol for a traceroute run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = TracerouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(TracerouteError::InvalidConfig(format!(
                "unknown protocol: {}",
                s
            ))),
        }
    }
}

/// Configuration for one traceroute invocation. Created per run, immutable
/// thereafter.
#[derive(Clone)]
pub struct TracerouteConfig {
    /// Hostname the destination was resolved from.
    pub destination_hostname: String,
    /// Hostname of the probing host.
    pub local_hostname: String,
    /// Highest TTL to probe.
    pub max_hops: u8,
    /// Probes per hop.
    pub num_measurements: u16,
    /// Maximum probes in flight at once.
    pub parallel_requests: u16,
    /// Destination port for probes.
    pub port: u16,
    /// How long to wait for a reply to a single probe.
    pub timeout: Duration,
    /// Span sink for the run.
    pub tracer: Arc<dyn Tracer>,
    /// Per-run correlation id carried into span baggage.
    pub xid: Uuid,
    /// Parent context (with baggage) the run span is started under.
    pub trace_ctx: TraceContext,
}

impl TracerouteConfig {
    /// Creates a configuration with the defaults of the one-shot CLI and a
    /// no-op tracer.
    pub fn new(
        destination_hostname: impl Into<String>,
        local_hostname: impl Into<String>,
    ) -> Self {
        Self {
            destination_hostname: destination_hostname.into(),
            local_hostname: local_hostname.into(),
            max_hops: 30,
            num_measurements: 3,
            parallel_requests: 16,
            port: 33434,
            timeout: Duration::from_secs(2),
            tracer: Arc::new(NoopTracer),
            xid: Uuid::new_v4(),
            trace_ctx: TraceContext::new(),
        }
    }

    /// Validates the per-run bounds.
    pub fn validate(&self) -> Result<(), TracerouteError> {
        if self.max_hops == 0 {
            return Err(TracerouteError::InvalidConfig(
                "max_hops must be at least 1".to_string(),
            ));
        }
        if self.num_measurements == 0 {
            return Err(TracerouteError::InvalidConfig(
                "num_measurements must be at least 1".to_string(),
            ));
        }
        if self.parallel_requests == 0 {
            return Err(TracerouteError::InvalidConfig(
                "parallel_requests must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TracerouteError::InvalidConfig(
                "timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for TracerouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerouteConfig")
            .field("destination_hostname", &self.destination_hostname)
            .field("local_hostname", &self.local_hostname)
            .field("max_hops", &self.max_hops)
            .field("num_measurements", &self.num_measurements)
            .field("parallel_requests", &self.parallel_requests)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("xid", &self.xid)
            .finish_non_exhaustive()
    }
}
