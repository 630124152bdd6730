//! Service scaffolding around the traceroute engine: YAML configuration,
//! destination resolution, the scheduled trace loop, and the HTTP health
//! endpoint.

pub mod config;
pub mod health;
pub mod resolve;
pub mod service;

pub use config::{GlobalSettings, HealthCheckSettings, TraceConfig, SCHEMA_VERSION};
pub use health::HealthState;
pub use resolve::resolve_destination;
pub use service::Service;
