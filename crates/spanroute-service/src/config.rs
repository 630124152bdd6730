//! YAML configuration for the scheduled trace service.

use serde::{Deserialize, Serialize};
use spanroute_core::{Protocol, TracerouteError};
use std::io;
use std::path::Path;
use std::time::Duration;

/// Configuration schema version this build understands.
pub const SCHEMA_VERSION: &str = "1.0.0";

// Values applied when the configuration file leaves a field out or zero.
const DEFAULT_MAX_HOPS: u8 = 60;
const DEFAULT_NUMBER_QUERIES: u16 = 3;
const DEFAULT_PARALLEL_REQUESTS: u16 = 16;
const DEFAULT_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_SOURCE_PORT: u16 = 80;
const DEFAULT_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_HEALTHCHECK_PATH: &str = "/_healthcheck";
const DEFAULT_HEALTHCHECK_PORT: u16 = 8080;

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(rename = "schema-version")]
    pub schema_version: String,
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub globals: GlobalSettings,
    #[serde(default)]
    pub healthcheck: HealthCheckSettings,
}

/// Settings shared by every destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(rename = "max-hops", default = "default_max_hops")]
    pub max_hops: u8,
    #[serde(rename = "number-queries", default = "default_number_queries")]
    pub number_queries: u16,
    #[serde(rename = "parallel-requests", default = "default_parallel_requests")]
    pub parallel_requests: u16,
    #[serde(rename = "timeout-seconds", default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(rename = "source-port", default = "default_source_port")]
    pub source_port: u16,
    #[serde(rename = "interval-seconds", default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl GlobalSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            max_hops: default_max_hops(),
            number_queries: default_number_queries(),
            parallel_requests: default_parallel_requests(),
            timeout_seconds: default_timeout_seconds(),
            source_port: default_source_port(),
            interval_seconds: default_interval_seconds(),
        }
    }
}

/// Health-check endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_healthcheck_path")]
    pub path: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_healthcheck_port")]
    pub port: u16,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            path: default_healthcheck_path(),
            enabled: false,
            port: default_healthcheck_port(),
        }
    }
}

fn default_max_hops() -> u8 {
    DEFAULT_MAX_HOPS
}

fn default_number_queries() -> u16 {
    DEFAULT_NUMBER_QUERIES
}

fn default_parallel_requests() -> u16 {
    DEFAULT_PARALLEL_REQUESTS
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_source_port() -> u16 {
    DEFAULT_SOURCE_PORT
}

fn default_interval_seconds() -> u64 {
    DEFAULT_INTERVAL_SECONDS
}

fn default_healthcheck_path() -> String {
    DEFAULT_HEALTHCHECK_PATH.to_string()
}

fn default_healthcheck_port() -> u16 {
    DEFAULT_HEALTHCHECK_PORT
}

impl TraceConfig {
    /// Reads and validates a configuration from a reader.
    pub fn load(reader: impl io::Read) -> Result<Self, TracerouteError> {
        let mut config: TraceConfig = serde_yaml::from_reader(reader)
            .map_err(|err| TracerouteError::InvalidConfig(err.to_string()))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a configuration file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, TracerouteError> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|err| TracerouteError::InvalidConfig(err.to_string()))?;
        Self::load(file)
    }

    /// Explicit zeroes fall back to the defaults, same as omitted fields.
    fn apply_defaults(&mut self) {
        let globals = &mut self.globals;
        if globals.max_hops == 0 {
            globals.max_hops = DEFAULT_MAX_HOPS;
        }
        if globals.number_queries == 0 {
            globals.number_queries = DEFAULT_NUMBER_QUERIES;
        }
        if globals.parallel_requests == 0 {
            globals.parallel_requests = DEFAULT_PARALLEL_REQUESTS;
        }
        if globals.timeout_seconds == 0 {
            globals.timeout_seconds = DEFAULT_TIMEOUT_SECONDS;
        }
        if globals.interval_seconds == 0 {
            globals.interval_seconds = DEFAULT_INTERVAL_SECONDS;
        }
    }

    pub fn validate(&self) -> Result<(), TracerouteError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(TracerouteError::InvalidConfig(format!(
                "unknown schema version {}",
                self.schema_version
            )));
        }
        if self.destinations.is_empty() {
            return Err(TracerouteError::InvalidConfig(
                "at least one destination is required".to_string(),
            ));
        }
        for destination in &self.destinations {
            if !looks_like_hostname(destination) {
                return Err(TracerouteError::InvalidConfig(format!(
                    "destination {:?} is not a hostname",
                    destination
                )));
            }
        }
        Ok(())
    }

    /// A populated sample configuration, printed by `spanroute config`.
    pub fn sample() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            destinations: vec![
                "first-test-domain.org".to_string(),
                "second-test-domain.org".to_string(),
                "third-test-domain.net".to_string(),
            ],
            globals: GlobalSettings::default(),
            healthcheck: HealthCheckSettings {
                enabled: true,
                ..HealthCheckSettings::default()
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String, TracerouteError> {
        serde_yaml::to_string(self).map_err(|err| TracerouteError::Internal(err.to_string()))
    }
}

fn looks_like_hostname(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_full_configuration() {
        let yaml = r#"
schema-version: "1.0.0"
destinations:
  - example.org
  - probe.example.net
globals:
  protocol: udp
  max-hops: 12
  number-queries: 2
  parallel-requests: 4
  timeout-seconds: 3
  source-port: 33434
  interval-seconds: 30
healthcheck:
  path: /_healthcheck
  enabled: true
  port: 9090
"#;
        let config = TraceConfig::load(yaml.as_bytes()).unwrap();
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.globals.protocol, Protocol::Udp);
        assert_eq!(config.globals.max_hops, 12);
        assert_eq!(config.globals.timeout(), Duration::from_secs(3));
        assert_eq!(config.globals.interval(), Duration::from_secs(30));
        assert!(config.healthcheck.enabled);
        assert_eq!(config.healthcheck.port, 9090);
    }

    #[test]
    fn test_defaults_fill_missing_and_zero_fields() {
        let yaml = r#"
schema-version: "1.0.0"
destinations: [example.org]
globals:
  max-hops: 0
"#;
        let config = TraceConfig::load(yaml.as_bytes()).unwrap();
        assert_eq!(config.globals.protocol, Protocol::Tcp);
        assert_eq!(config.globals.max_hops, 60);
        assert_eq!(config.globals.number_queries, 3);
        assert_eq!(config.globals.parallel_requests, 16);
        assert_eq!(config.globals.timeout(), Duration::from_secs(5));
        assert_eq!(config.globals.interval(), Duration::from_secs(60));
        assert!(!config.healthcheck.enabled);
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let yaml = r#"
schema-version: "2.0.0"
destinations: [example.org]
"#;
        assert!(TraceConfig::load(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_destinations_rejected() {
        let yaml = r#"
schema-version: "1.0.0"
destinations: []
"#;
        assert!(TraceConfig::load(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_bad_hostname_rejected() {
        let yaml = r#"
schema-version: "1.0.0"
destinations: ["not a hostname"]
"#;
        assert!(TraceConfig::load(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_bad_protocol_rejected() {
        let yaml = r#"
schema-version: "1.0.0"
destinations: [example.org]
globals:
  protocol: icmp
"#;
        assert!(TraceConfig::load(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_sample_round_trips() {
        let sample = TraceConfig::sample();
        sample.validate().unwrap();
        let yaml = sample.to_yaml().unwrap();
        let loaded = TraceConfig::load(yaml.as_bytes()).unwrap();
        assert_eq!(loaded.destinations, sample.destinations);
        assert!(loaded.healthcheck.enabled);
    }
}
