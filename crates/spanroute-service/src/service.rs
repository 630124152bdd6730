//! Scheduled trace loop.

use crate::config::TraceConfig;
use crate::health::{self, HealthState};
use crate::resolve::resolve_destination;
use spanroute_core::{
    Protocol, ResultTable, TraceContext, Tracer, TracerouteConfig, TracerouteResult,
};
use spanroute_engine::{TcpTraceroute, UdpTraceroute};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Re-runs traceroutes for the configured destinations on a fixed interval,
/// keeping the health counters current. One engine run per resolved address,
/// destinations handled sequentially.
pub struct Service {
    config: TraceConfig,
    hostname: String,
    tracer: Arc<dyn Tracer>,
    health: Arc<HealthState>,
}

impl Service {
    pub fn new(config: TraceConfig, hostname: impl Into<String>, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            config,
            hostname: hostname.into(),
            tracer,
            health: HealthState::new(),
        }
    }

    pub fn health(&self) -> Arc<HealthState> {
        self.health.clone()
    }

    /// Runs until the token fires. The first traces go out after one full
    /// interval, matching the schedule the configuration describes.
    pub async fn run(&self, cancel: CancellationToken) -> TracerouteResult<()> {
        if self.config.healthcheck.enabled {
            let state = self.health.clone();
            let settings = self.config.healthcheck.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = health::serve(state, settings, token).await {
                    warn!(error = %err, "health check endpoint stopped");
                }
            });
        }

        let mut ticker = tokio::time::interval(self.config.globals.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick is the schedule start, not a trace.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("service loop stopping");
                    return Ok(());
                }
                _ = ticker.tick() => self.run_once().await,
            }
        }
    }

    /// One pass over every configured destination.
    pub async fn run_once(&self) {
        for destination in &self.config.destinations {
            let resolve_started = Instant::now();
            let addrs = match resolve_destination(destination).await {
                Ok(addrs) => addrs,
                Err(err) => {
                    warn!(destination = %destination, error = %err, "resolution failed");
                    self.health.record_trace(false);
                    continue;
                }
            };
            self.health.record_dns_latency(resolve_started.elapsed());

            for addr in addrs {
                match self.trace_one(destination, addr).await {
                    Ok(table) => {
                        info!(
                            destination = %destination,
                            address = %addr,
                            hops = table.len(),
                            "trace complete"
                        );
                        self.health.record_trace(true);
                    }
                    Err(err) => {
                        warn!(destination = %destination, address = %addr, error = %err, "trace failed");
                        self.health.record_trace(false);
                    }
                }
            }
        }
    }

    async fn trace_one(
        &self,
        destination: &str,
        addr: Ipv4Addr,
    ) -> TracerouteResult<ResultTable> {
        let config = self.run_config(destination);
        match self.config.globals.protocol {
            Protocol::Tcp => TcpTraceroute::new(addr, config)?.start().await,
            Protocol::Udp => UdpTraceroute::new(addr, config)?.start().await,
        }
    }

    /// Per-trace engine configuration: fresh xid and baggage each run.
    fn run_config(&self, destination: &str) -> TracerouteConfig {
        let globals = &self.config.globals;
        let xid = Uuid::new_v4();
        let trace_ctx = TraceContext::new()
            .with_baggage("destination_hostname", destination)
            .with_baggage("source", self.hostname.clone())
            .with_baggage("max_hops", globals.max_hops.to_string())
            .with_baggage("xid", xid.to_string());

        TracerouteConfig {
            destination_hostname: destination.to_string(),
            local_hostname: self.hostname.clone(),
            max_hops: globals.max_hops,
            num_measurements: globals.number_queries,
            parallel_requests: globals.parallel_requests,
            port: globals.source_port,
            timeout: globals.timeout(),
            tracer: self.tracer.clone(),
            xid,
            trace_ctx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanroute_core::NoopTracer;

    fn service() -> Service {
        let mut config = TraceConfig::sample();
        config.globals.max_hops = 5;
        config.healthcheck.enabled = false;
        Service::new(config, "probe-host", Arc::new(NoopTracer))
    }

    #[test]
    fn test_run_config_carries_baggage() {
        let service = service();
        let config = service.run_config("example.org");

        assert_eq!(config.destination_hostname, "example.org");
        assert_eq!(config.max_hops, 5);
        let baggage: Vec<(&str, &str)> = config.trace_ctx.baggage().collect();
        assert!(baggage.contains(&("destination_hostname", "example.org")));
        assert!(baggage.contains(&("source", "probe-host")));
        assert!(baggage.contains(&("max_hops", "5")));
        assert!(baggage
            .iter()
            .any(|(key, value)| *key == "xid" && !value.is_empty()));
    }

    #[test]
    fn test_run_config_xid_is_fresh_per_trace() {
        let service = service();
        let first = service.run_config("example.org");
        let second = service.run_config("example.org");
        assert_ne!(first.xid, second.xid);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let service = service();
        let cancel = CancellationToken::new();
        cancel.cancel();
        service.run(cancel).await.unwrap();
    }
}
