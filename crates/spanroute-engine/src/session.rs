//! Shared per-run state and completion paths.

use crate::limiter::ParallelLimiter;
use crate::listener::Datagram;
use crate::registry::{InflightProbe, InflightRegistry};
use spanroute_core::{
    Attribute, Protocol, ResultTable, SpanStatus, TracerouteConfig, TracerouteError, TracerouteHop,
};
use spanroute_packets::{parse_icmp_reply, parse_tcp_reply, Correlation, ICMP_TIME_EXCEEDED};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State shared by the send loop, listeners' dispatchers, and the timeout
/// sweeper for one traceroute run. The registry is the only cross-task
/// mutable state besides the mutex-guarded result table.
pub(crate) struct ProbeSession {
    pub config: TracerouteConfig,
    pub dest: Ipv4Addr,
    pub registry: InflightRegistry,
    pub limiter: ParallelLimiter,
    pub cancel: CancellationToken,
    results: Mutex<ResultTable>,
    reached_final: AtomicBool,
    fatal: Mutex<Option<TracerouteError>>,
}

impl ProbeSession {
    pub fn new(dest: Ipv4Addr, config: TracerouteConfig) -> Arc<Self> {
        let limiter = ParallelLimiter::new(config.parallel_requests);
        Arc::new(Self {
            dest,
            limiter,
            config,
            registry: InflightRegistry::new(),
            cancel: CancellationToken::new(),
            results: Mutex::new(ResultTable::new()),
            reached_final: AtomicBool::new(false),
            fatal: Mutex::new(None),
        })
    }

    pub fn span_name(&self) -> String {
        format!("{}/traceroute/{}", self.config.local_hostname, self.dest)
    }

    pub fn run_attributes(&self, protocol: Protocol) -> Vec<Attribute> {
        vec![
            Attribute::string("source", self.config.local_hostname.clone()),
            Attribute::string(
                "destination_hostname",
                self.config.destination_hostname.clone(),
            ),
            Attribute::i64("max_ttl", i64::from(self.config.max_hops)),
            Attribute::string("protocol", protocol.to_string()),
            Attribute::string("xid", self.config.xid.to_string()),
        ]
    }

    pub fn reached_final(&self) -> bool {
        self.reached_final.load(Ordering::Acquire)
    }

    pub fn mark_reached_final(&self) {
        self.reached_final.store(true, Ordering::Release);
    }

    pub fn add_hop(&self, ttl: u8, hop: TracerouteHop) {
        let mut results = self.results.lock().expect("results mutex poisoned");
        results.entry(ttl).or_default().push(hop);
    }

    pub fn take_results(&self) -> ResultTable {
        std::mem::take(&mut self.results.lock().expect("results mutex poisoned"))
    }

    /// Completes a probe whose reply arrived from `peer`. `reply` names the
    /// flavor of answer for the span (time_exceeded, destination_unreachable,
    /// syn_ack, rst).
    pub fn complete_reply(&self, probe: InflightProbe, peer: IpAddr, reply: &'static str) {
        let InflightProbe {
            start,
            ttl,
            mut span,
            permit,
        } = probe;
        let elapsed = start.elapsed();

        if peer == IpAddr::V4(self.dest) {
            self.mark_reached_final();
        }

        self.add_hop(
            ttl,
            TracerouteHop {
                success: true,
                address: Some(peer),
                ttl,
                rtt: Some(elapsed),
            },
        );

        span.set_attributes(&[
            Attribute::i64("ttl", i64::from(ttl)),
            Attribute::string("hop", peer.to_string()),
            Attribute::string("rtt", format!("{:?}", elapsed)),
            Attribute::string("reply", reply),
        ]);
        span.set_status(SpanStatus::Ok, "success");
        span.end();
        drop(permit);
    }

    /// Completes a probe whose reply never came.
    pub fn complete_timeout(&self, probe: InflightProbe) {
        let InflightProbe {
            start,
            ttl,
            mut span,
            permit,
        } = probe;

        self.add_hop(
            ttl,
            TracerouteHop {
                success: false,
                address: None,
                ttl,
                rtt: None,
            },
        );

        span.set_attributes(&[
            Attribute::i64("ttl", i64::from(ttl)),
            Attribute::string("hop", "null"),
            Attribute::string("rtt", format!("{:?}", start.elapsed())),
        ]);
        span.set_status(SpanStatus::Error, "timeout");
        span.end();
        drop(permit);
    }

    /// Completes a probe whose send failed. The run continues.
    pub fn complete_send_failure(&self, probe: InflightProbe, err: &io::Error) {
        let InflightProbe {
            ttl,
            mut span,
            permit,
            ..
        } = probe;
        warn!(ttl, error = %err, "probe send failed");

        self.add_hop(
            ttl,
            TracerouteHop {
                success: false,
                address: None,
                ttl,
                rtt: None,
            },
        );

        span.set_attributes(&[Attribute::i64("ttl", i64::from(ttl))]);
        span.set_status(SpanStatus::Error, "failure");
        span.end();
        drop(permit);
    }

    /// Records the first fatal error and cancels the run.
    pub fn set_fatal(&self, err: TracerouteError) {
        let mut fatal = self.fatal.lock().expect("fatal slot poisoned");
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.cancel.cancel();
    }

    pub fn take_fatal(&self) -> Option<TracerouteError> {
        self.fatal.lock().expect("fatal slot poisoned").take()
    }

    /// Abandons whatever is still in the registry, ending spans and freeing
    /// permits. Used when the run stops before its probes resolved.
    pub fn abort_inflight(&self) {
        let abandoned = self.registry.drain();
        if abandoned.is_empty() {
            return;
        }
        debug!(count = abandoned.len(), "abandoning outstanding probes");
        for probe in abandoned {
            let mut span = probe.span;
            span.set_status(SpanStatus::Error, "cancelled");
            span.end();
        }
    }

    /// Spawns the sweeper that expires stale probes every `timeout / 4`.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let period = (session.config.timeout / 4).max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        for probe in session.registry.sweep_expired(session.config.timeout) {
                            session.complete_timeout(probe);
                        }
                    }
                }
            }
        })
    }
}

/// Dispatches ICMP listener records: parse, correlate, complete. A key with
/// no registry entry is a late or foreign reply and is dropped, which also
/// makes duplicate replies harmless.
pub(crate) async fn dispatch_icmp(
    session: Arc<ProbeSession>,
    mut rx: mpsc::Receiver<io::Result<Datagram>>,
    protocol: Protocol,
) {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            record = rx.recv() => {
                let Some(record) = record else { return };
                let datagram = match record {
                    Ok(datagram) => datagram,
                    Err(err) => {
                        if !matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
                            debug!(error = %err, "icmp receive error");
                        }
                        continue;
                    }
                };
                let Some(reply) = parse_icmp_reply(&datagram.payload) else {
                    continue;
                };
                let key = match (protocol, reply.correlation) {
                    (Protocol::Tcp, Correlation::TcpSeq(seq)) => seq,
                    (Protocol::Udp, Correlation::UdpSourcePort(port)) => u32::from(port),
                    // The quoted transport is not ours.
                    _ => continue,
                };
                let Some(probe) = session.registry.take(key) else {
                    continue;
                };
                let kind = if reply.icmp_type == ICMP_TIME_EXCEEDED {
                    "time_exceeded"
                } else {
                    "destination_unreachable"
                };
                session.complete_reply(probe, datagram.peer, kind);
            }
        }
    }
}

/// Dispatches direct TCP replies (SYN-ACK or RST from the destination). The
/// acknowledgement number minus one recovers the probe's sequence number,
/// and an answer from the destination always means the path is complete.
pub(crate) async fn dispatch_tcp(
    session: Arc<ProbeSession>,
    mut rx: mpsc::Receiver<io::Result<Datagram>>,
) {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            record = rx.recv() => {
                let Some(record) = record else { return };
                let Ok(datagram) = record else { continue };
                if datagram.peer != IpAddr::V4(session.dest) {
                    continue;
                }
                let Some(reply) = parse_tcp_reply(&datagram.payload) else {
                    continue;
                };
                if !reply.is_syn_ack && !reply.is_rst {
                    continue;
                }
                let Some(probe) = session.registry.take(reply.ack.wrapping_sub(1)) else {
                    continue;
                };
                session.mark_reached_final();
                let kind = if reply.is_syn_ack { "syn_ack" } else { "rst" };
                session.complete_reply(probe, datagram.peer, kind);
            }
        }
    }
}
