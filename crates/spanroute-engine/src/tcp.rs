//! TCP SYN traceroute orchestrator.

use crate::listener;
use crate::registry::InflightProbe;
use crate::session::{dispatch_icmp, dispatch_tcp, ProbeSession};
use rand::Rng;
use spanroute_core::{
    reduce_final_result, Attribute, Protocol, ResultTable, SpanKind, SpanStatus, TraceContext,
    TracerouteConfig, TracerouteError, TracerouteHop, TracerouteResult,
};
use spanroute_packets::{build_syn_segment, local_source, RawSocket, Transport};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tracing::warn;

/// A single TCP traceroute run toward one destination.
///
/// Probes are raw SYN segments whose sequence number is the correlation key.
/// Replies arrive on two sockets: ICMP errors from intermediate routers and
/// direct SYN-ACK/RST answers from the destination.
pub struct TcpTraceroute {
    session: Arc<ProbeSession>,
}

impl TcpTraceroute {
    pub fn new(dest: Ipv4Addr, config: TracerouteConfig) -> TracerouteResult<Self> {
        config.validate()?;
        Ok(Self {
            session: ProbeSession::new(dest, config),
        })
    }

    /// Runs the traceroute against the real network: discovers the local
    /// source address, opens the raw TCP and ICMP sockets, and drives the
    /// run to completion.
    pub async fn start(&self) -> TracerouteResult<ResultTable> {
        let (src_ip, _) = local_source(self.session.dest)?;
        let probe_socket: Arc<dyn Transport> =
            Arc::new(RawSocket::probe(Protocol::Tcp, src_ip)?);
        let icmp_socket: Arc<dyn Transport> = Arc::new(RawSocket::icmp()?);
        self.start_with_transports(src_ip, probe_socket, icmp_socket)
            .await
    }

    /// Runs the traceroute over caller-provided transports. The probe
    /// transport both sends SYN probes and receives direct TCP replies; the
    /// ICMP transport only receives.
    pub async fn start_with_transports(
        &self,
        src_ip: Ipv4Addr,
        probe_transport: Arc<dyn Transport>,
        icmp_transport: Arc<dyn Transport>,
    ) -> TracerouteResult<ResultTable> {
        let session = &self.session;
        let config = &session.config;
        let tracer = config.tracer.clone();

        let (mut parent, parent_ctx) = tracer.start_span(
            &config.trace_ctx,
            &session.span_name(),
            SpanKind::Client,
            &session.run_attributes(Protocol::Tcp),
        );

        let icmp_rx = listener::spawn(icmp_transport, session.cancel.clone());
        let tcp_rx = listener::spawn(probe_transport.clone(), session.cancel.clone());
        let icmp_task = tokio::spawn(dispatch_icmp(session.clone(), icmp_rx, Protocol::Tcp));
        let tcp_task = tokio::spawn(dispatch_tcp(session.clone(), tcp_rx));
        let sweeper = session.spawn_sweeper();

        // Sends serialize with the per-send TTL option so concurrent probes
        // cannot interfere with each other's TTL.
        let send_lock = Arc::new(Mutex::new(()));

        'send: for ttl in 1..=config.max_hops {
            if session.reached_final() {
                break;
            }
            for _ in 0..config.num_measurements {
                let permit = tokio::select! {
                    _ = session.cancel.cancelled() => break 'send,
                    permit = session.limiter.acquire() => permit,
                };
                tokio::spawn(send_probe(
                    session.clone(),
                    probe_transport.clone(),
                    send_lock.clone(),
                    parent_ctx.clone(),
                    src_ip,
                    ttl,
                    permit,
                ));
            }
        }

        // Join outstanding probes; on cancellation abandon whatever is left
        // so spans and permits are not leaked. The drain loops because a
        // send task still past its cancellation check may register one more
        // probe after a drain.
        tokio::select! {
            _ = session.limiter.wait_idle() => {}
            _ = session.cancel.cancelled() => loop {
                session.abort_inflight();
                let idle = tokio::time::timeout(
                    std::time::Duration::from_millis(50),
                    session.limiter.wait_idle(),
                );
                if idle.await.is_ok() {
                    break;
                }
            },
        }
        session.cancel.cancel();
        let _ = tokio::join!(icmp_task, tcp_task, sweeper);

        if let Some(err) = session.take_fatal() {
            parent.set_status(SpanStatus::Error, &err.to_string());
            parent.end();
            return Err(err);
        }

        let table = reduce_final_result(session.take_results(), IpAddr::V4(session.dest));
        parent.set_status(SpanStatus::Ok, "success");
        parent.end();
        Ok(table)
    }
}

async fn send_probe(
    session: Arc<ProbeSession>,
    transport: Arc<dyn Transport>,
    send_lock: Arc<Mutex<()>>,
    parent_ctx: TraceContext,
    src_ip: Ipv4Addr,
    ttl: u8,
    permit: OwnedSemaphorePermit,
) {
    let tracer = session.config.tracer.clone();
    let (mut span, _ctx) = tracer.start_span(
        &parent_ctx,
        &session.span_name(),
        SpanKind::Client,
        &[
            Attribute::i64("ttl", i64::from(ttl)),
            Attribute::string("protocol", "tcp"),
        ],
    );

    if session.cancel.is_cancelled() {
        span.set_status(SpanStatus::Error, "cancelled");
        span.end();
        drop(permit);
        return;
    }

    // OS-assigned ephemeral source port for this probe.
    let src_port = match local_source(session.dest) {
        Ok((_, port)) => port,
        Err(err) => {
            warn!(ttl, error = %err, "failed to allocate probe source port");
            session.add_hop(
                ttl,
                TracerouteHop {
                    success: false,
                    address: None,
                    ttl,
                    rtt: None,
                },
            );
            span.set_status(SpanStatus::Error, "failure");
            span.end();
            drop(permit);
            return;
        }
    };

    let guard = send_lock.lock().await;

    if let Err(err) = transport.set_ttl(u32::from(ttl)) {
        span.set_status(SpanStatus::Error, "failure");
        span.end();
        drop(permit);
        session.set_fatal(TracerouteError::Internal(format!(
            "failed to set probe ttl: {}",
            err
        )));
        return;
    }

    // Register before sending so a reply racing back always finds its probe.
    // The sequence number is re-drawn while it collides with a live probe.
    let mut probe = InflightProbe {
        start: Instant::now(),
        ttl,
        span,
        permit,
    };
    let mut seq = rand::thread_rng().gen::<u32>();
    loop {
        match session.registry.insert(seq, probe) {
            Ok(()) => break,
            Err(returned) => {
                probe = returned;
                seq = rand::thread_rng().gen();
            }
        }
    }

    let segment = match build_syn_segment(src_ip, session.dest, src_port, session.config.port, seq)
    {
        Ok(segment) => segment,
        Err(err) => {
            if let Some(probe) = session.registry.take(seq) {
                let mut span = probe.span;
                span.set_status(SpanStatus::Error, "failure");
                span.end();
            }
            session.set_fatal(err);
            return;
        }
    };

    if let Err(err) = transport.send_to(&segment, IpAddr::V4(session.dest)) {
        if let Some(probe) = session.registry.take(seq) {
            session.complete_send_failure(probe, &err);
        }
        return;
    }
    drop(guard);
}
