//! UDP traceroute orchestrator.

use crate::listener;
use crate::registry::InflightProbe;
use crate::session::{dispatch_icmp, ProbeSession};
use rand::Rng;
use spanroute_core::{
    reduce_final_result, Attribute, Protocol, ResultTable, SpanKind, SpanStatus, TraceContext,
    TracerouteConfig, TracerouteError, TracerouteResult,
};
use spanroute_packets::{build_udp_datagram, local_source, RawSocket, Transport};
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit};

/// Source ports probe ids are drawn from.
const PROBE_ID_RANGE: RangeInclusive<u16> = 49152..=u16::MAX;

/// A single UDP traceroute run toward one destination.
///
/// Each probe carries its correlation id in the UDP source port, so the id
/// comes back inside the quoted datagram of any ICMP error. All replies
/// arrive on the ICMP socket; the destination answers with Destination
/// Unreachable.
pub struct UdpTraceroute {
    session: Arc<ProbeSession>,
}

impl UdpTraceroute {
    pub fn new(dest: Ipv4Addr, config: TracerouteConfig) -> TracerouteResult<Self> {
        config.validate()?;
        Ok(Self {
            session: ProbeSession::new(dest, config),
        })
    }

    /// Runs the traceroute against the real network.
    pub async fn start(&self) -> TracerouteResult<ResultTable> {
        let (src_ip, _) = local_source(self.session.dest)?;
        let probe_socket: Arc<dyn Transport> =
            Arc::new(RawSocket::probe(Protocol::Udp, src_ip)?);
        let icmp_socket: Arc<dyn Transport> = Arc::new(RawSocket::icmp()?);
        self.start_with_transports(src_ip, probe_socket, icmp_socket)
            .await
    }

    /// Runs the traceroute over caller-provided transports. The probe
    /// transport only sends; every reply arrives on the ICMP transport.
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
            &session.run_attributes(Protocol::Udp),
        );

        let icmp_rx = listener::spawn(icmp_transport, session.cancel.clone());
        let icmp_task = tokio::spawn(dispatch_icmp(session.clone(), icmp_rx, Protocol::Udp));
        let sweeper = session.spawn_sweeper();

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
        let _ = tokio::join!(icmp_task, sweeper);

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
            Attribute::string("protocol", "udp"),
        ],
    );

    if session.cancel.is_cancelled() {
        span.set_status(SpanStatus::Error, "cancelled");
        span.end();
        drop(permit);
        return;
    }

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

    // Register before sending; the probe id doubles as the source port and
    // is re-drawn while it collides with a live probe.
    let mut probe = InflightProbe {
        start: Instant::now(),
        ttl,
        span,
        permit,
    };
    let mut id: u16 = rand::thread_rng().gen_range(PROBE_ID_RANGE);
    loop {
        match session.registry.insert(u32::from(id), probe) {
            Ok(()) => break,
            Err(returned) => {
                probe = returned;
                id = rand::thread_rng().gen_range(PROBE_ID_RANGE);
            }
        }
    }

    let datagram = match build_udp_datagram(src_ip, session.dest, id, session.config.port) {
        Ok(datagram) => datagram,
        Err(err) => {
            if let Some(probe) = session.registry.take(u32::from(id)) {
                let mut span = probe.span;
                span.set_status(SpanStatus::Error, "failure");
                span.end();
            }
            session.set_fatal(err);
            return;
        }
    };

    if let Err(err) = transport.send_to(&datagram, IpAddr::V4(session.dest)) {
        if let Some(probe) = session.registry.take(u32::from(id)) {
            session.complete_send_failure(probe, &err);
        }
        return;
    }
    drop(guard);
}
