//! Probe construction, reply parsing, and raw-socket transport.
//!
//! Outbound probes are built with `pnet_packet` (transport header only; the
//! kernel prepends the IPv4 header and the per-probe TTL is applied as a
//! socket option at send time). Inbound datagrams are parsed with
//! `etherparse` header slices starting at the IP layer, which is what Linux
//! raw sockets deliver.

pub mod reply;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use reply::{
    parse_icmp_reply, parse_tcp_reply, Correlation, IcmpReply, TcpReply, ICMP_DEST_UNREACHABLE,
    ICMP_TIME_EXCEEDED,
};
pub use socket::{local_source, RawSocket, Transport};
pub use tcp::{build_syn_segment, TCP_WINDOW_SIZE};
pub use udp::{build_udp_datagram, UDP_SIGNATURE};
