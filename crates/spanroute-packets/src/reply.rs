//! Inbound reply parsing using etherparse.
//!
//! Raw IPv4 sockets deliver whole IP datagrams, so every parser here starts
//! at the IP layer. Peer-originated garbage is never an error: anything that
//! does not look like a reply to one of our probes comes back as `None` and
//! is dropped by the caller.

use etherparse::{Icmpv4Slice, Icmpv4Type, IpNumber, Ipv4HeaderSlice, TcpHeaderSlice};
use tracing::trace;

/// ICMP Time Exceeded.
pub const ICMP_TIME_EXCEEDED: u8 = 11;
/// ICMP Destination Unreachable.
pub const ICMP_DEST_UNREACHABLE: u8 = 3;

/// Correlation key recovered from the quoted transport header inside an ICMP
/// error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Sequence number of the quoted TCP SYN.
    TcpSeq(u32),
    /// Source port of the quoted UDP datagram.
    UdpSourcePort(u16),
}

/// A parsed ICMP error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpReply {
    /// ICMP type: Time Exceeded (11) or Destination Unreachable (3).
    pub icmp_type: u8,
    /// Correlation key from the quoted original datagram.
    pub correlation: Correlation,
}

/// A direct TCP reply from the destination (SYN-ACK or RST).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpReply {
    /// Acknowledgement number; `ack - 1` matches the probe's sequence number.
    pub ack: u32,
    pub is_syn_ack: bool,
    pub is_rst: bool,
}

/// Parses an inbound ICMP datagram and extracts the correlation key from the
/// quoted original. Returns `None` for unrecognized ICMP types and malformed
/// or truncated bodies.
pub fn parse_icmp_reply(datagram: &[u8]) -> Option<IcmpReply> {
    let ip = Ipv4HeaderSlice::from_slice(datagram).ok()?;
    if ip.protocol() != IpNumber::ICMP {
        return None;
    }

    let icmp = Icmpv4Slice::from_slice(&datagram[ip.slice().len()..]).ok()?;
    let icmp_type = match icmp.icmp_type() {
        Icmpv4Type::TimeExceeded(_) => ICMP_TIME_EXCEEDED,
        Icmpv4Type::DestinationUnreachable(_) => ICMP_DEST_UNREACHABLE,
        other => {
            trace!(icmp_type = ?other, "ignoring icmp message of unhandled type");
            return None;
        }
    };

    // The body quotes the original IPv4 header plus the first 8 bytes of the
    // transport header. That is too short for a full TCP header slice, so the
    // transport fields are read positionally.
    let quoted = icmp.payload();
    let inner = Ipv4HeaderSlice::from_slice(quoted).ok()?;
    let transport = &quoted[inner.slice().len()..];

    let correlation = match inner.protocol() {
        IpNumber::TCP => Correlation::TcpSeq(quoted_tcp_seq(transport)?),
        IpNumber::UDP => Correlation::UdpSourcePort(quoted_udp_src_port(transport)?),
        _ => return None,
    };

    Some(IcmpReply {
        icmp_type,
        correlation,
    })
}

/// Sequence number from the first 8 quoted bytes of a TCP header.
fn quoted_tcp_seq(buf: &[u8]) -> Option<u32> {
    if buf.len() < 8 {
        return None;
    }
    Some(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]))
}

/// Source port from the first 8 quoted bytes of a UDP header.
fn quoted_udp_src_port(buf: &[u8]) -> Option<u16> {
    if buf.len() < 8 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Parses a direct TCP reply datagram. Returns `None` for non-TCP datagrams
/// and malformed headers; the caller is responsible for checking the peer.
pub fn parse_tcp_reply(datagram: &[u8]) -> Option<TcpReply> {
    let ip = Ipv4HeaderSlice::from_slice(datagram).ok()?;
    if ip.protocol() != IpNumber::TCP {
        return None;
    }

    let tcp = TcpHeaderSlice::from_slice(&datagram[ip.slice().len()..]).ok()?;
    Some(TcpReply {
        ack: tcp.acknowledgment_number(),
        is_syn_ack: tcp.syn() && tcp.ack(),
        is_rst: tcp.rst(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::build_syn_segment;
    use crate::udp::build_udp_datagram;
    use pnet_packet::ip::IpNextHeaderProtocol;
    use pnet_packet::ipv4::MutableIpv4Packet;
    use std::net::Ipv4Addr;

    const PROTO_ICMP: u8 = 1;
    const PROTO_TCP: u8 = 6;
    const PROTO_UDP: u8 = 17;

    fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, total_len: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; 20];
        let mut ip = MutableIpv4Packet::new(&mut buffer).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total_len as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocol::new(proto));
        ip.set_source(src);
        ip.set_destination(dst);
        let checksum = pnet_packet::ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
        buffer
    }

    /// Wraps the first 8 bytes of a probe's transport header in an ICMP error
    /// the way a router would: outer IP + ICMP header + quoted IP + 8 bytes.
    fn icmp_error(
        icmp_type: u8,
        router: Ipv4Addr,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        quoted_proto: u8,
        transport: &[u8],
    ) -> Vec<u8> {
        let quoted_transport = &transport[..8];
        let quoted_len = 20 + quoted_transport.len();
        let total_len = 20 + 8 + quoted_len;

        let mut datagram = ipv4_header(router, src, PROTO_ICMP, total_len);
        datagram.extend_from_slice(&[icmp_type, 0, 0, 0, 0, 0, 0, 0]);
        datagram.extend_from_slice(&ipv4_header(src, dst, quoted_proto, quoted_len));
        datagram.extend_from_slice(quoted_transport);
        datagram
    }

    #[test]
    fn test_tcp_probe_round_trip() {
        // Serialize a SYN probe, echo it back inside a Time Exceeded body, and
        // recover the original sequence number.
        let src: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let dst: Ipv4Addr = "8.8.8.8".parse().unwrap();
        let router: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let seq = 0xDEAD_BEEF;

        let segment = build_syn_segment(src, dst, 40000, 443, seq).unwrap();
        let datagram = icmp_error(ICMP_TIME_EXCEEDED, router, src, dst, PROTO_TCP, &segment);

        let reply = parse_icmp_reply(&datagram).unwrap();
        assert_eq!(reply.icmp_type, ICMP_TIME_EXCEEDED);
        assert_eq!(reply.correlation, Correlation::TcpSeq(seq));
    }

    #[test]
    fn test_udp_probe_round_trip() {
        let src: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let dst: Ipv4Addr = "8.8.8.8".parse().unwrap();

        let datagram = build_udp_datagram(src, dst, 51111, 33434).unwrap();
        let reply = parse_icmp_reply(&icmp_error(
            ICMP_DEST_UNREACHABLE,
            dst,
            src,
            dst,
            PROTO_UDP,
            &datagram,
        ))
        .unwrap();

        assert_eq!(reply.icmp_type, ICMP_DEST_UNREACHABLE);
        assert_eq!(reply.correlation, Correlation::UdpSourcePort(51111));
    }

    #[test]
    fn test_unhandled_icmp_type_ignored() {
        let src: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let dst: Ipv4Addr = "8.8.8.8".parse().unwrap();
        let segment = build_syn_segment(src, dst, 40000, 443, 7).unwrap();

        // Echo Reply (0) is not a traceroute reply.
        let datagram = icmp_error(0, dst, src, dst, PROTO_TCP, &segment);
        assert!(parse_icmp_reply(&datagram).is_none());
    }

    #[test]
    fn test_truncated_body_dropped() {
        let src: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let dst: Ipv4Addr = "8.8.8.8".parse().unwrap();
        let segment = build_syn_segment(src, dst, 40000, 443, 7).unwrap();

        let mut datagram =
            icmp_error(ICMP_TIME_EXCEEDED, dst, src, dst, PROTO_TCP, &segment);
        datagram.truncate(datagram.len() - 4);
        assert!(parse_icmp_reply(&datagram).is_none());

        // Not even a whole outer header.
        assert!(parse_icmp_reply(&datagram[..10]).is_none());
    }

    #[test]
    fn test_parse_direct_tcp_reply() {
        let dest: Ipv4Addr = "8.8.8.8".parse().unwrap();
        let local: Ipv4Addr = "192.168.1.10".parse().unwrap();

        // A SYN-ACK acknowledging seq 41.
        let mut segment = build_syn_segment(dest, local, 443, 40000, 9).unwrap();
        segment[8..12].copy_from_slice(&42u32.to_be_bytes());
        segment[13] = 0x12; // SYN|ACK

        let total_len = 20 + segment.len();
        let mut datagram = ipv4_header(dest, local, PROTO_TCP, total_len);
        datagram.extend_from_slice(&segment);

        let reply = parse_tcp_reply(&datagram).unwrap();
        assert!(reply.is_syn_ack);
        assert!(!reply.is_rst);
        assert_eq!(reply.ack, 42);
    }

    #[test]
    fn test_parse_tcp_reply_rejects_udp() {
        let src: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let dst: Ipv4Addr = "8.8.8.8".parse().unwrap();
        let udp = build_udp_datagram(src, dst, 51111, 33434).unwrap();

        let total_len = 20 + udp.len();
        let mut datagram = ipv4_header(src, dst, PROTO_UDP, total_len);
        datagram.extend_from_slice(&udp);
        assert!(parse_tcp_reply(&datagram).is_none());
    }
}
