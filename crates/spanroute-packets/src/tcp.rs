//! TCP SYN probe construction using pnet.

use pnet_packet::tcp::{MutableTcpPacket, TcpFlags};
use spanroute_core::TracerouteError;
use std::net::Ipv4Addr;

/// TCP window size advertised in SYN probes.
pub const TCP_WINDOW_SIZE: u16 = 14600;

const TCP_HEADER_LEN: usize = 20;

/// Builds a TCP SYN segment for a traceroute probe.
///
/// The sequence number is the probe's correlation key: routers quote the
/// first 8 bytes of this header in their ICMP errors, and the destination
/// acknowledges `seq + 1` in its SYN-ACK. The segment carries no IPv4 header
/// and no TTL; both belong to the sending socket.
pub fn build_syn_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
) -> Result<Vec<u8>, TracerouteError> {
    let mut buffer = vec![0u8; TCP_HEADER_LEN];

    let mut tcp = MutableTcpPacket::new(&mut buffer).ok_or_else(|| {
        TracerouteError::PacketBuild("TCP header does not fit probe buffer".to_string())
    })?;

    tcp.set_source(src_port);
    tcp.set_destination(dst_port);
    tcp.set_sequence(seq);
    tcp.set_acknowledgement(0);
    tcp.set_data_offset(5); // 5 * 4 = 20 bytes, no options
    tcp.set_flags(TcpFlags::SYN);
    tcp.set_window(TCP_WINDOW_SIZE);
    tcp.set_urgent_ptr(0);

    let checksum = pnet_packet::tcp::ipv4_checksum(&tcp.to_immutable(), &src_ip, &dst_ip);
    tcp.set_checksum(checksum);

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_syn_segment() {
        let src_ip: Ipv4Addr = "192.168.1.1".parse().unwrap();
        let dst_ip: Ipv4Addr = "8.8.8.8".parse().unwrap();

        let segment = build_syn_segment(src_ip, dst_ip, 54321, 443, 0x1234_5678).unwrap();
        assert_eq!(segment.len(), 20);

        // Ports
        assert_eq!(u16::from_be_bytes([segment[0], segment[1]]), 54321);
        assert_eq!(u16::from_be_bytes([segment[2], segment[3]]), 443);

        // Sequence number round-trips through the wire layout
        let seq = u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]);
        assert_eq!(seq, 0x1234_5678);

        // SYN flag only
        assert_eq!(segment[13] & 0x3f, 0x02);

        // Window
        assert_eq!(u16::from_be_bytes([segment[14], segment[15]]), 14600);
    }

    #[test]
    fn test_checksum_depends_on_pseudo_header() {
        let src_ip: Ipv4Addr = "192.168.1.1".parse().unwrap();
        let a = build_syn_segment(src_ip, "8.8.8.8".parse().unwrap(), 1000, 80, 1).unwrap();
        let b = build_syn_segment(src_ip, "8.8.4.4".parse().unwrap(), 1000, 80, 1).unwrap();
        assert_ne!(
            u16::from_be_bytes([a[16], a[17]]),
            u16::from_be_bytes([b[16], b[17]])
        );
    }
}
