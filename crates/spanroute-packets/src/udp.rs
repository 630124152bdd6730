//! UDP probe construction using pnet.

use pnet_packet::udp::MutableUdpPacket;
use spanroute_core::TracerouteError;
use std::net::Ipv4Addr;

/// Signature payload carried in UDP probes.
pub const UDP_SIGNATURE: &[u8] = b"SPANRT";

const UDP_HEADER_LEN: usize = 8;

/// Builds a UDP datagram for a traceroute probe.
///
/// The source port carries the probe's correlation id: an ICMP error quotes
/// the first 8 bytes of this header, which is the whole of it, so the id
/// comes back in the quote. No IPv4 header and no TTL are serialized here.
pub fn build_udp_datagram(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> Result<Vec<u8>, TracerouteError> {
    let udp_len = UDP_HEADER_LEN + UDP_SIGNATURE.len();
    let mut buffer = vec![0u8; udp_len];

    let mut udp = MutableUdpPacket::new(&mut buffer).ok_or_else(|| {
        TracerouteError::PacketBuild("UDP header does not fit probe buffer".to_string())
    })?;

    udp.set_source(src_port);
    udp.set_destination(dst_port);
    udp.set_length(udp_len as u16);
    udp.set_payload(UDP_SIGNATURE);

    let checksum = pnet_packet::udp::ipv4_checksum(&udp.to_immutable(), &src_ip, &dst_ip);
    udp.set_checksum(checksum);

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_udp_datagram() {
        let src_ip: Ipv4Addr = "192.168.1.1".parse().unwrap();
        let dst_ip: Ipv4Addr = "8.8.8.8".parse().unwrap();

        let datagram = build_udp_datagram(src_ip, dst_ip, 50123, 33434).unwrap();
        assert_eq!(datagram.len(), 8 + UDP_SIGNATURE.len());

        // The correlation id sits in the source-port field.
        assert_eq!(u16::from_be_bytes([datagram[0], datagram[1]]), 50123);
        assert_eq!(u16::from_be_bytes([datagram[2], datagram[3]]), 33434);
        assert_eq!(
            u16::from_be_bytes([datagram[4], datagram[5]]) as usize,
            datagram.len()
        );
        assert_eq!(&datagram[8..], UDP_SIGNATURE);
    }
}
