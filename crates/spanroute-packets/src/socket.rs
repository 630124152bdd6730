//! Raw-socket transport.
//!
//! The engine talks to the network through the [`Transport`] trait so the
//! whole probe/reply path can be exercised against a simulated network in
//! tests. [`RawSocket`] is the real implementation: blocking socket2 raw
//! sockets, one per protocol, with the per-probe TTL applied as a socket
//! option.

use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use spanroute_core::{Protocol, TracerouteError};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Blocking datagram transport used by listeners and the send path.
pub trait Transport: Send + Sync {
    /// Sets the deadline applied to subsequent [`Transport::recv_from`] calls.
    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()>;

    /// Receives one datagram, returning the number of bytes and the peer.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)>;

    /// Sets the TTL applied to subsequent [`Transport::send_to`] calls.
    fn set_ttl(&self, ttl: u32) -> io::Result<()>;

    /// Sends one datagram to the peer.
    fn send_to(&self, buf: &[u8], dst: IpAddr) -> io::Result<usize>;
}

/// A raw IPv4 socket.
pub struct RawSocket {
    inner: Socket,
}

impl RawSocket {
    /// Opens the probe socket for the given protocol, bound to the local
    /// source address. Used for sending TTL-scoped probes and, for TCP,
    /// receiving direct replies from the destination.
    pub fn probe(protocol: Protocol, bind: Ipv4Addr) -> Result<Self, TracerouteError> {
        let (label, proto) = match protocol {
            Protocol::Tcp => ("tcp", SockProtocol::TCP),
            Protocol::Udp => ("udp", SockProtocol::UDP),
        };
        let socket = Self::open(label, proto)?;
        socket
            .inner
            .bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(bind), 0)))
            .map_err(|source| TracerouteError::SocketBind {
                addr: IpAddr::V4(bind),
                source,
            })?;
        Ok(socket)
    }

    /// Opens the ICMP socket bound to the wildcard address.
    pub fn icmp() -> Result<Self, TracerouteError> {
        let socket = Self::open("icmp", SockProtocol::ICMPV4)?;
        let wildcard = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        socket
            .inner
            .bind(&SockAddr::from(SocketAddr::new(wildcard, 0)))
            .map_err(|source| TracerouteError::SocketBind {
                addr: wildcard,
                source,
            })?;
        Ok(socket)
    }

    fn open(label: &'static str, proto: SockProtocol) -> Result<Self, TracerouteError> {
        match Socket::new(Domain::IPV4, Type::RAW, Some(proto)) {
            Ok(inner) => Ok(Self { inner }),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                Err(TracerouteError::RawSocketPermission { proto: label })
            }
            Err(source) => Err(TracerouteError::SocketCreation {
                proto: label,
                source,
            }),
        }
    }
}

impl Transport for RawSocket {
    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.inner.set_read_timeout(Some(timeout))
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        // socket2's recv_from requires an uninit buffer
        let mut recv_buf = vec![MaybeUninit::<u8>::uninit(); buf.len()];
        let (n, peer) = self.inner.recv_from(&mut recv_buf)?;
        for (dst, src) in buf.iter_mut().zip(&recv_buf[..n]) {
            // Initialized by the kernel up to n.
            *dst = unsafe { src.assume_init() };
        }
        let peer = peer
            .as_socket()
            .map(|addr| addr.ip())
            .ok_or_else(|| io::Error::other("peer address is not an inet address"))?;
        Ok((n, peer))
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.inner.set_ttl(ttl)
    }

    fn send_to(&self, buf: &[u8], dst: IpAddr) -> io::Result<usize> {
        // The port is ignored on raw sockets; the transport header carries it.
        self.inner
            .send_to(buf, &SockAddr::from(SocketAddr::new(dst, 0)))
    }
}

/// Discovers the local endpoint the kernel routes toward `dest`: a throwaway
/// UDP socket is connected to the destination and its local address read
/// back. The port doubles as the probe's ephemeral source port.
pub fn local_source(dest: Ipv4Addr) -> Result<(Ipv4Addr, u16), TracerouteError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(TracerouteError::SourceIpDiscovery)?;
    socket
        .connect(SocketAddr::new(IpAddr::V4(dest), 33434))
        .map_err(TracerouteError::SourceIpDiscovery)?;
    let local = socket
        .local_addr()
        .map_err(TracerouteError::SourceIpDiscovery)?;
    match local.ip() {
        IpAddr::V4(ip) => Ok((ip, local.port())),
        IpAddr::V6(_) => Err(TracerouteError::Internal(
            "local endpoint is not IPv4".to_string(),
        )),
    }
}
