//! Datagram transport and source-address resolution seams.
//!
//! The engine only sees these traits so tests can swap in lossy or
//! short-writing transports, and simulated NAT via a resolver that declares a
//! source address the network will not actually use.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Port used when asking the kernel for a route. Nothing is ever sent to it.
const ROUTE_PROBE_PORT: u16 = 9;

#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Returns the number of bytes actually written.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Cancel-safe: dropping the future loses no datagram.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// UDP socket bound to the NAT discovery port.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(addr = %socket.local_addr()?, "nat: discovery socket bound");
        Ok(Self { socket })
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Picks the local address a request to `dst` should declare as its source.
pub trait SourceResolver: Send + Sync {
    fn source_for(&self, dst: IpAddr) -> Option<IpAddr>;
}

/// Asks the kernel routing table: connect an unbound UDP socket to the
/// destination and read back the chosen local address. No packet is sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteSourceResolver;

impl SourceResolver for RouteSourceResolver {
    fn source_for(&self, dst: IpAddr) -> Option<IpAddr> {
        let unspecified: IpAddr = match dst {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };

        let result = std::net::UdpSocket::bind((unspecified, 0))
            .and_then(|socket| {
                socket.connect((dst, ROUTE_PROBE_PORT))?;
                socket.local_addr()
            })
            .map(|addr| addr.ip());

        match result {
            Ok(ip) if !ip.is_unspecified() => Some(ip),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(%dst, "nat: no route to destination: {e}");
                None
            }
        }
    }
}

/// Always declares the same source address.
#[derive(Debug, Clone, Copy)]
pub struct FixedSourceResolver(pub Option<IpAddr>);

impl SourceResolver for FixedSourceResolver {
    fn source_for(&self, _dst: IpAddr) -> Option<IpAddr> {
        self.0
    }
}
