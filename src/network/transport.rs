//! Datagram transport
//!
//! The connection only needs to bind sockets, send datagrams and receive
//! them. These traits keep that boundary explicit; [`UdpSockets`] is the
//! real implementation on top of `tokio::net::UdpSocket`.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// A bound datagram socket
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Creates the sockets a connection uses
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Socket for incoming traffic, bound to `addr`
    async fn bind_receiver(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>>;

    /// Socket for outgoing traffic towards `target`
    async fn bind_sender(&self, target: IpAddr) -> io::Result<Arc<dyn DatagramSocket>>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// UDP sockets from the tokio runtime
#[derive(Debug, Default, Clone)]
pub struct UdpSockets;

#[async_trait]
impl SocketFactory for UdpSockets {
    async fn bind_receiver(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(socket))
    }

    async fn bind_sender(&self, target: IpAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        let any: IpAddr = match target {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
        if target.is_ipv4() {
            // xAP is usually sent to the subnet broadcast address.
            socket.set_broadcast(true)?;
        }
        Ok(Arc::new(socket))
    }
}
