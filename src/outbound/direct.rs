//! Direct outbound
//!
//! Dials the destination itself. Hostname destinations are resolved
//! through the resolver's real-address path (fake-IP flows arrive here
//! with the hostname authoritative), so the adapter can dial flows the
//! rule engine matched on host-only criteria.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

use crate::error::OutboundError;
use crate::metadata::Metadata;
use crate::resolver::Resolver;

use super::traits::{BoxedStream, Outbound, OutboundDatagram, OutboundKind};

/// Direct dial adapter
pub struct Direct {
    name: String,
    resolver: Arc<Resolver>,
}

impl Direct {
    /// Standard adapter name
    pub const NAME: &'static str = "DIRECT";

    /// Create the adapter
    #[must_use]
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            name: Self::NAME.to_string(),
            resolver,
        }
    }

    async fn dest_addr(&self, metadata: &Metadata) -> Result<SocketAddr, OutboundError> {
        if let Some(addr) = metadata.dst_addr() {
            return Ok(addr);
        }
        let ip = self.resolver.resolve_real_ip(&metadata.host).await?;
        Ok(SocketAddr::new(ip, metadata.dst_port))
    }
}

#[async_trait]
impl Outbound for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Direct
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<BoxedStream, OutboundError> {
        let addr = self.dest_addr(metadata).await?;
        trace!(dest = %addr, "direct tcp dial");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| OutboundError::connection_failed(addr.to_string(), e.to_string()))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }

    async fn listen_packet(
        &self,
        metadata: &Metadata,
    ) -> Result<Arc<dyn OutboundDatagram>, OutboundError> {
        let bind: SocketAddr = match metadata.dst_ip {
            Some(ip) if ip.is_ipv6() => "[::]:0".parse().expect("literal parses"),
            _ => "0.0.0.0:0".parse().expect("literal parses"),
        };
        let socket = UdpSocket::bind(bind).await?;
        trace!(local = ?socket.local_addr().ok(), "direct udp socket");
        Ok(Arc::new(DirectDatagram { socket }))
    }
}

/// Unconnected UDP socket for one direct flow
struct DirectDatagram {
    socket: UdpSocket,
}

#[async_trait]
impl OutboundDatagram for DirectDatagram {
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, dst).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;

    fn direct() -> Direct {
        Direct::new(Arc::new(Resolver::builder().build()))
    }

    #[tokio::test]
    async fn test_dial_tcp_by_ip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let metadata = Metadata::ip(Network::Tcp, addr.ip(), addr.port());
        let dial = tokio::spawn(async move { direct().dial_tcp(&metadata).await });

        let (_server, _) = listener.accept().await.unwrap();
        assert!(dial.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dial_tcp_refused() {
        // bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let metadata = Metadata::ip(Network::Tcp, addr.ip(), addr.port());
        match direct().dial_tcp(&metadata).await {
            Err(err) => assert!(matches!(err, OutboundError::ConnectionFailed { .. })),
            Ok(_) => panic!("expected dial_tcp to fail"),
        }
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let metadata = Metadata::ip(Network::Udp, echo_addr.ip(), echo_addr.port());
        let pc = direct().listen_packet(&metadata).await.unwrap();

        pc.send_to(b"ping", echo_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        echo.send_to(b"pong", from).await.unwrap();

        let (n, from) = pc.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, echo_addr);
    }
}
