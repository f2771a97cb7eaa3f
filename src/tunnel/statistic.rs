//! Traffic accounting
//!
//! Every established flow is wrapped in a tracker that feeds byte and
//! flow counters on a shared [`TrafficManager`]. Trackers deregister
//! themselves on drop.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::outbound::{BoxedStream, OutboundDatagram};

/// Shared traffic totals
#[derive(Debug, Default)]
pub struct TrafficManager {
    upload_total: AtomicU64,
    download_total: AtomicU64,
    active_flows: AtomicU64,
}

/// Point-in-time view of the totals
#[derive(Debug, Clone, Copy)]
pub struct TrafficSnapshot {
    /// Bytes moved toward remotes
    pub upload_total: u64,
    /// Bytes moved toward clients
    pub download_total: u64,
    /// Currently tracked flows
    pub active_flows: u64,
}

impl TrafficManager {
    /// Create zeroed totals
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self) {
        self.active_flows.fetch_add(1, Ordering::Relaxed);
    }

    fn deregister(&self) {
        self.active_flows.fetch_sub(1, Ordering::Relaxed);
    }

    fn add_upload(&self, bytes: u64) {
        self.upload_total.fetch_add(bytes, Ordering::Relaxed);
    }

    fn add_download(&self, bytes: u64) {
        self.download_total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshot the totals
    #[must_use]
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            upload_total: self.upload_total.load(Ordering::Relaxed),
            download_total: self.download_total.load(Ordering::Relaxed),
            active_flows: self.active_flows.load(Ordering::Relaxed),
        }
    }
}

/// Byte-counting wrapper over an outbound stream
pub struct TcpTracker {
    inner: BoxedStream,
    manager: Arc<TrafficManager>,
}

impl TcpTracker {
    /// Wrap `inner`, registering the flow
    #[must_use]
    pub fn new(inner: BoxedStream, manager: Arc<TrafficManager>) -> Self {
        manager.register();
        Self { inner, manager }
    }
}

impl Drop for TcpTracker {
    fn drop(&mut self) {
        self.manager.deregister();
    }
}

impl AsyncRead for TcpTracker {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = buf.filled().len() - before;
            self.manager.add_download(read as u64);
        }
        result
    }
}

impl AsyncWrite for TcpTracker {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.manager.add_upload(*n as u64);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Byte-counting wrapper over an outbound packet endpoint
pub struct UdpTracker {
    inner: Arc<dyn OutboundDatagram>,
    manager: Arc<TrafficManager>,
}

impl UdpTracker {
    /// Wrap `inner`, registering the flow
    #[must_use]
    pub fn new(inner: Arc<dyn OutboundDatagram>, manager: Arc<TrafficManager>) -> Self {
        manager.register();
        Self { inner, manager }
    }
}

impl Drop for UdpTracker {
    fn drop(&mut self) {
        self.manager.deregister();
    }
}

#[async_trait]
impl OutboundDatagram for UdpTracker {
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, dst).await?;
        self.manager.add_upload(n as u64);
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.inner.recv_from(buf).await?;
        self.manager.add_download(n as u64);
        Ok((n, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_tracker_counts() {
        let manager = Arc::new(TrafficManager::new());
        let (mut peer, local) = tokio::io::duplex(1024);

        {
            let mut tracker = TcpTracker::new(Box::new(local), Arc::clone(&manager));
            assert_eq!(manager.snapshot().active_flows, 1);

            tracker.write_all(b"12345").await.unwrap();
            peer.write_all(b"123").await.unwrap();

            let mut buf = [0u8; 3];
            tracker.read_exact(&mut buf).await.unwrap();
        }

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.upload_total, 5);
        assert_eq!(snapshot.download_total, 3);
        assert_eq!(snapshot.active_flows, 0);
    }

    #[tokio::test]
    async fn test_udp_tracker_counts() {
        use tokio::net::UdpSocket;

        struct Plain(UdpSocket);

        #[async_trait]
        impl OutboundDatagram for Plain {
            async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
                self.0.send_to(buf, dst).await
            }

            async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
                self.0.recv_from(buf).await
            }

            fn local_addr(&self) -> io::Result<SocketAddr> {
                self.0.local_addr()
            }
        }

        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let manager = Arc::new(TrafficManager::new());
        let tracker = UdpTracker::new(Arc::new(Plain(socket)), Arc::clone(&manager));

        tracker.send_to(b"ping", echo_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        echo.send_to(&buf[..n], from).await.unwrap();
        tracker.recv_from(&mut buf).await.unwrap();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.upload_total, 4);
        assert_eq!(snapshot.download_total, 4);

        drop(tracker);
        assert_eq!(manager.snapshot().active_flows, 0);
    }
}
