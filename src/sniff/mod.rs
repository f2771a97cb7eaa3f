//! Protocol sniffing
//!
//! Recovers an application-layer destination host from the first bytes
//! of a TCP stream: TLS `ClientHello` SNI and HTTP/1.x `Host`. The
//! dispatcher runs [`SnifferDispatcher::tcp_sniff`] over the peeked
//! prefix before rule matching; a successful sniff overwrites the
//! flow's `host` and clears any speculative destination address so the
//! rules and the outbound dial operate on the hostname. Failure is
//! silent and leaves the metadata untouched.

pub mod http;
pub mod tls;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::io::BufferedStream;
use crate::metadata::{AddrType, Metadata};

pub use http::{looks_like_http, sniff_http_host};
pub use tls::{looks_like_tls, sniff_tls_sni};

/// Default bound on how long a sniff may wait for payload
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(300);

/// How much of an HTTP request head is peeked
const HTTP_PEEK_LEN: usize = 4096;

/// Sniffer front-end used by the dispatcher
#[derive(Debug, Clone)]
pub struct SnifferDispatcher {
    enable: bool,
    peek_timeout: Duration,
}

impl SnifferDispatcher {
    /// Create a sniffer; a disabled sniffer never touches the stream
    #[must_use]
    pub fn new(enable: bool) -> Self {
        Self {
            enable,
            peek_timeout: DEFAULT_SNIFF_TIMEOUT,
        }
    }

    /// Override the peek timeout
    #[must_use]
    pub const fn with_timeout(mut self, peek_timeout: Duration) -> Self {
        self.peek_timeout = peek_timeout;
        self
    }

    /// Whether sniffing is active
    #[must_use]
    pub const fn enable(&self) -> bool {
        self.enable
    }

    /// Sniff the stream's first bytes into the metadata
    ///
    /// Peeks without consuming: the bytes stay queued in the buffered
    /// stream for the later splice. A slow or silent client runs the
    /// peek into its timeout and the flow proceeds unsniffed.
    pub async fn tcp_sniff<S>(&self, stream: &mut BufferedStream<S>, metadata: &mut Metadata)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !self.enable {
            return;
        }

        let Ok(host) = timeout(self.peek_timeout, Self::peek_host(stream)).await else {
            trace!(flow = %metadata, "sniff timed out");
            return;
        };

        if let Some(host) = host {
            debug!(flow = %metadata, sniffed = %host, "sniffed destination host");
            metadata.host = host;
            metadata.addr_type = AddrType::Domain;
            // the sniffed hostname supersedes any speculative address
            metadata.dst_ip = None;
        }
    }

    async fn peek_host<S>(stream: &mut BufferedStream<S>) -> Option<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let probe = stream.fill_peek(tls::RECORD_PROBE_LEN).await.ok()?.to_vec();
        if probe.is_empty() {
            return None;
        }

        if let Some(needed) = tls::required_len(&probe) {
            let record = stream.fill_peek(needed).await.ok()?;
            return sniff_tls_sni(record);
        }

        if looks_like_http(&probe) {
            let request = stream.fill_peek(HTTP_PEEK_LEN).await.ok()?;
            return sniff_http_host(request);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;
    use tokio::io::AsyncWriteExt;

    async fn sniff_bytes(data: &[u8], metadata: &mut Metadata) {
        let (mut client, server) = tokio::io::duplex(32 * 1024);
        client.write_all(data).await.unwrap();
        drop(client);

        let mut stream = BufferedStream::new(server);
        SnifferDispatcher::new(true)
            .tcp_sniff(&mut stream, metadata)
            .await;
    }

    #[tokio::test]
    async fn test_tls_sniff_overwrites_host() {
        let mut metadata = Metadata::ip(Network::Tcp, "1.2.3.4".parse().unwrap(), 443);
        let hello = tls::tests::client_hello("real.example.com");
        sniff_bytes(&hello, &mut metadata).await;

        assert_eq!(metadata.host, "real.example.com");
        assert_eq!(metadata.addr_type, AddrType::Domain);
        // never populates, only clears
        assert_eq!(metadata.dst_ip, None);
    }

    #[tokio::test]
    async fn test_http_sniff() {
        let mut metadata = Metadata::ip(Network::Tcp, "1.2.3.4".parse().unwrap(), 80);
        sniff_bytes(
            b"GET / HTTP/1.1\r\nHost: plain.example.com\r\n\r\n",
            &mut metadata,
        )
        .await;

        assert_eq!(metadata.host, "plain.example.com");
        assert_eq!(metadata.dst_ip, None);
    }

    #[tokio::test]
    async fn test_sniff_failure_is_silent() {
        let original_ip = "1.2.3.4".parse().unwrap();
        let mut metadata = Metadata::ip(Network::Tcp, original_ip, 22);
        sniff_bytes(b"SSH-2.0-OpenSSH_9.6\r\n", &mut metadata).await;

        assert_eq!(metadata.host, "");
        assert_eq!(metadata.dst_ip, Some(original_ip));
    }

    #[tokio::test]
    async fn test_disabled_sniffer_leaves_stream_untouched() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"data").await.unwrap();

        let mut metadata = Metadata::ip(Network::Tcp, "1.2.3.4".parse().unwrap(), 443);
        let mut stream = BufferedStream::new(server);
        SnifferDispatcher::new(false)
            .tcp_sniff(&mut stream, &mut metadata)
            .await;

        assert!(stream.peeked().is_empty());
        assert_eq!(metadata.host, "");
    }

    #[tokio::test]
    async fn test_sniff_times_out_on_silent_client() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut metadata = Metadata::ip(Network::Tcp, "1.2.3.4".parse().unwrap(), 443);
        let mut stream = BufferedStream::new(server);

        let sniffer = SnifferDispatcher::new(true).with_timeout(Duration::from_millis(20));
        sniffer.tcp_sniff(&mut stream, &mut metadata).await;
        assert_eq!(metadata.host, "");
    }
}
