//! Peekable stream wrapper
//!
//! Inbound listeners hand the dispatcher an opaque stream, so protocol
//! sniffing cannot use a raw socket peek. [`BufferedStream`] fronts the
//! stream with a replay buffer: the sniffer fills the buffer and parses
//! it, and the splice later replays those bytes before reading from the
//! wire again. The peeked bytes are never lost.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Stream with a front replay buffer
pub struct BufferedStream<S> {
    inner: S,
    buffer: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BufferedStream<S> {
    /// Wrap a stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }

    /// Bytes currently buffered for replay
    #[must_use]
    pub fn peeked(&self) -> &[u8] {
        &self.buffer
    }

    /// Read from the wire until at least `n` bytes are buffered
    ///
    /// Stops early at EOF. Returns the buffered prefix, which may be
    /// shorter than `n`.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the underlying read.
    pub async fn fill_peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffer.len() < n {
            let mut chunk = [0u8; 2048];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(&self.buffer)
    }

    /// Unwrap the inner stream; buffered bytes are discarded
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffer.is_empty() {
            let n = self.buffer.len().min(buf.remaining());
            buf.put_slice(&self.buffer[..n]);
            self.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_peek_then_replay() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = client;
        client.write_all(b"hello world").await.unwrap();

        let mut stream = BufferedStream::new(server);
        let peeked = stream.fill_peek(5).await.unwrap();
        assert!(peeked.len() >= 5);
        assert_eq!(&peeked[..5], b"hello");

        // a subsequent read sees the peeked bytes first
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_peek_stops_at_eof() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = client;
        client.write_all(b"hi").await.unwrap();
        drop(client);

        let mut stream = BufferedStream::new(server);
        let peeked = stream.fill_peek(1024).await.unwrap();
        assert_eq!(peeked, b"hi");
    }

    #[tokio::test]
    async fn test_write_passthrough() {
        let (client, server) = tokio::io::duplex(64);
        let mut stream = BufferedStream::new(server);
        stream.write_all(b"reply").await.unwrap();

        let mut client = client;
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }
}
