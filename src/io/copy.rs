//! Bidirectional splice
//!
//! Shuttles bytes between the inbound and outbound sides of a TCP flow
//! until either side closes or errors.

use std::io;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};

/// Bytes moved by a completed splice
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    /// Bytes moved inbound → outbound
    pub client_to_remote: u64,
    /// Bytes moved outbound → inbound
    pub remote_to_client: u64,
}

impl CopyResult {
    /// Total bytes moved in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_remote + self.remote_to_client
    }
}

/// Splice `client` and `remote` until one direction finishes
///
/// A half-close propagates as a shutdown of the opposite writer; the
/// splice completes when both directions are done.
///
/// # Errors
///
/// Returns the first I/O error from either side.
pub async fn relay<A, B>(client: &mut A, remote: &mut B) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (client_to_remote, remote_to_client) = copy_bidirectional(client, remote).await?;
    Ok(CopyResult {
        client_to_remote,
        remote_to_client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_moves_both_directions() {
        let (mut client_side, mut dispatcher_client) = tokio::io::duplex(256);
        let (mut remote_side, mut dispatcher_remote) = tokio::io::duplex(256);

        let splice =
            tokio::spawn(
                async move { relay(&mut dispatcher_client, &mut dispatcher_remote).await },
            );

        client_side.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        remote_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        remote_side.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        drop(client_side);
        drop(remote_side);
        let result = splice.await.unwrap().unwrap();
        assert_eq!(result.client_to_remote, 7);
        assert_eq!(result.remote_to_client, 9);
        assert_eq!(result.total(), 16);
    }
}
