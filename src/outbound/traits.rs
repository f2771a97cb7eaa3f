//! Outbound trait definitions
//!
//! Every outbound adapter implements [`Outbound`]: a TCP dial, a UDP
//! packet-conn factory, and identity accessors. Group adapters expose
//! their current delegate through [`Outbound::unwrap_inner`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::OutboundError;
use crate::metadata::Metadata;

/// Object-safe async stream for spliced connections
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// Boxed stream returned by [`Outbound::dial_tcp`]
pub type BoxedStream = Box<dyn ProxyStream>;

/// Outbound UDP endpoint for one flow
///
/// Implementations are shared between the NAT table and the reverse
/// relay; all methods take `&self`.
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
    /// Send a datagram to `dst`
    async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;

    /// Receive a datagram, returning its length and source
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Local address of the outbound socket
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Adapter category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    /// Dials the destination itself
    Direct,
    /// Refuses every flow
    Reject,
    /// Skipped by the rule engine; matching continues
    Pass,
    /// Group delegating to a selected member
    Selector,
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "Direct"),
            Self::Reject => write!(f, "Reject"),
            Self::Pass => write!(f, "Pass"),
            Self::Selector => write!(f, "Selector"),
        }
    }
}

/// Outbound adapter interface
///
/// Adapters are safe to call concurrently; one adapter serves every
/// flow routed to it.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Unique adapter name, referenced by rules
    fn name(&self) -> &str;

    /// Adapter category
    fn kind(&self) -> OutboundKind;

    /// Whether UDP flows may be routed here
    fn supports_udp(&self) -> bool;

    /// Open a stream to the flow's destination
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<BoxedStream, OutboundError>;

    /// Open a packet endpoint for the flow
    async fn listen_packet(
        &self,
        metadata: &Metadata,
    ) -> Result<Arc<dyn OutboundDatagram>, OutboundError>;

    /// The delegate a group adapter currently forwards to
    ///
    /// `None` for leaf adapters.
    fn unwrap_inner(&self, _metadata: &Metadata) -> Option<Arc<dyn Outbound>> {
        None
    }
}
