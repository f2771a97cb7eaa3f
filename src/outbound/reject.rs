//! Reject and pass adapters
//!
//! `Reject` terminates every flow routed to it. `Pass` is never dialed:
//! the rule engine treats a match routing to a pass adapter as a
//! non-match and keeps iterating, which lets a rule list punch holes in
//! broader rules below it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OutboundError;
use crate::metadata::Metadata;

use super::traits::{BoxedStream, Outbound, OutboundDatagram, OutboundKind};

/// Flow-terminating adapter
pub struct Reject {
    name: String,
}

impl Reject {
    /// Standard adapter name
    pub const NAME: &'static str = "REJECT";

    /// Create the adapter
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: Self::NAME.to_string(),
        }
    }
}

impl Default for Reject {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Outbound for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Reject
    }

    // UDP flows must terminate here instead of falling through to a
    // later rule
    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial_tcp(&self, _metadata: &Metadata) -> Result<BoxedStream, OutboundError> {
        Err(OutboundError::Rejected {
            name: self.name.clone(),
        })
    }

    async fn listen_packet(
        &self,
        _metadata: &Metadata,
    ) -> Result<Arc<dyn OutboundDatagram>, OutboundError> {
        Err(OutboundError::Rejected {
            name: self.name.clone(),
        })
    }
}

/// Pass-through marker adapter
pub struct Pass {
    name: String,
}

impl Pass {
    /// Standard adapter name
    pub const NAME: &'static str = "PASS";

    /// Create the adapter
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: Self::NAME.to_string(),
        }
    }
}

impl Default for Pass {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Outbound for Pass {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Pass
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial_tcp(&self, _metadata: &Metadata) -> Result<BoxedStream, OutboundError> {
        Err(OutboundError::not_found(self.name.clone()))
    }

    async fn listen_packet(
        &self,
        _metadata: &Metadata,
    ) -> Result<Arc<dyn OutboundDatagram>, OutboundError> {
        Err(OutboundError::not_found(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;

    #[tokio::test]
    async fn test_reject_refuses_everything() {
        let reject = Reject::new();
        let metadata = Metadata::domain(Network::Tcp, "example.com", 443);

        assert!(matches!(
            reject.dial_tcp(&metadata).await,
            Err(OutboundError::Rejected { .. })
        ));
        assert!(matches!(
            reject.listen_packet(&metadata).await,
            Err(OutboundError::Rejected { .. })
        ));
        assert!(reject.supports_udp());
    }

    #[tokio::test]
    async fn test_pass_is_not_dialable() {
        let pass = Pass::new();
        let metadata = Metadata::domain(Network::Tcp, "example.com", 443);
        assert!(pass.dial_tcp(&metadata).await.is_err());
        assert_eq!(pass.kind(), OutboundKind::Pass);
    }
}
