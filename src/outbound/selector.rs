//! Selector group adapter
//!
//! A named group of member adapters delegating every dial to the
//! currently selected member. Selection is an atomic index so flows
//! racing a selection change see either member, never a torn state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OutboundError;
use crate::metadata::Metadata;

use super::traits::{BoxedStream, Outbound, OutboundDatagram, OutboundKind};

/// Group adapter delegating to one selected member
pub struct Selector {
    name: String,
    members: Vec<Arc<dyn Outbound>>,
    selected: AtomicUsize,
}

impl Selector {
    /// Create a group; `members` must be non-empty
    #[must_use]
    pub fn new(name: impl Into<String>, members: Vec<Arc<dyn Outbound>>) -> Self {
        assert!(!members.is_empty(), "selector requires at least one member");
        Self {
            name: name.into(),
            members,
            selected: AtomicUsize::new(0),
        }
    }

    /// The currently selected member
    #[must_use]
    pub fn now(&self) -> Arc<dyn Outbound> {
        let idx = self.selected.load(Ordering::Acquire) % self.members.len();
        Arc::clone(&self.members[idx])
    }

    /// Select a member by name
    ///
    /// # Errors
    ///
    /// Returns `OutboundError::NotFound` when no member has that name.
    pub fn select(&self, name: &str) -> Result<(), OutboundError> {
        let idx = self
            .members
            .iter()
            .position(|m| m.name() == name)
            .ok_or_else(|| OutboundError::not_found(name))?;
        self.selected.store(idx, Ordering::Release);
        Ok(())
    }

    /// Member names in declaration order
    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name())
    }
}

#[async_trait]
impl Outbound for Selector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OutboundKind {
        OutboundKind::Selector
    }

    fn supports_udp(&self) -> bool {
        self.now().supports_udp()
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<BoxedStream, OutboundError> {
        self.now().dial_tcp(metadata).await
    }

    async fn listen_packet(
        &self,
        metadata: &Metadata,
    ) -> Result<Arc<dyn OutboundDatagram>, OutboundError> {
        self.now().listen_packet(metadata).await
    }

    fn unwrap_inner(&self, _metadata: &Metadata) -> Option<Arc<dyn Outbound>> {
        Some(self.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::reject::{Pass, Reject};
    use crate::metadata::Network;

    #[test]
    fn test_selection() {
        let selector = Selector::new(
            "group",
            vec![
                Arc::new(Reject::new()) as Arc<dyn Outbound>,
                Arc::new(Pass::new()) as Arc<dyn Outbound>,
            ],
        );

        assert_eq!(selector.now().name(), "REJECT");
        selector.select("PASS").unwrap();
        assert_eq!(selector.now().name(), "PASS");
        assert!(selector.select("MISSING").is_err());
    }

    #[test]
    fn test_unwrap_exposes_current() {
        let selector = Selector::new(
            "group",
            vec![Arc::new(Pass::new()) as Arc<dyn Outbound>],
        );
        let metadata = Metadata::domain(Network::Tcp, "example.com", 443);
        let inner = selector.unwrap_inner(&metadata).unwrap();
        assert_eq!(inner.kind(), OutboundKind::Pass);
    }
}
