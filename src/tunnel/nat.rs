//! UDP NAT table
//!
//! Maps a flow key (the inbound packet's source address) to the
//! outbound packet endpoint serving that flow, plus a side table of
//! per-key single-flight locks. The first packet of a flow wins the
//! lock and performs the outbound dial; packets racing it park on the
//! lock's [`Notify`] and re-read the table after the winner broadcasts.
//!
//! Individual operations are atomic; the winner is responsible for
//! broadcasting on every exit path so waiters never deadlock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::outbound::OutboundDatagram;

/// Source-key → outbound endpoint map with single-flight locks
#[derive(Default)]
pub struct NatTable {
    conns: DashMap<String, Arc<dyn OutboundDatagram>>,
    locks: DashMap<String, Arc<Notify>>,
}

impl NatTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint serving `key`, if installed
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn OutboundDatagram>> {
        self.conns.get(key).map(|entry| Arc::clone(&entry))
    }

    /// Install the endpoint for `key`
    pub fn set(&self, key: &str, conn: Arc<dyn OutboundDatagram>) {
        self.conns.insert(key.to_string(), conn);
    }

    /// Remove the endpoint for `key`
    pub fn delete(&self, key: &str) {
        self.conns.remove(key);
    }

    /// Fetch or create the single-flight lock for `key`
    ///
    /// Returns the lock and whether it already existed: the caller that
    /// created it (`false`) is the winner and must [`release_lock`]
    /// when done; callers that found it (`true`) wait on the notify and
    /// re-read the table.
    ///
    /// [`release_lock`]: Self::release_lock
    #[must_use]
    pub fn get_or_create_lock(&self, key: &str) -> (Arc<Notify>, bool) {
        match self.locks.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (Arc::clone(entry.get()), true),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(Arc::clone(&notify));
                (notify, false)
            }
        }
    }

    /// Drop the lock for `key` and wake every waiter
    ///
    /// Called by the winner on success and failure alike.
    pub fn release_lock(&self, key: &str, notify: &Notify) {
        self.locks.remove(key);
        notify.notify_waiters();
    }

    /// Number of installed endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether no flow is active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl std::fmt::Debug for NatTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatTable")
            .field("conns", &self.conns.len())
            .field("locks", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;

    use async_trait::async_trait;

    struct FakeDatagram;

    #[async_trait]
    impl OutboundDatagram for FakeDatagram {
        async fn send_to(&self, buf: &[u8], _dst: SocketAddr) -> io::Result<usize> {
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            std::future::pending().await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    #[test]
    fn test_get_set_delete() {
        let nat = NatTable::new();
        assert!(nat.get("10.0.0.1:5000").is_none());

        nat.set("10.0.0.1:5000", Arc::new(FakeDatagram));
        assert!(nat.get("10.0.0.1:5000").is_some());
        assert_eq!(nat.len(), 1);

        nat.delete("10.0.0.1:5000");
        assert!(nat.get("10.0.0.1:5000").is_none());
        assert!(nat.is_empty());
    }

    #[test]
    fn test_lock_winner_and_loser() {
        let nat = NatTable::new();
        let (first, loaded) = nat.get_or_create_lock("key");
        assert!(!loaded);

        let (second, loaded) = nat.get_or_create_lock("key");
        assert!(loaded);
        assert!(Arc::ptr_eq(&first, &second));

        nat.release_lock("key", &first);
        let (_, loaded) = nat.get_or_create_lock("key");
        assert!(!loaded);
    }

    #[tokio::test]
    async fn test_release_wakes_parked_waiter() {
        let nat = Arc::new(NatTable::new());
        let (notify, loaded) = nat.get_or_create_lock("key");
        assert!(!loaded);

        let waiter = {
            let nat = Arc::clone(&nat);
            let (notify, loaded) = nat.get_or_create_lock("key");
            assert!(loaded);
            tokio::spawn(async move {
                notify.notified().await;
                nat.get("key").is_some()
            })
        };

        // give the waiter time to park before broadcasting
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        nat.set("key", Arc::new(FakeDatagram));
        nat.release_lock("key", &notify);

        assert!(waiter.await.unwrap());
    }
}
