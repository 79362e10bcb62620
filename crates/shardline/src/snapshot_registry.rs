//! Registry of open snapshot readers on a shard.
//!
//! Range deletion consults this to avoid removing documents an open snapshot
//! may still need. Handles release themselves on drop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::clock::Timestamp;

#[derive(Debug, Clone)]
pub struct OpenSnapshot {
    pub ns: String,
    pub ts: Timestamp,
    pub acquired_at: Instant,
    pub purpose: &'static str,
}

#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    next_id: AtomicU64,
    open: Mutex<BTreeMap<u64, OpenSnapshot>>,
    released: Notify,
}

/// Keeps a snapshot registered until dropped.
#[derive(Debug)]
pub struct SnapshotGuard {
    registry: Arc<SnapshotRegistry>,
    id: u64,
    ts: Timestamp,
}

impl SnapshotGuard {
    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.registry.open.lock().remove(&self.id);
        self.registry.released.notify_waiters();
    }
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, ns: &str, ts: Timestamp, purpose: &'static str) -> SnapshotGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(
            id,
            OpenSnapshot {
                ns: ns.to_string(),
                ts,
                acquired_at: Instant::now(),
                purpose,
            },
        );
        SnapshotGuard {
            registry: self.clone(),
            id,
            ts,
        }
    }

    /// Oldest open snapshot, optionally restricted to one namespace.
    pub fn oldest_active(&self, ns: Option<&str>) -> Option<Timestamp> {
        self.open
            .lock()
            .values()
            .filter(|s| ns.is_none_or_eq(&s.ns))
            .map(|s| s.ts)
            .min()
    }

    /// Wait until no snapshot on `ns` older than `ts` remains open.
    pub async fn wait_until_past(&self, ns: &str, ts: Timestamp) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            match self.oldest_active(Some(ns)) {
                Some(oldest) if oldest < ts => released.await,
                _ => return,
            }
        }
    }
}

trait NamespaceFilter {
    fn is_none_or_eq(&self, ns: &str) -> bool;
}

impl NamespaceFilter for Option<&str> {
    fn is_none_or_eq(&self, ns: &str) -> bool {
        self.map_or(true, |want| want == ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn guards_release_on_drop() {
        let registry = Arc::new(SnapshotRegistry::new());
        let a = registry.acquire("a.b", Timestamp(10), "test");
        let b = registry.acquire("c.d", Timestamp(5), "test");
        assert_eq!(registry.oldest_active(None), Some(Timestamp(5)));
        assert_eq!(registry.oldest_active(Some("a.b")), Some(Timestamp(10)));
        drop(b);
        assert_eq!(registry.oldest_active(None), Some(Timestamp(10)));
        assert_eq!(a.timestamp(), Timestamp(10));
        drop(a);
        assert_eq!(registry.oldest_active(None), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_until_past_unblocks_after_release() {
        let registry = Arc::new(SnapshotRegistry::new());
        let guard = registry.acquire("a.b", Timestamp(10), "test");
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_until_past("a.b", Timestamp(20)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("released")
            .expect("join");
        // Snapshots newer than the commit point do not block.
        let _newer = registry.acquire("a.b", Timestamp(30), "test");
        registry.wait_until_past("a.b", Timestamp(20)).await;
    }
}
