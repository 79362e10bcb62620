//! Per-collection write (and read) blocking used at migration and resharding commit.
//!
//! A critical section covers one key range. While held, writes to keys in the
//! range wait for it to end, bounded by a timeout after which they fail with a
//! retryable `MigrationConflict`. `InFlightWrites` lets the owner of a critical
//! section wait for writes admitted just before it was entered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::chunk::ChunkRange;
use crate::error::{ShardError, ShardResult};
use crate::key::ShardKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalSectionMode {
    BlockWrites,
    BlockReadsAndWrites,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldSection {
    pub id: Uuid,
    pub range: ChunkRange,
    pub mode: CriticalSectionMode,
    pub reason: String,
}

#[derive(Debug)]
pub struct CriticalSection {
    ns: String,
    held: watch::Sender<Vec<HeldSection>>,
}

fn matches_key(section: &HeldSection, key: Option<&ShardKey>) -> bool {
    key.map_or(true, |k| section.range.contains(k))
}

/// Whether a read of `range` (everything when `None`) must wait.
fn blocks_read(held: &[HeldSection], range: Option<&ChunkRange>) -> bool {
    held.iter().any(|s| {
        s.mode == CriticalSectionMode::BlockReadsAndWrites && range.map_or(true, |r| r.overlaps(&s.range))
    })
}

impl CriticalSection {
    pub fn new(ns: impl Into<String>) -> Self {
        let (held, _) = watch::channel(Vec::new());
        Self { ns: ns.into(), held }
    }

    /// Block writes to `range`. Re-entering with the same id is a no-op.
    pub fn enter(
        &self,
        id: Uuid,
        range: ChunkRange,
        mode: CriticalSectionMode,
        reason: &str,
    ) -> ShardResult<()> {
        let mut result = Ok(());
        self.held.send_if_modified(|held| {
            if held.iter().any(|s| s.id == id) {
                return false;
            }
            if let Some(other) = held.iter().find(|s| s.range.overlaps(&range)) {
                result = Err(ShardError::ConflictingOperationInProgress(format!(
                    "critical section for {} already held on {} ({})",
                    self.ns, other.range, other.reason
                )));
                return false;
            }
            held.push(HeldSection {
                id,
                range: range.clone(),
                mode,
                reason: reason.to_string(),
            });
            true
        });
        if result.is_ok() {
            tracing::info!(ns = %self.ns, range = %range, mode = ?mode, reason, "entered critical section");
        }
        result
    }

    /// Upgrade a held section so it also blocks reads.
    pub fn promote(&self, id: Uuid) -> ShardResult<()> {
        let mut found = false;
        self.held.send_if_modified(|held| {
            match held.iter_mut().find(|s| s.id == id) {
                Some(section) => {
                    found = true;
                    let changed = section.mode != CriticalSectionMode::BlockReadsAndWrites;
                    section.mode = CriticalSectionMode::BlockReadsAndWrites;
                    changed
                }
                None => false,
            }
        });
        if !found {
            return Err(ShardError::Internal(format!(
                "no critical section {id} held on {}",
                self.ns
            )));
        }
        Ok(())
    }

    pub fn exit(&self, id: Uuid) {
        let removed = self.held.send_if_modified(|held| {
            let before = held.len();
            held.retain(|s| s.id != id);
            held.len() != before
        });
        if removed {
            tracing::info!(ns = %self.ns, section = %id, "left critical section");
        }
    }

    /// Drop every held section; used when the shard process goes down.
    pub fn clear(&self) {
        self.held.send_if_modified(|held| {
            let changed = !held.is_empty();
            held.clear();
            changed
        });
    }

    /// Whether a write to `key` (any key when `None`) would block now.
    pub fn blocks_write(&self, key: Option<&ShardKey>) -> bool {
        self.held.borrow().iter().any(|s| matches_key(s, key))
    }

    pub async fn wait_for_write(&self, key: Option<&ShardKey>, timeout: Duration) -> ShardResult<()> {
        self.wait_until(timeout, |held| !held.iter().any(|s| matches_key(s, key)))
            .await
    }

    pub async fn wait_for_read(&self, range: Option<&ChunkRange>, timeout: Duration) -> ShardResult<()> {
        self.wait_until(timeout, |held| !blocks_read(held, range)).await
    }

    async fn wait_until(
        &self,
        timeout: Duration,
        mut clear: impl FnMut(&[HeldSection]) -> bool,
    ) -> ShardResult<()> {
        let mut rx = self.held.subscribe();
        let wait = async {
            loop {
                if clear(&rx.borrow_and_update()) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ShardError::conflict(
                self.ns.clone(),
                format!("timed out after {timeout:?} waiting for a critical section to end"),
            )
        })
    }
}

/// Writes admitted past the critical-section check but not yet applied.
#[derive(Debug, Default)]
pub struct InFlightWrites {
    next_id: AtomicU64,
    tickets: Mutex<HashMap<u64, Option<ShardKey>>>,
    released: Notify,
}

/// Held for the duration of one admitted write.
#[derive(Debug)]
pub struct WriteTicket {
    owner: Arc<InFlightWrites>,
    id: u64,
}

impl Drop for WriteTicket {
    fn drop(&mut self) {
        self.owner.tickets.lock().remove(&self.id);
        self.owner.released.notify_waiters();
    }
}

impl InFlightWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a write to `key`; `None` marks a multi-document write.
    pub fn acquire(self: &Arc<Self>, key: Option<ShardKey>) -> WriteTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tickets.lock().insert(id, key);
        WriteTicket {
            owner: self.clone(),
            id,
        }
    }

    pub fn count(&self) -> usize {
        self.tickets.lock().len()
    }

    fn overlapping(&self, range: &ChunkRange) -> usize {
        self.tickets
            .lock()
            .values()
            .filter(|key| key.as_ref().map_or(true, |k| range.contains(k)))
            .count()
    }

    /// Wait until no admitted write touches `range`; false on timeout.
    pub async fn drain(&self, range: &ChunkRange, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let released = self.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();
                if self.overlapping(range) == 0 {
                    return;
                }
                released.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(ShardKey::int(min), ShardKey::int(max)).expect("range")
    }

    #[test]
    fn overlapping_sections_conflict() {
        let cs = CriticalSection::new("a.b");
        let first = Uuid::new_v4();
        cs.enter(first, range(0, 10), CriticalSectionMode::BlockWrites, "test")
            .expect("enter");
        cs.enter(first, range(0, 10), CriticalSectionMode::BlockWrites, "test")
            .expect("re-enter");
        assert!(matches!(
            cs.enter(Uuid::new_v4(), range(5, 20), CriticalSectionMode::BlockWrites, "test"),
            Err(ShardError::ConflictingOperationInProgress(_))
        ));
        cs.enter(Uuid::new_v4(), range(10, 20), CriticalSectionMode::BlockWrites, "test")
            .expect("disjoint");

        assert!(cs.blocks_write(Some(&ShardKey::int(3))));
        assert!(!cs.blocks_write(Some(&ShardKey::int(30))));
        assert!(!blocks_read(&cs.held.borrow(), None));
        cs.promote(first).expect("promote");
        assert!(blocks_read(&cs.held.borrow(), Some(&range(9, 11))));
        assert!(!blocks_read(&cs.held.borrow(), Some(&range(30, 40))));
        cs.exit(first);
        assert!(!cs.blocks_write(Some(&ShardKey::int(3))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writes_wait_for_exit_or_time_out() {
        let cs = Arc::new(CriticalSection::new("a.b"));
        let id = Uuid::new_v4();
        cs.enter(id, range(0, 10), CriticalSectionMode::BlockWrites, "test")
            .expect("enter");

        let err = cs
            .wait_for_write(Some(&ShardKey::int(1)), Duration::from_millis(20))
            .await
            .expect_err("blocked");
        assert!(err.is_retryable());

        let waiter = {
            let cs = cs.clone();
            tokio::spawn(async move {
                cs.wait_for_write(Some(&ShardKey::int(1)), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cs.exit(id);
        waiter.await.expect("join").expect("unblocked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drain_waits_for_overlapping_tickets() {
        let inflight = Arc::new(InFlightWrites::new());
        let outside = inflight.acquire(Some(ShardKey::int(50)));
        assert!(inflight.drain(&range(0, 10), Duration::from_millis(10)).await);

        let inside = inflight.acquire(Some(ShardKey::int(5)));
        assert!(!inflight.drain(&range(0, 10), Duration::from_millis(10)).await);
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(inside);
        });
        assert!(inflight.drain(&range(0, 10), Duration::from_secs(2)).await);
        releaser.await.expect("join");

        let multi = inflight.acquire(None);
        assert!(!inflight.drain(&range(0, 10), Duration::from_millis(10)).await);
        drop(multi);
        drop(outside);
        assert_eq!(inflight.count(), 0);
    }
}
