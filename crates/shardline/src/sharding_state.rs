//! Per-collection sharding state held by a shard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::chunk::ChunkRange;
use crate::chunk_map::ChunkMap;
use crate::clock::Timestamp;
use crate::critical_section::{CriticalSection, InFlightWrites, WriteTicket};
use crate::error::{ShardError, ShardResult};
use crate::key::ShardKey;
use crate::version::ChunkVersion;

/// What a shard knows about a collection's routing.
#[derive(Debug, Clone)]
pub enum CollectionMetadata {
    /// Never loaded, or dropped on restart; must refresh before use.
    Unknown,
    Unsharded,
    Sharded(Arc<ChunkMap>),
}

impl CollectionMetadata {
    pub fn version(&self) -> Option<ChunkVersion> {
        match self {
            CollectionMetadata::Sharded(map) => Some(map.collection_version()),
            _ => None,
        }
    }

    pub fn map(&self) -> Option<&Arc<ChunkMap>> {
        match self {
            CollectionMetadata::Sharded(map) => Some(map),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanReason {
    /// Left on the donor after the range moved away.
    MigratedAway,
    /// Partial clone on a recipient whose migration aborted.
    AbortedReceive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanRange {
    pub id: Uuid,
    pub range: ChunkRange,
    pub since: Timestamp,
    pub reason: OrphanReason,
}

pub struct CollectionShardingState {
    ns: String,
    metadata: tokio::sync::RwLock<CollectionMetadata>,
    refresh_lock: tokio::sync::Mutex<()>,
    critical_section: CriticalSection,
    inflight: Arc<InFlightWrites>,
    receiving: Mutex<Vec<(Uuid, ChunkRange)>>,
    orphans: Mutex<Vec<OrphanRange>>,
    /// Ranges whose orphans are being or were deleted, with the commit time
    /// they were deleted for; snapshot reads older than that cannot be served.
    deleted: Mutex<Vec<(ChunkRange, Timestamp)>>,
}

impl CollectionShardingState {
    pub fn new(ns: impl Into<String>) -> Self {
        let ns = ns.into();
        Self {
            critical_section: CriticalSection::new(ns.clone()),
            ns,
            metadata: tokio::sync::RwLock::new(CollectionMetadata::Unknown),
            refresh_lock: tokio::sync::Mutex::new(()),
            inflight: Arc::new(InFlightWrites::new()),
            receiving: Mutex::new(Vec::new()),
            orphans: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn metadata(&self) -> &tokio::sync::RwLock<CollectionMetadata> {
        &self.metadata
    }

    pub(crate) fn refresh_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.refresh_lock
    }

    pub fn critical_section(&self) -> &CriticalSection {
        &self.critical_section
    }

    pub fn inflight(&self) -> &Arc<InFlightWrites> {
        &self.inflight
    }

    /// Wait out any critical section on `key`, then register the write.
    ///
    /// The section is checked again after the ticket is taken so a section
    /// entered in between either sees the ticket when draining or turns the
    /// write away.
    pub async fn begin_write(&self, key: Option<&ShardKey>, timeout: Duration) -> ShardResult<WriteTicket> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if key.is_some() {
                self.critical_section.wait_for_write(key, remaining).await?;
            }
            let ticket = self.inflight.acquire(key.cloned());
            if key.is_none() || !self.critical_section.blocks_write(key) {
                return Ok(ticket);
            }
            drop(ticket);
            if tokio::time::Instant::now() >= deadline {
                return Err(ShardError::conflict(
                    self.ns.clone(),
                    "critical section held past the write wait",
                ));
            }
        }
    }

    pub fn add_receiving(&self, id: Uuid, range: ChunkRange) -> ShardResult<()> {
        let mut receiving = self.receiving.lock();
        if let Some((_, other)) = receiving.iter().find(|(other_id, r)| *other_id != id && r.overlaps(&range)) {
            return Err(ShardError::ConflictingOperationInProgress(format!(
                "{} is already receiving {other}",
                self.ns
            )));
        }
        if !receiving.iter().any(|(other_id, _)| *other_id == id) {
            receiving.push((id, range));
        }
        Ok(())
    }

    pub fn remove_receiving(&self, id: Uuid) {
        self.receiving.lock().retain(|(other, _)| *other != id);
    }

    pub fn receiving_ranges(&self) -> Vec<ChunkRange> {
        self.receiving.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn add_orphan(&self, orphan: OrphanRange) {
        let mut orphans = self.orphans.lock();
        if !orphans.iter().any(|o| o.id == orphan.id) {
            tracing::debug!(ns = %self.ns, range = %orphan.range, reason = ?orphan.reason, "tracking orphan range");
            orphans.push(orphan);
        }
    }

    pub fn remove_orphan(&self, id: Uuid) {
        self.orphans.lock().retain(|o| o.id != id);
    }

    pub fn orphan_ranges(&self) -> Vec<OrphanRange> {
        self.orphans.lock().clone()
    }

    /// Refuse snapshot reads of `range` older than `commit_ts`. Must be called
    /// before the first document of the range is deleted.
    pub fn record_deletion(&self, range: ChunkRange, commit_ts: Timestamp) {
        self.deleted.lock().push((range, commit_ts));
    }

    /// Drop fences the prune horizon already covers.
    pub fn forget_deletions_before(&self, horizon: Timestamp) {
        self.deleted.lock().retain(|(_, commit_ts)| *commit_ts > horizon);
    }

    /// Fail reads at `read_at` that would need documents already deleted.
    pub fn check_snapshot(&self, read_at: Timestamp, range: Option<&ChunkRange>) -> ShardResult<()> {
        let deleted = self.deleted.lock();
        let too_old = deleted.iter().any(|(r, commit_ts)| {
            read_at < *commit_ts && range.map_or(true, |want| want.overlaps(r))
        });
        if too_old {
            return Err(ShardError::SnapshotTooOld {
                ns: self.ns.clone(),
                read_at,
            });
        }
        Ok(())
    }

    /// Forget everything volatile; metadata must be reloaded afterwards.
    pub async fn reset(&self) {
        *self.metadata.write().await = CollectionMetadata::Unknown;
        self.critical_section.clear();
        self.receiving.lock().clear();
        self.orphans.lock().clear();
        // Deletion fences stay; the deleted documents do not come back.
    }
}

/// All collection states of one shard.
#[derive(Default)]
pub struct ShardingStateRegistry {
    states: RwLock<HashMap<String, Arc<CollectionShardingState>>>,
}

impl ShardingStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, ns: &str) -> Arc<CollectionShardingState> {
        if let Some(state) = self.states.read().get(ns) {
            return state.clone();
        }
        self.states
            .write()
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(CollectionShardingState::new(ns)))
            .clone()
    }

    pub fn get(&self, ns: &str) -> Option<Arc<CollectionShardingState>> {
        self.states.read().get(ns).cloned()
    }

    pub fn all(&self) -> Vec<Arc<CollectionShardingState>> {
        self.states.read().values().cloned().collect()
    }

    pub async fn reset_all(&self) {
        for state in self.all() {
            state.reset().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critical_section::CriticalSectionMode;

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(ShardKey::int(min), ShardKey::int(max)).expect("range")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn begin_write_respects_critical_section() {
        let state = Arc::new(CollectionShardingState::new("a.b"));
        let id = Uuid::new_v4();
        state
            .critical_section()
            .enter(id, range(0, 10), CriticalSectionMode::BlockWrites, "test")
            .expect("enter");

        let ticket = state
            .begin_write(Some(&ShardKey::int(20)), Duration::from_millis(50))
            .await
            .expect("outside the section");
        drop(ticket);
        let err = state
            .begin_write(Some(&ShardKey::int(5)), Duration::from_millis(30))
            .await
            .expect_err("inside the section");
        assert!(matches!(err, ShardError::MigrationConflict { .. }));
        assert_eq!(state.inflight().count(), 0);
    }

    #[test]
    fn snapshot_reads_older_than_deletion_fail() {
        let state = CollectionShardingState::new("a.b");
        state.record_deletion(range(0, 10), Timestamp(100));
        state.check_snapshot(Timestamp(150), None).expect("newer read");
        state
            .check_snapshot(Timestamp(50), Some(&range(20, 30)))
            .expect("disjoint range");
        assert!(matches!(
            state.check_snapshot(Timestamp(50), Some(&range(5, 30))),
            Err(ShardError::SnapshotTooOld { .. })
        ));

        state.forget_deletions_before(Timestamp(99));
        assert!(state.check_snapshot(Timestamp(50), None).is_err());
        state.forget_deletions_before(Timestamp(100));
        assert!(state.deleted.lock().is_empty());
    }

    #[test]
    fn overlapping_receives_are_refused() {
        let state = CollectionShardingState::new("a.b");
        let id = Uuid::new_v4();
        state.add_receiving(id, range(0, 10)).expect("first");
        state.add_receiving(id, range(0, 10)).expect("same id");
        assert!(state.add_receiving(Uuid::new_v4(), range(5, 15)).is_err());
        state.remove_receiving(id);
        assert!(state.receiving_ranges().is_empty());
    }
}
