use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use super::ReshardingConfig;
use crate::chunk::ChunkRange;
use crate::chunk_map::ChunkMap;
use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::failpoint::{FailPoints, RESHARDING_PAUSE_AFTER_CLONE};
use crate::key::{document_id, Document, KeyValue};
use crate::orphan_filter::OrphanFilter;
use crate::shard::Shard;
use crate::storage::snapshot_cursor;
use crate::types::ShardId;
use crate::write_log::{WriteLogEntry, WriteOp};

/// Final write-log position of each donor, published once writes are blocked.
pub(super) type StopPositions = Arc<BTreeMap<ShardId, Timestamp>>;

/// Progress shared between the coordinator and its pipelines.
pub(super) struct PipelineControl {
    cloned: AtomicUsize,
    steady: AtomicUsize,
    changed: Notify,
    stop: watch::Sender<Option<StopPositions>>,
}

impl PipelineControl {
    pub(super) fn new() -> Self {
        let (stop, _) = watch::channel(None);
        Self {
            cloned: AtomicUsize::new(0),
            steady: AtomicUsize::new(0),
            changed: Notify::new(),
            stop,
        }
    }

    pub(super) fn cloned(&self) -> usize {
        self.cloned.load(Ordering::Acquire)
    }

    pub(super) fn steady(&self) -> usize {
        self.steady.load(Ordering::Acquire)
    }

    pub(super) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Tell pipelines to apply up to these positions and finish.
    pub(super) fn stop_at(&self, positions: BTreeMap<ShardId, Timestamp>) {
        self.stop.send_replace(Some(Arc::new(positions)));
    }

    fn bump(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_waiters();
    }
}

/// A recipient's temporary collection and where each of its documents came from.
pub(super) struct RecipientTarget {
    pub(super) shard: Arc<Shard>,
    ns: String,
    pub(super) temp_ns: String,
    /// Encoded `_id` to the donor that sent it.
    origins: Mutex<HashMap<Vec<u8>, ShardId>>,
}

impl RecipientTarget {
    pub(super) fn new(shard: Arc<Shard>, ns: &str, temp_ns: &str) -> Self {
        Self {
            shard,
            ns: ns.to_string(),
            temp_ns: temp_ns.to_string(),
            origins: Mutex::new(HashMap::new()),
        }
    }

    fn upsert(&self, from: &ShardId, doc: Document) -> ShardResult<()> {
        let id = document_id(&doc)?;
        let mut origins = self.origins.lock();
        let key = id.encode();
        if let Some(other) = origins.get(&key) {
            if other != from {
                return Err(ShardError::DuplicateKey {
                    ns: self.ns.clone(),
                    id: format!("{id} (from {other} and {from})"),
                });
            }
        }
        origins.insert(key, from.clone());
        self.shard.apply_internal(&self.temp_ns, &WriteOp::Upsert { doc })
    }

    /// Drop `id` if `from` sent it here.
    fn remove(&self, from: &ShardId, id: &KeyValue, pre_image: &Document) -> ShardResult<()> {
        let mut origins = self.origins.lock();
        let key = id.encode();
        if origins.get(&key) != Some(from) {
            return Ok(());
        }
        origins.remove(&key);
        self.shard.apply_internal(
            &self.temp_ns,
            &WriteOp::Delete {
                id: id.clone(),
                pre_image: pre_image.clone(),
            },
        )
    }

    pub(super) fn document_count(&self) -> usize {
        self.origins.lock().len()
    }
}

/// Copies one donor's share of the new layout to one recipient.
pub(super) struct Pipeline {
    pub(super) ns: String,
    pub(super) donor: Arc<Shard>,
    pub(super) recipient: Arc<RecipientTarget>,
    pub(super) old_map: Arc<ChunkMap>,
    pub(super) target: Arc<ChunkMap>,
    pub(super) clone_ts: Timestamp,
    pub(super) config: ReshardingConfig,
    pub(super) failpoints: Arc<FailPoints>,
    pub(super) control: Arc<PipelineControl>,
}

impl Pipeline {
    pub(super) async fn run(self) -> ShardResult<()> {
        let cloned = self.clone_snapshot().await?;
        tracing::info!(
            ns = %self.ns,
            donor = %self.donor.id(),
            recipient = %self.recipient.shard.id(),
            docs = cloned,
            "resharding clone finished"
        );
        self.control.bump(&self.control.cloned);
        self.failpoints.pause_point(RESHARDING_PAUSE_AFTER_CLONE).await;
        self.apply_until_stopped().await
    }

    fn ensure_participants_up(&self) -> ShardResult<()> {
        self.donor.ensure_up()?;
        self.recipient.shard.ensure_up()
    }

    /// Copy documents the donor owned at the clone timestamp and the new layout gives the recipient.
    async fn clone_snapshot(&self) -> ShardResult<usize> {
        let pattern = self.old_map.pattern().clone();
        let mut cursor = snapshot_cursor(
            self.donor.storage.clone(),
            self.ns.clone(),
            pattern.clone(),
            ChunkRange::full(pattern.width()),
            Some(self.clone_ts),
            self.config.clone_batch_size,
        );
        let owned = OrphanFilter::new(&self.old_map, self.donor.id(), Some(self.clone_ts));
        let mut cloned = 0;
        loop {
            self.ensure_participants_up()?;
            let Some(batch) = cursor.next_batch()? else {
                return Ok(cloned);
            };
            for doc in batch {
                if !owned.is_owned(&doc)? || !self.destined_here(&doc)? {
                    continue;
                }
                self.recipient.upsert(self.donor.id(), doc)?;
                cloned += 1;
            }
            tokio::task::yield_now().await;
        }
    }

    fn destined_here(&self, doc: &Document) -> ShardResult<bool> {
        let key = self.target.pattern().extract(doc)?;
        Ok(self.target.owner_of(&key, None)? == *self.recipient.shard.id())
    }

    /// Replay donor writes after the clone timestamp until told where to stop.
    async fn apply_until_stopped(&self) -> ShardResult<()> {
        let mut stop_rx = self.control.stop.subscribe();
        let mut position = self.clone_ts;
        let mut steady = false;
        loop {
            let stop = stop_rx.borrow_and_update().clone();
            let stop_at = stop.as_ref().map(|p| p.get(self.donor.id()).copied().unwrap_or(Timestamp::ZERO));
            let applied = self.apply_round(&mut position)?;
            if let Some(tip) = stop_at {
                if position >= tip {
                    return Ok(());
                }
                continue;
            }
            if !steady && applied <= self.config.converged_threshold {
                steady = true;
                self.control.bump(&self.control.steady);
            }
            if applied < self.config.apply_batch_size {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        }
    }

    fn apply_round(&self, position: &mut Timestamp) -> ShardResult<usize> {
        self.ensure_participants_up()?;
        let (entries, last_seen) =
            self.donor
                .write_log
                .read_after(&self.ns, *position, self.config.apply_batch_size)?;
        for entry in &entries {
            self.apply_entry(entry)?;
        }
        *position = last_seen;
        Ok(entries.len())
    }

    fn apply_entry(&self, entry: &WriteLogEntry) -> ShardResult<()> {
        let from = self.donor.id();
        match &entry.op {
            WriteOp::Upsert { doc } if self.destined_here(doc)? => self.recipient.upsert(from, doc.clone()),
            // The new-key value moved the document to another recipient.
            WriteOp::Upsert { doc } => self.recipient.remove(from, &document_id(doc)?, doc),
            WriteOp::Delete { id, pre_image } => self.recipient.remove(from, id, pre_image),
        }
    }
}
