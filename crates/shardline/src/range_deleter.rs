//! Asynchronous deletion of orphaned ranges.
//!
//! Each shard runs one deleter task fed through an mpsc channel. A task waits
//! until no open snapshot predates the commit that orphaned its range (and the
//! configured cleanup delay has passed), then removes the documents in
//! batches. Tasks are recorded durably by whoever schedules them and replayed
//! on restart. The same task prunes MVCC versions nobody can read any more.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk::ChunkRange;
use crate::clock::{ClusterClock, Timestamp};
use crate::error::ShardResult;
use crate::failpoint::{FailPoints, RANGE_DELETER_PAUSE};
use crate::key::{ShardKey, ShardKeyPattern};
use crate::replication::{MetadataOp, MetadataTxn, Replication};
use crate::sharding_state::ShardingStateRegistry;
use crate::snapshot_registry::SnapshotRegistry;
use crate::storage::{delete_range, StorageEngine};

/// Configuration for the background range deleter.
#[derive(Clone, Copy, Debug)]
pub struct RangeDeleterConfig {
    /// Documents removed per batch.
    pub batch_size: usize,
    /// Pause between batches so deletion does not starve user writes.
    pub batch_delay: Duration,
    /// Extra wait before a non-immediate deletion starts.
    pub orphan_cleanup_delay: Duration,
    /// How often superseded MVCC versions are pruned.
    pub prune_interval: Duration,
}

impl Default for RangeDeleterConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            batch_delay: Duration::from_millis(5),
            orphan_cleanup_delay: Duration::ZERO,
            prune_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    pub id: Uuid,
    pub ns: String,
    pub range: ChunkRange,
    /// Shard key the range was expressed in when it was orphaned.
    pub pattern: ShardKeyPattern,
    /// Commit time of the ownership change; snapshots older than this may
    /// still need the documents.
    pub commit_ts: Timestamp,
    /// Skip the snapshot wait; nobody ever read the range as owned.
    pub immediate: bool,
}

pub(crate) struct RangeDeleterDeps {
    pub storage: Arc<dyn StorageEngine>,
    pub snapshots: Arc<SnapshotRegistry>,
    pub states: Arc<ShardingStateRegistry>,
    pub replication: Arc<dyn Replication>,
    pub failpoints: Arc<FailPoints>,
    pub clock: Arc<ClusterClock>,
    /// Reads older than this timestamp may find pruned versions.
    pub prune_horizon: Arc<Mutex<Timestamp>>,
    pub history_window: Duration,
}

pub struct RangeDeleter {
    tx: mpsc::UnboundedSender<RangeDeletionTask>,
    pending: Arc<Mutex<BTreeMap<Uuid, RangeDeletionTask>>>,
    completed: Arc<Notify>,
    deps: Arc<RangeDeleterDeps>,
}

impl RangeDeleter {
    /// Spawn the deleter task; it stops when `cancel` fires.
    pub(crate) fn spawn(
        deps: Arc<RangeDeleterDeps>,
        config: RangeDeleterConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let deleter = Arc::new(Self {
            tx,
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            completed: Arc::new(Notify::new()),
            deps,
        });
        tokio::spawn(run(
            rx,
            deleter.deps.clone(),
            config,
            deleter.pending.clone(),
            deleter.completed.clone(),
            cancel,
        ));
        deleter
    }

    /// Queue a task that has already been recorded durably.
    pub fn schedule(&self, task: RangeDeletionTask) {
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&task.id) {
                return;
            }
            pending.insert(task.id, task.clone());
        }
        tracing::info!(
            ns = %task.ns,
            range = %task.range,
            commit_ts = %task.commit_ts,
            immediate = task.immediate,
            "scheduled range deletion"
        );
        if self.tx.send(task).is_err() {
            tracing::warn!("range deleter stopped; deletion will resume on restart");
        }
    }

    pub fn has_overlapping(&self, ns: &str, range: &ChunkRange) -> bool {
        self.pending
            .lock()
            .values()
            .any(|t| t.ns == ns && t.range.overlaps(range))
    }

    /// Wait until no pending deletion overlaps `range`; false on timeout.
    pub async fn wait_for_overlapping(&self, ns: &str, range: &ChunkRange, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let completed = self.completed.notified();
                tokio::pin!(completed);
                completed.as_mut().enable();
                if !self.has_overlapping(ns, range) {
                    return;
                }
                completed.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Wait for every deletion on `ns` whose range ends after `from`.
    ///
    /// Returns how many deletions were waited on.
    pub async fn wait_for_pending(&self, ns: &str, from: Option<&ShardKey>) -> usize {
        let relevant = |t: &RangeDeletionTask| t.ns == ns && from.map_or(true, |k| t.range.max > *k);
        let mut seen = BTreeSet::new();
        loop {
            let completed = self.completed.notified();
            tokio::pin!(completed);
            completed.as_mut().enable();
            let outstanding: Vec<Uuid> = self
                .pending
                .lock()
                .values()
                .filter(|t| relevant(t))
                .map(|t| t.id)
                .collect();
            if outstanding.is_empty() {
                return seen.len();
            }
            seen.extend(outstanding);
            completed.await;
        }
    }

    /// Drop pending deletions of `ns`; its data is being replaced wholesale.
    pub fn cancel_namespace(&self, ns: &str) {
        let cancelled: Vec<Uuid> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Uuid> = pending.values().filter(|t| t.ns == ns).map(|t| t.id).collect();
            for id in &ids {
                pending.remove(id);
            }
            ids
        };
        if cancelled.is_empty() {
            return;
        }
        let mut txn = MetadataTxn::new();
        for id in &cancelled {
            txn = txn.with(MetadataOp::RemoveRangeDeletion(*id));
        }
        if !self.deps.replication.durably_commit(txn) {
            tracing::warn!(ns, "failed to record cancelled range deletions; they will be skipped on replay");
        }
        if let Some(state) = self.deps.states.get(ns) {
            for id in &cancelled {
                state.remove_orphan(*id);
            }
        }
        tracing::info!(ns, count = cancelled.len(), "cancelled pending range deletions");
        self.completed.notify_waiters();
    }

    /// Prune versions older than every open snapshot and the history window.
    #[cfg(test)]
    pub(crate) fn prune_once(&self) -> ShardResult<usize> {
        prune_versions(&self.deps)
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<RangeDeletionTask>,
    deps: Arc<RangeDeleterDeps>,
    config: RangeDeleterConfig,
    pending: Arc<Mutex<BTreeMap<Uuid, RangeDeletionTask>>>,
    completed: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut tasks = JoinSet::new();
    let mut prune = tokio::time::interval(config.prune_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tasks.shutdown().await;
                return;
            }
            msg = rx.recv() => {
                let Some(task) = msg else {
                    tasks.shutdown().await;
                    return;
                };
                tasks.spawn(run_task(task, deps.clone(), config, pending.clone(), completed.clone()));
            }
            _ = prune.tick() => {
                if let Err(err) = prune_versions(&deps) {
                    tracing::warn!(error = %err, "version pruning failed");
                }
            }
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = res {
                    if !err.is_cancelled() {
                        tracing::error!(error = %err, "range deletion task panicked");
                    }
                }
            }
        }
    }
}

async fn run_task(
    task: RangeDeletionTask,
    deps: Arc<RangeDeleterDeps>,
    config: RangeDeleterConfig,
    pending: Arc<Mutex<BTreeMap<Uuid, RangeDeletionTask>>>,
    completed: Arc<Notify>,
) {
    if !task.immediate {
        if !config.orphan_cleanup_delay.is_zero() {
            tokio::time::sleep(config.orphan_cleanup_delay).await;
        }
        deps.snapshots.wait_until_past(&task.ns, task.commit_ts).await;
        // Older snapshot reads of the range are refused from here on; wait out
        // the ones that registered before the fence went up.
        deps.states
            .get_or_create(&task.ns)
            .record_deletion(task.range.clone(), task.commit_ts);
        deps.snapshots.wait_until_past(&task.ns, task.commit_ts).await;
    }
    deps.failpoints.pause_point(RANGE_DELETER_PAUSE).await;

    let mut total = 0usize;
    loop {
        if !pending.lock().contains_key(&task.id) {
            tracing::debug!(ns = %task.ns, range = %task.range, "range deletion cancelled");
            return;
        }
        let batch = config.batch_size.max(1);
        let deleted = match delete_range(deps.storage.as_ref(), &task.ns, &task.pattern, &task.range, batch) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(ns = %task.ns, range = %task.range, error = %err, "range deletion batch failed");
                tokio::time::sleep(config.batch_delay.max(Duration::from_millis(10))).await;
                continue;
            }
        };
        total += deleted;
        if deleted < batch {
            break;
        }
        tokio::time::sleep(config.batch_delay).await;
    }

    while !deps
        .replication
        .durably_commit(MetadataTxn::single(MetadataOp::RemoveRangeDeletion(task.id)))
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if let Some(state) = deps.states.get(&task.ns) {
        state.remove_orphan(task.id);
    }
    pending.lock().remove(&task.id);
    completed.notify_waiters();
    tracing::info!(ns = %task.ns, range = %task.range, deleted = total, "range deletion finished");
}

fn prune_versions(deps: &RangeDeleterDeps) -> ShardResult<usize> {
    let by_window = deps.clock.now().saturating_sub(deps.history_window);
    let candidate = match deps.snapshots.oldest_active(None) {
        Some(oldest) => oldest.min(by_window),
        None => by_window,
    };
    {
        let mut published = deps.prune_horizon.lock();
        if candidate <= *published {
            return Ok(0);
        }
        *published = candidate;
    }
    // Readers that registered before the new horizon was published passed
    // the old one.
    let horizon = match deps.snapshots.oldest_active(None) {
        Some(oldest) => oldest.min(candidate),
        None => candidate,
    };
    for state in deps.states.all() {
        state.forget_deletions_before(candidate);
    }
    let pruned = deps.storage.prune_versions(horizon)?;
    if pruned > 0 {
        tracing::debug!(horizon = %horizon, pruned, "pruned document versions");
    }
    Ok(pruned)
}
