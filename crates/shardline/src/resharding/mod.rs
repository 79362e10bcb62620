//! Resharding: repartition a collection onto a new shard key.
//!
//! The coordinator picks one clone timestamp for every donor, then runs one
//! pipeline per (donor, recipient) pair. A pipeline copies the donor's owned
//! documents as of that timestamp into a temporary namespace on the recipient
//! and then replays the donor's write log until the coordinator blocks writes.
//! Cutover swaps the catalog to the new key, epoch and chunks in one write and
//! replaces each participant's data while reads are blocked.
//!
//! Abort is possible until the coordinator enters `Committing`; after that the
//! commit is driven to completion.

mod coordinator;
mod pipeline;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::catalog_manager::ShardingCatalogManager;
use crate::chunk::ChunkRange;
use crate::error::{ShardError, ShardResult};
use crate::failpoint::FailPoints;
use crate::key::ShardKeyPattern;
use crate::registry::ShardRegistry;
use crate::types::ShardId;
use crate::version::ChunkVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorPhase {
    Initializing,
    PreparingToDonate,
    Cloning,
    Applying,
    BlockingWrites,
    Committing,
    Done,
    Aborting,
}

impl CoordinatorPhase {
    /// Whether `abortReshardCollection` may still roll the operation back.
    pub fn is_abortable(self) -> bool {
        !matches!(self, CoordinatorPhase::Committing | CoordinatorPhase::Done)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReshardingConfig {
    /// Documents per clone batch.
    pub clone_batch_size: usize,
    /// Write-log entries per apply round.
    pub apply_batch_size: usize,
    /// A round applying at most this many entries counts as caught up.
    pub converged_threshold: usize,
    /// Idle delay between apply rounds.
    pub poll_interval: Duration,
    /// How long donors wait for in-flight writes once writes are blocked.
    pub drain_timeout: Duration,
    /// Delay between retries of the non-abortable commit steps.
    pub commit_retry_interval: Duration,
}

impl Default for ReshardingConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 128,
            apply_batch_size: 256,
            converged_threshold: 16,
            poll_interval: Duration::from_millis(5),
            drain_timeout: Duration::from_secs(2),
            commit_retry_interval: Duration::from_millis(50),
        }
    }
}

/// Handle on one running resharding operation.
pub(crate) struct ActiveResharding {
    cancel: CancellationToken,
    phase: Mutex<CoordinatorPhase>,
    /// Set when an administrator asked for the abort.
    abort_reason: Mutex<Option<String>>,
    finished: watch::Sender<bool>,
}

impl ActiveResharding {
    fn new() -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            phase: Mutex::new(CoordinatorPhase::Initializing),
            abort_reason: Mutex::new(None),
            finished,
        }
    }

    fn phase(&self) -> CoordinatorPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: CoordinatorPhase) {
        *self.phase.lock() = phase;
    }

    /// Move to `Committing` unless an abort got in first.
    fn enter_commit(&self) -> bool {
        let mut phase = self.phase.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        *phase = CoordinatorPhase::Committing;
        true
    }

    fn request_abort(&self, ns: &str, reason: String) -> ShardResult<()> {
        let phase = self.phase.lock();
        if !phase.is_abortable() {
            return Err(ShardError::ReshardCollectionCommitted(ns.to_string()));
        }
        self.abort_reason.lock().get_or_insert(reason);
        self.cancel.cancel();
        Ok(())
    }

    fn requested_abort(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }
}

/// Runs resharding operations for the cluster.
pub struct ReshardingService {
    manager: Arc<ShardingCatalogManager>,
    registry: Arc<ShardRegistry>,
    failpoints: Arc<FailPoints>,
    config: ReshardingConfig,
    active: Mutex<HashMap<String, Arc<ActiveResharding>>>,
    shutdown: CancellationToken,
}

impl ReshardingService {
    pub fn new(
        manager: Arc<ShardingCatalogManager>,
        registry: Arc<ShardRegistry>,
        failpoints: Arc<FailPoints>,
        config: ReshardingConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            failpoints,
            config,
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reshard `ns` onto `new_key` with the given chunk layout and wait for the outcome.
    ///
    /// An empty `distribution` puts the whole new keyspace on the shard that
    /// owns the collection's first chunk.
    pub async fn reshard(
        self: &Arc<Self>,
        ns: &str,
        new_key: ShardKeyPattern,
        distribution: Vec<(ChunkRange, ShardId)>,
    ) -> ShardResult<ChunkVersion> {
        let active = {
            let mut running = self.active.lock();
            if running.contains_key(ns) {
                return Err(ShardError::ReshardCollectionInProgress(ns.to_string()));
            }
            let active = Arc::new(ActiveResharding::new());
            running.insert(ns.to_string(), active.clone());
            active
        };
        let service = self.clone();
        let owned_ns = ns.to_string();
        // The coordinator runs detached so a dropped caller cannot strand critical sections.
        let handle = tokio::spawn(async move {
            let res = service.coordinate(&active, &owned_ns, new_key, distribution).await;
            service.active.lock().remove(&owned_ns);
            active.finished.send_replace(true);
            res
        });
        handle
            .await
            .map_err(|err| ShardError::Internal(format!("resharding coordinator for {ns} failed: {err}")))?
    }

    /// Abort a running resharding of `ns` and wait until it has rolled back.
    pub async fn abort(&self, ns: &str) -> ShardResult<()> {
        let active = self.active.lock().get(ns).cloned();
        let Some(active) = active else {
            return match self.manager.collection(ns).await?.resharding {
                Some(fields) if !fields.phase.is_abortable() => {
                    Err(ShardError::ReshardCollectionCommitted(ns.to_string()))
                }
                _ => Err(ShardError::IllegalOperation(format!(
                    "no resharding of {ns} is in progress"
                ))),
            };
        };
        active.request_abort(ns, "aborted by abortReshardCollection".to_string())?;
        tracing::info!(ns, "abort of resharding requested");
        let mut finished = active.finished.subscribe();
        // The sender lives as long as `active`, which we hold.
        let _ = finished.wait_for(|done| *done).await;
        Ok(())
    }

    /// Phase of the resharding running on `ns`, if any.
    pub fn phase(&self, ns: &str) -> Option<CoordinatorPhase> {
        self.active.lock().get(ns).map(|a| a.phase())
    }

    /// Stop retrying commit steps; used when the cluster shuts down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for active in self.active.lock().values() {
            active.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_refused_once_committing() {
        let active = ActiveResharding::new();
        active.set_phase(CoordinatorPhase::Applying);
        active.request_abort("a.b", "first".to_string()).expect("abortable");
        active.request_abort("a.b", "second".to_string()).expect("still abortable");
        assert_eq!(active.requested_abort().as_deref(), Some("first"));
        assert!(!active.enter_commit());

        let committing = ActiveResharding::new();
        assert!(committing.enter_commit());
        assert_eq!(committing.phase(), CoordinatorPhase::Committing);
        assert!(matches!(
            committing.request_abort("a.b", "late".to_string()),
            Err(ShardError::ReshardCollectionCommitted(_))
        ));
    }
}
