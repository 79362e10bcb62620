use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use super::{MigrationDoc, MigrationPhase, MoveRangeOutcome, MoveRangeRequest, RecipientState, StartReceive};
use crate::chunk::ChunkRange;
use crate::clock::Timestamp;
use crate::critical_section::CriticalSectionMode;
use crate::error::{ShardError, ShardResult};
use crate::failpoint::{
    MIGRATION_FAIL_BEFORE_COMMIT, MIGRATION_LOSE_COMMIT_ACK, MIGRATION_PAUSE_AFTER_CLONE,
    MIGRATION_PAUSE_BEFORE_CRITICAL_SECTION,
};
use crate::key::{Document, ShardKeyPattern};
use crate::replication::{MetadataOp, MetadataTxn};
use crate::session::MigratedSession;
use crate::shard::Shard;
use crate::sharding_state::CollectionShardingState;
use crate::snapshot_registry::SnapshotGuard;
use crate::storage::{snapshot_cursor, SnapshotCursor};
use crate::write_log::WriteOp;

/// Donor-side state the recipient pulls from.
pub(crate) struct DonorSession {
    pub(crate) id: Uuid,
    ns: String,
    range: ChunkRange,
    pattern: ShardKeyPattern,
    cursor: Mutex<SnapshotCursor>,
    /// Write-log position the recipient has been sent up to.
    position: Mutex<Timestamp>,
    _snapshot: SnapshotGuard,
}

/// Write-log entries for the migrating range, and how far the log was read.
#[derive(Debug, Clone)]
pub(crate) struct ModsBatch {
    pub ops: Vec<WriteOp>,
    pub position: Timestamp,
}

impl Shard {
    /// Move `req.range` (an exact chunk owned here) to `req.to`.
    pub async fn move_range(self: &Arc<Self>, req: MoveRangeRequest) -> ShardResult<MoveRangeOutcome> {
        self.ensure_up()?;
        let cancel = self.lifecycle_token();
        tokio::select! {
            res = self.donate(req) => res,
            _ = cancel.cancelled() => Err(ShardError::Interrupted(format!(
                "shard {} went down during a migration",
                self.id()
            ))),
        }
    }

    async fn donate(self: &Arc<Self>, req: MoveRangeRequest) -> ShardResult<MoveRangeOutcome> {
        let ns = req.ns.as_str();
        if req.to == *self.id() {
            return Err(ShardError::InvalidOptions(format!(
                "{} is already on {}",
                req.range,
                self.id()
            )));
        }
        let meta = self.refresh_metadata(ns).await?;
        let map = meta
            .map()
            .cloned()
            .ok_or_else(|| ShardError::NamespaceNotSharded(ns.to_string()))?;
        let version = map.collection_version();
        if map.epoch() != req.epoch {
            return Err(ShardError::stale(ns, None, Some(version)));
        }
        match map.chunk_exact(&req.range) {
            Some(chunk) if chunk.shard == *self.id() => {}
            _ => return Err(ShardError::stale(ns, None, Some(version))),
        }
        let entry = self.manager.collection(ns).await?;
        if !entry.allow_migrations || entry.resharding.is_some() {
            return Err(ShardError::ConflictingOperationInProgress(format!(
                "migrations are not allowed on {ns}"
            )));
        }
        self.manager.ensure_shard(&req.to).await?;
        let recipient = self.peer(&req.to)?;

        let id = Uuid::new_v4();
        let _lease = self.migrations.acquire_lease(id, ns, &req.range)?;
        let doc = MigrationDoc {
            id,
            ns: ns.to_string(),
            range: req.range.clone(),
            donor: self.id().clone(),
            recipient: req.to.clone(),
            epoch: map.epoch(),
            phase: MigrationPhase::Cloning,
        };
        if !self
            .replication
            .durably_commit(MetadataTxn::single(MetadataOp::UpsertMigration(doc.clone())))
        {
            return Err(ShardError::MigrationAborted {
                ns: ns.to_string(),
                reason: "could not record migration state".to_string(),
            });
        }
        tracing::info!(
            ns,
            migration = %id,
            range = %req.range,
            from = %self.id(),
            to = %req.to,
            "migration started"
        );

        let state = self.states.get_or_create(ns);
        let prepared = self
            .prepare_commit(&state, &recipient, &doc, map.pattern().clone())
            .await;
        if let Err(err) = prepared {
            return Err(self.abort_donation(&state, &doc, err).await);
        }

        let committed = match self
            .manager
            .commit_migration(ns, doc.epoch, &doc.range, &doc.donor, &doc.recipient)
            .await
        {
            Ok(c) if !self.failpoints.should_fail(MIGRATION_LOSE_COMMIT_ACK) => Ok(c),
            Ok(_) => self.learn_commit_outcome(&doc, None).await,
            Err(err) => self.learn_commit_outcome(&doc, Some(err)).await,
        };
        let committed = match committed {
            Ok(c) => c,
            Err(err) => return Err(self.abort_donation(&state, &doc, err).await),
        };

        self.finish_donation(&doc, committed.valid_after, map.pattern().clone())
            .await;
        let sessions = self
            .sessions
            .export_for_range(ns, &doc.range, self.write_log.truncated_through());
        state.critical_section().exit(id);
        self.migrations.remove_donor(id);
        tracing::info!(
            ns,
            migration = %id,
            range = %doc.range,
            version = %committed.version,
            "migration committed"
        );

        if let Err(err) = recipient.commit_receive(id, sessions.clone()).await {
            tracing::warn!(migration = %id, error = %err, "recipient commit failed; finishing in background");
            self.spawn_recipient_finalizer(doc, sessions);
        } else {
            self.forget_migration(id).await;
        }
        Ok(MoveRangeOutcome {
            id,
            version: committed.version,
        })
    }

    /// Clone, catch up and enter the critical section; nothing here changes ownership.
    async fn prepare_commit(
        &self,
        state: &CollectionShardingState,
        recipient: &Arc<Shard>,
        doc: &MigrationDoc,
        pattern: ShardKeyPattern,
    ) -> ShardResult<()> {
        let cfg = self.options.migration;
        let snapshot = self.acquire_snapshot(&doc.ns, "migration clone");
        let clone_ts = snapshot.timestamp();
        let cursor = snapshot_cursor(
            self.storage.clone(),
            doc.ns.clone(),
            pattern.clone(),
            doc.range.clone(),
            Some(clone_ts),
            cfg.clone_batch_size,
        );
        self.migrations.insert_donor(Arc::new(DonorSession {
            id: doc.id,
            ns: doc.ns.clone(),
            range: doc.range.clone(),
            pattern: pattern.clone(),
            cursor: Mutex::new(cursor),
            position: Mutex::new(clone_ts),
            _snapshot: snapshot,
        }));

        recipient
            .start_receive(StartReceive {
                id: doc.id,
                ns: doc.ns.clone(),
                range: doc.range.clone(),
                donor: self.id().clone(),
                pattern,
                epoch: doc.epoch,
            })
            .await?;
        self.record_phase(doc, MigrationPhase::CatchingUp)?;
        self.wait_for_steady(doc).await?;

        self.failpoints
            .pause_point(MIGRATION_PAUSE_BEFORE_CRITICAL_SECTION)
            .await;
        state
            .critical_section()
            .enter(doc.id, doc.range.clone(), CriticalSectionMode::BlockWrites, "migration commit")?;
        self.record_phase(doc, MigrationPhase::CriticalSection)?;
        if !state.inflight().drain(&doc.range, cfg.drain_timeout).await {
            return Err(ShardError::conflict(
                &doc.ns,
                format!("writes to {} did not drain within {:?}", doc.range, cfg.drain_timeout),
            ));
        }
        let recipient = self.peer(&doc.recipient)?;
        recipient.start_commit(doc.id).await?;
        if self.failpoints.should_fail(MIGRATION_FAIL_BEFORE_COMMIT) {
            return Err(ShardError::MigrationAborted {
                ns: doc.ns.clone(),
                reason: "failpoint before commit".to_string(),
            });
        }
        Ok(())
    }

    /// Poll the recipient until it has caught up to within the convergence threshold.
    async fn wait_for_steady(&self, doc: &MigrationDoc) -> ShardResult<()> {
        let cfg = self.options.migration;
        let mut unreachable_since: Option<Instant> = None;
        let mut cloned = false;
        loop {
            tokio::time::sleep(cfg.poll_interval).await;
            let status = match self.peer(&doc.recipient) {
                Ok(peer) => peer.receive_status(doc.id),
                Err(err) => Err(err),
            };
            match status {
                Ok(RecipientState::Failed(reason)) => {
                    return Err(ShardError::MigrationAborted {
                        ns: doc.ns.clone(),
                        reason: format!("recipient failed: {reason}"),
                    });
                }
                Ok(RecipientState::Cloning) => unreachable_since = None,
                Ok(other) => {
                    unreachable_since = None;
                    if !cloned {
                        cloned = true;
                        tracing::debug!(migration = %doc.id, "recipient finished cloning");
                        self.failpoints.pause_point(MIGRATION_PAUSE_AFTER_CLONE).await;
                    }
                    if other == RecipientState::Steady {
                        return Ok(());
                    }
                }
                Err(err) => {
                    let since = *unreachable_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= cfg.lease_ttl {
                        return Err(ShardError::MigrationAborted {
                            ns: doc.ns.clone(),
                            reason: format!(
                                "recipient {} unreachable for {:?}: {err}",
                                doc.recipient, cfg.lease_ttl
                            ),
                        });
                    }
                }
            }
        }
    }

    fn record_phase(&self, doc: &MigrationDoc, phase: MigrationPhase) -> ShardResult<()> {
        let next = MigrationDoc {
            phase,
            ..doc.clone()
        };
        if !self
            .replication
            .durably_commit(MetadataTxn::single(MetadataOp::UpsertMigration(next)))
        {
            return Err(ShardError::MigrationAborted {
                ns: doc.ns.clone(),
                reason: format!("could not record phase {phase:?}"),
            });
        }
        tracing::debug!(migration = %doc.id, phase = ?phase, "migration phase");
        Ok(())
    }

    /// The commit reply was lost or failed: read the catalog to learn whether it applied.
    async fn learn_commit_outcome(
        &self,
        doc: &MigrationDoc,
        err: Option<ShardError>,
    ) -> ShardResult<crate::catalog_manager::CommittedMigration> {
        let map = self.manager.load(&doc.ns).await?;
        if map.epoch() == doc.epoch {
            if let Some(chunk) = map.chunk_exact(&doc.range) {
                if chunk.shard == doc.recipient {
                    tracing::info!(migration = %doc.id, "commit applied despite the lost reply");
                    return Ok(crate::catalog_manager::CommittedMigration {
                        version: map.collection_version(),
                        valid_after: chunk.latest_valid_after(),
                    });
                }
            }
        }
        Err(err.unwrap_or_else(|| ShardError::conflict(&doc.ns, "migration commit was not applied")))
    }

    /// Roll back a migration that never committed; returns the error to report.
    async fn abort_donation(&self, state: &CollectionShardingState, doc: &MigrationDoc, err: ShardError) -> ShardError {
        state.critical_section().exit(doc.id);
        self.migrations.remove_donor(doc.id);
        match self.peer(&doc.recipient) {
            Ok(peer) => {
                if let Err(abort_err) = peer.abort_receive(doc.id).await {
                    tracing::warn!(migration = %doc.id, error = %abort_err, "recipient abort failed");
                }
            }
            Err(peer_err) => {
                tracing::warn!(migration = %doc.id, error = %peer_err, "recipient unreachable during abort");
            }
        }
        if !self
            .replication
            .durably_commit(MetadataTxn::single(MetadataOp::RemoveMigration(doc.id)))
        {
            tracing::warn!(migration = %doc.id, "could not clear aborted migration; recovery will");
        }
        tracing::warn!(
            ns = %doc.ns,
            migration = %doc.id,
            range = %doc.range,
            phase = ?MigrationPhase::Aborted,
            error = %err,
            "migration aborted"
        );
        match err {
            ShardError::MigrationAborted { .. } => err,
            other => ShardError::MigrationAborted {
                ns: doc.ns.clone(),
                reason: other.to_string(),
            },
        }
    }

    async fn forget_migration(&self, id: Uuid) {
        while !self
            .replication
            .durably_commit(MetadataTxn::single(MetadataOp::RemoveMigration(id)))
        {
            tokio::time::sleep(self.options.migration.poll_interval).await;
        }
    }

    /// Keep telling the recipient about a committed migration until it records it.
    pub(crate) fn spawn_recipient_finalizer(self: &Arc<Self>, doc: MigrationDoc, sessions: Vec<MigratedSession>) {
        let shard = self.clone();
        let cancel = self.lifecycle_token();
        tokio::spawn(async move {
            let retry = shard.options.migration.poll_interval * 10;
            loop {
                let attempt = async {
                    let peer = shard.peer(&doc.recipient)?;
                    peer.commit_receive(doc.id, sessions.clone()).await
                };
                let res = tokio::select! {
                    res = attempt => res,
                    _ = cancel.cancelled() => return,
                };
                match res {
                    Ok(()) => {
                        shard.forget_migration(doc.id).await;
                        tracing::info!(migration = %doc.id, "recipient recorded commit");
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(migration = %doc.id, error = %err, "recipient commit retry");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Next batch of snapshot documents for migration `id`; `None` once cloned.
    pub(crate) fn clone_batch(&self, id: Uuid) -> ShardResult<Option<Vec<Document>>> {
        self.ensure_up()?;
        let session = self.migrations.donor(id)?;
        let mut cursor = session.cursor.lock();
        cursor.next_batch()
    }

    /// Writes to the migrating range logged since the last call.
    pub(crate) fn transfer_mods(&self, id: Uuid, limit: usize) -> ShardResult<ModsBatch> {
        self.ensure_up()?;
        let session = self.migrations.donor(id)?;
        let mut position = session.position.lock();
        let (entries, last_seen) = self.write_log.read_after(&session.ns, *position, limit)?;
        let mut ops = Vec::new();
        for entry in entries {
            let key = session.pattern.extract(entry.image())?;
            if session.range.contains(&key) {
                ops.push(entry.op);
            }
        }
        *position = last_seen;
        Ok(ModsBatch {
            ops,
            position: last_seen,
        })
    }
}
