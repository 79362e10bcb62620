use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{RecipientDoc, RecipientState, StartReceive};
use crate::chunk::ChunkRange;
use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::failpoint::RECIPIENT_PAUSE_CATCH_UP;
use crate::replication::{MetadataOp, MetadataTxn};
use crate::session::MigratedSession;
use crate::shard::Shard;
use crate::types::ShardId;
use crate::write_log::WriteOp;

/// An incoming migration on the recipient.
pub(crate) struct RecipientSession {
    pub(crate) id: Uuid,
    ns: String,
    range: ChunkRange,
    donor: ShardId,
    state: Mutex<RecipientState>,
    pub(crate) cancel: CancellationToken,
    /// Serialises catch-up rounds between the pull task and the commit.
    apply: tokio::sync::Mutex<()>,
}

impl RecipientSession {
    fn state(&self) -> RecipientState {
        self.state.lock().clone()
    }

    fn set_state(&self, next: RecipientState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(migration = %self.id, from = ?*state, to = ?next, "recipient state");
            *state = next;
        }
    }
}

impl Shard {
    /// Begin receiving `req.range` from its donor.
    pub(crate) async fn start_receive(self: &Arc<Self>, req: StartReceive) -> ShardResult<()> {
        self.ensure_up()?;
        if self.migrations.recipient(req.id).is_some() {
            return Ok(());
        }
        let cfg = self.options.migration;
        if !self
            .range_deleter()
            .wait_for_overlapping(&req.ns, &req.range, cfg.pending_deletion_wait)
            .await
        {
            return Err(ShardError::conflict(
                &req.ns,
                format!("a range deletion overlapping {} is still pending on {}", req.range, self.id()),
            ));
        }
        let state = self.states.get_or_create(&req.ns);
        state.add_receiving(req.id, req.range.clone())?;
        let doc = RecipientDoc {
            id: req.id,
            ns: req.ns.clone(),
            range: req.range.clone(),
            donor: req.donor.clone(),
            pattern: req.pattern.clone(),
            epoch: req.epoch,
        };
        if !self
            .replication
            .durably_commit(MetadataTxn::single(MetadataOp::UpsertRecipient(doc)))
        {
            state.remove_receiving(req.id);
            return Err(ShardError::Storage(format!(
                "could not record incoming migration {}",
                req.id
            )));
        }

        let session = Arc::new(RecipientSession {
            id: req.id,
            ns: req.ns.clone(),
            range: req.range.clone(),
            donor: req.donor.clone(),
            state: Mutex::new(RecipientState::Cloning),
            cancel: self.lifecycle_token().child_token(),
            apply: tokio::sync::Mutex::new(()),
        });
        self.migrations.insert_recipient(session.clone());
        tracing::info!(
            ns = %req.ns,
            migration = %req.id,
            range = %req.range,
            donor = %req.donor,
            "receiving range"
        );
        let shard = self.clone();
        tokio::spawn(async move {
            let res = tokio::select! {
                res = shard.pull(&session) => res,
                _ = session.cancel.cancelled() => return,
            };
            if let Err(err) = res {
                tracing::warn!(migration = %session.id, error = %err, "receive failed");
                session.set_state(RecipientState::Failed(err.to_string()));
            }
        });
        Ok(())
    }

    /// Clone the snapshot, then replay donor writes until the commit takes over.
    async fn pull(&self, session: &RecipientSession) -> ShardResult<()> {
        let cfg = self.options.migration;
        let donor = self.peer(&session.donor)?;
        let mut cloned = 0usize;
        while let Some(docs) = donor.clone_batch(session.id)? {
            for doc in docs {
                self.apply_internal(&session.ns, &WriteOp::Upsert { doc })?;
                cloned += 1;
            }
            tokio::task::yield_now().await;
        }
        tracing::info!(migration = %session.id, docs = cloned, "clone finished");
        session.set_state(RecipientState::CatchingUp { rounds: 0 });

        let mut rounds = 0u32;
        let mut steady = false;
        loop {
            self.failpoints.pause_point(RECIPIENT_PAUSE_CATCH_UP).await;
            let applied = {
                let _apply = session.apply.lock().await;
                if session.state() == RecipientState::Committing {
                    return Ok(());
                }
                self.catch_up_round(session, &donor)?.0
            };
            rounds = rounds.saturating_add(1);
            if applied <= cfg.converged_threshold {
                steady = true;
                session.set_state(RecipientState::Steady);
            } else if !steady {
                if rounds >= cfg.max_catch_up_rounds {
                    return Err(ShardError::conflict(
                        &session.ns,
                        format!("catch-up did not converge after {rounds} rounds"),
                    ));
                }
                session.set_state(RecipientState::CatchingUp { rounds });
            }
            tokio::time::sleep(cfg.poll_interval).await;
        }
    }

    /// Apply one batch of donor writes; returns how many were applied and the log position.
    fn catch_up_round(&self, session: &RecipientSession, donor: &Shard) -> ShardResult<(usize, Timestamp)> {
        let batch = donor.transfer_mods(session.id, self.options.migration.catch_up_batch_size)?;
        for op in &batch.ops {
            self.apply_internal(&session.ns, op)?;
        }
        Ok((batch.ops.len(), batch.position))
    }

    /// Progress of incoming migration `id`.
    pub(crate) fn receive_status(&self, id: Uuid) -> ShardResult<RecipientState> {
        self.ensure_up()?;
        Ok(match self.migrations.recipient(id) {
            Some(session) => session.state(),
            None => RecipientState::Failed(format!("no incoming migration {id} on {}", self.id())),
        })
    }

    /// Final catch-up while the donor blocks writes to the range.
    pub(crate) async fn start_commit(&self, id: Uuid) -> ShardResult<()> {
        self.ensure_up()?;
        let session = self
            .migrations
            .recipient(id)
            .ok_or_else(|| ShardError::Interrupted(format!("no incoming migration {id}")))?;
        if let RecipientState::Failed(reason) = session.state() {
            return Err(ShardError::MigrationAborted {
                ns: session.ns.clone(),
                reason,
            });
        }
        let donor = self.peer(&session.donor)?;
        let _apply = session.apply.lock().await;
        session.set_state(RecipientState::Committing);
        let tip = donor.write_log_tip();
        loop {
            let (_, position) = self.catch_up_round(&session, &donor)?;
            if position >= tip {
                break;
            }
        }
        tracing::info!(migration = %id, range = %session.range, "recipient caught up inside critical section");
        Ok(())
    }

    /// Record a committed migration. Safe to call repeatedly.
    pub async fn commit_receive(&self, id: Uuid, sessions: Vec<MigratedSession>) -> ShardResult<()> {
        self.ensure_up()?;
        self.sessions.import(sessions);
        let session = self.migrations.remove_recipient(id);
        let doc = self.replication.recover().recipients.get(&id).cloned();
        let ns = match (&session, &doc) {
            (Some(s), _) => s.ns.clone(),
            (None, Some(d)) => d.ns.clone(),
            (None, None) => return Ok(()),
        };
        if let Some(session) = &session {
            session.cancel.cancel();
            session.set_state(RecipientState::Done);
        }
        self.refresh_metadata(&ns).await?;
        self.states.get_or_create(&ns).remove_receiving(id);
        if doc.is_some()
            && !self
                .replication
                .durably_commit(MetadataTxn::single(MetadataOp::RemoveRecipient(id)))
        {
            return Err(ShardError::Storage(format!(
                "could not record commit of incoming migration {id}"
            )));
        }
        tracing::info!(ns, migration = %id, "recipient recorded commit");
        Ok(())
    }

    /// Give up on incoming migration `id` and delete what was cloned.
    pub async fn abort_receive(&self, id: Uuid) -> ShardResult<()> {
        self.ensure_up()?;
        let session = self.migrations.remove_recipient(id);
        if let Some(session) = &session {
            session.cancel.cancel();
            // Wait out a catch-up round that is mid-apply.
            let _fence = session.apply.lock().await;
            session.set_state(RecipientState::Failed("aborted by donor".to_string()));
        }
        match self.replication.recover().recipients.get(&id).cloned() {
            Some(doc) => self.discard_receive(&doc),
            None => {
                if let Some(session) = &session {
                    self.states.get_or_create(&session.ns).remove_receiving(id);
                }
            }
        }
        Ok(())
    }
}
