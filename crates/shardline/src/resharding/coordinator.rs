use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use uuid::Uuid;

use super::pipeline::{Pipeline, PipelineControl, RecipientTarget};
use super::{ActiveResharding, CoordinatorPhase, ReshardingService};
use crate::catalog::ReshardingFields;
use crate::chunk::ChunkRange;
use crate::chunk_map::ChunkMap;
use crate::clock::Timestamp;
use crate::critical_section::CriticalSectionMode;
use crate::error::{ShardError, ShardResult};
use crate::failpoint::RESHARDING_PAUSE_BEFORE_COMMIT;
use crate::key::ShardKeyPattern;
use crate::shard::Shard;
use crate::snapshot_registry::SnapshotGuard;
use crate::types::{split_namespace, ShardId};
use crate::version::ChunkVersion;

/// State of one resharding operation as the coordinator drives it.
struct ReshardingRun {
    ns: String,
    fields: ReshardingFields,
    distribution: Vec<(ChunkRange, ShardId)>,
    target: Arc<ChunkMap>,
    old_map: Option<Arc<ChunkMap>>,
    donors: Vec<Arc<Shard>>,
    recipients: Vec<Arc<RecipientTarget>>,
    /// Donors and recipients, once each.
    participants: BTreeMap<ShardId, Arc<Shard>>,
    pipelines: JoinSet<ShardResult<()>>,
    control: Arc<PipelineControl>,
    pipeline_count: usize,
    snapshots: Vec<SnapshotGuard>,
}

impl ReshardingRun {
    fn id(&self) -> Uuid {
        self.fields.id
    }

    /// Whole keyspace under the old key; the range every critical section covers.
    fn old_keyspace(&self) -> ShardResult<ChunkRange> {
        let map = self
            .old_map
            .as_ref()
            .ok_or_else(|| ShardError::Internal(format!("routing table of {} not loaded", self.ns)))?;
        Ok(ChunkRange::full(map.pattern().width()))
    }
}

fn pipeline_result(joined: Result<ShardResult<()>, JoinError>) -> ShardResult<()> {
    joined.map_err(|err| ShardError::Internal(format!("resharding pipeline failed: {err}")))?
}

impl ReshardingService {
    pub(super) async fn coordinate(
        &self,
        active: &ActiveResharding,
        ns: &str,
        new_key: ShardKeyPattern,
        distribution: Vec<(ChunkRange, ShardId)>,
    ) -> ShardResult<ChunkVersion> {
        let mut run = self.initialize(ns, new_key, distribution).await?;
        if let Err(err) = self.prepare(active, &mut run).await {
            return Err(self.roll_back(active, &mut run, err).await);
        }
        self.commit(&mut run).await
    }

    /// Validate the request and record the operation on the collection entry.
    async fn initialize(
        &self,
        ns: &str,
        new_key: ShardKeyPattern,
        distribution: Vec<(ChunkRange, ShardId)>,
    ) -> ShardResult<ReshardingRun> {
        let entry = self.manager.collection(ns).await?;
        if entry.resharding.is_some() {
            return Err(ShardError::ReshardCollectionInProgress(ns.to_string()));
        }
        let (db, _) = split_namespace(ns)
            .ok_or_else(|| ShardError::InvalidOptions(format!("invalid namespace {ns:?}")))?;
        let distribution = if distribution.is_empty() {
            let primary = self
                .manager
                .load(ns)
                .await?
                .chunks()
                .first()
                .map(|c| c.shard.clone())
                .ok_or_else(|| ShardError::Internal(format!("{ns} has no chunks")))?;
            vec![(ChunkRange::full(new_key.width()), primary)]
        } else {
            distribution
        };
        for (_, shard) in &distribution {
            self.manager.ensure_shard(shard).await?;
        }
        let target = ChunkMap::create(
            ns,
            entry.uuid,
            Uuid::new_v4(),
            new_key.clone(),
            distribution.clone(),
            Timestamp::ZERO,
        )
        .map_err(|err| match err {
            ShardError::DataInconsistency(msg) => ShardError::InvalidOptions(msg),
            other => other,
        })?;

        let temp_ns = format!("{db}.system.resharding.{}", entry.uuid);
        let mut recipients = Vec::new();
        for id in target.shards() {
            recipients.push(Arc::new(RecipientTarget::new(self.registry.get(&id)?, ns, &temp_ns)));
        }
        let fields = ReshardingFields {
            id: Uuid::new_v4(),
            phase: CoordinatorPhase::Initializing,
            new_key_pattern: new_key,
            temp_ns,
            donors: Vec::new(),
            recipients: recipients.iter().map(|r| r.shard.id().clone()).collect(),
            clone_timestamp: None,
            abort_reason: None,
        };
        self.manager.set_resharding_fields(ns, Some(fields.clone())).await?;
        tracing::info!(
            ns,
            resharding = %fields.id,
            new_key = %fields.new_key_pattern,
            recipients = ?fields.recipients,
            "resharding started"
        );
        let participants = recipients
            .iter()
            .map(|r| (r.shard.id().clone(), r.shard.clone()))
            .collect();
        Ok(ReshardingRun {
            ns: ns.to_string(),
            fields,
            distribution,
            target: Arc::new(target),
            old_map: None,
            donors: Vec::new(),
            recipients,
            participants,
            pipelines: JoinSet::new(),
            control: Arc::new(PipelineControl::new()),
            pipeline_count: 0,
            snapshots: Vec::new(),
        })
    }

    /// Everything up to the point of no return; any error here rolls back.
    async fn prepare(&self, active: &ActiveResharding, run: &mut ReshardingRun) -> ShardResult<()> {
        // Migrations are off from here, so the routing table loaded below is final.
        let old_map = Arc::new(self.manager.load(&run.ns).await?);
        for id in old_map.shards() {
            let shard = self.registry.get(&id)?;
            run.participants.insert(id, shard.clone());
            run.donors.push(shard);
        }
        run.fields.donors = run.donors.iter().map(|d| d.id().clone()).collect();
        run.old_map = Some(old_map.clone());
        self.record_phase(active, run, CoordinatorPhase::PreparingToDonate).await?;

        let clone_ts = self.choose_clone_timestamp(run);
        run.fields.clone_timestamp = Some(clone_ts);
        self.record_phase(active, run, CoordinatorPhase::Cloning).await?;
        self.spawn_pipelines(active, run, old_map, clone_ts)?;
        let total = run.pipeline_count;
        self.wait_for_pipelines(active, run, |c| c.cloned() >= total).await?;

        self.record_phase(active, run, CoordinatorPhase::Applying).await?;
        self.wait_for_pipelines(active, run, |c| c.steady() >= total).await?;

        self.record_phase(active, run, CoordinatorPhase::BlockingWrites).await?;
        self.block_writes(active, run).await?;

        tokio::select! {
            _ = self.failpoints.pause_point(RESHARDING_PAUSE_BEFORE_COMMIT) => {}
            _ = active.cancel.cancelled() => return Err(self.cancelled(run)),
        }
        if !active.enter_commit() {
            return Err(self.cancelled(run));
        }
        Ok(())
    }

    /// One timestamp before which every donor's writes are in storage and after which all are in its write log.
    fn choose_clone_timestamp(&self, run: &mut ReshardingRun) -> Timestamp {
        // Donors are sorted by id, so concurrent callers lock in the same order.
        let guards: Vec<_> = run.donors.iter().map(|d| d.write_mutex().lock()).collect();
        let clone_ts = self.manager.clock().tick();
        for donor in &run.donors {
            run.snapshots
                .push(donor.snapshots.acquire(&run.ns, clone_ts, "resharding clone"));
        }
        drop(guards);
        clone_ts
    }

    fn spawn_pipelines(
        &self,
        active: &ActiveResharding,
        run: &mut ReshardingRun,
        old_map: Arc<ChunkMap>,
        clone_ts: Timestamp,
    ) -> ShardResult<()> {
        for donor in &run.donors {
            for recipient in &run.recipients {
                let pipeline = Pipeline {
                    ns: run.ns.clone(),
                    donor: donor.clone(),
                    recipient: recipient.clone(),
                    old_map: old_map.clone(),
                    target: run.target.clone(),
                    clone_ts,
                    config: self.config,
                    failpoints: self.failpoints.clone(),
                    control: run.control.clone(),
                };
                let cancel = active.cancel.clone();
                run.pipelines.spawn(async move {
                    tokio::select! {
                        res = pipeline.run() => res,
                        _ = cancel.cancelled() => Err(ShardError::Interrupted("resharding cancelled".to_string())),
                    }
                });
                run.pipeline_count += 1;
            }
        }
        tracing::info!(
            ns = %run.ns,
            resharding = %run.id(),
            clone_ts = %clone_ts,
            pipelines = run.pipeline_count,
            "resharding pipelines started"
        );
        Ok(())
    }

    /// Wait until `done` holds, failing as soon as any pipeline fails.
    async fn wait_for_pipelines(
        &self,
        active: &ActiveResharding,
        run: &mut ReshardingRun,
        done: impl Fn(&PipelineControl) -> bool,
    ) -> ShardResult<()> {
        let control = run.control.clone();
        loop {
            let changed = control.changed().notified();
            if done(&control) {
                return Ok(());
            }
            tokio::select! {
                _ = changed => {}
                joined = run.pipelines.join_next() => match joined {
                    Some(res) => pipeline_result(res)?,
                    None => {
                        return Err(ShardError::Internal(format!(
                            "resharding pipelines for {} exited early",
                            run.ns
                        )))
                    }
                },
                _ = active.cancel.cancelled() => return Err(self.cancelled(run)),
            }
        }
    }

    /// Block writes on every participant, then let pipelines apply the last of the donors' writes.
    async fn block_writes(&self, active: &ActiveResharding, run: &mut ReshardingRun) -> ShardResult<()> {
        let keyspace = run.old_keyspace()?;
        for shard in run.participants.values() {
            shard.states.get_or_create(&run.ns).critical_section().enter(
                run.id(),
                keyspace.clone(),
                CriticalSectionMode::BlockWrites,
                "resharding",
            )?;
        }
        let mut positions = BTreeMap::new();
        for donor in &run.donors {
            let state = donor.states.get_or_create(&run.ns);
            if !state.inflight().drain(&keyspace, self.config.drain_timeout).await {
                return Err(ShardError::conflict(
                    &run.ns,
                    format!("writes on {} did not drain within {:?}", donor.id(), self.config.drain_timeout),
                ));
            }
            positions.insert(donor.id().clone(), donor.write_log_tip());
        }
        run.control.stop_at(positions);
        loop {
            let joined = tokio::select! {
                joined = run.pipelines.join_next() => joined,
                _ = active.cancel.cancelled() => return Err(self.cancelled(run)),
            };
            match joined {
                Some(res) => pipeline_result(res)?,
                None => break,
            }
        }
        let docs: usize = run.recipients.iter().map(|r| r.document_count()).sum();
        tracing::info!(ns = %run.ns, resharding = %run.id(), docs, "recipients caught up with blocked donors");
        Ok(())
    }

    /// Swap routing and data to the new layout. Every step is retried until it lands.
    async fn commit(&self, run: &mut ReshardingRun) -> ShardResult<ChunkVersion> {
        let ns = run.ns.as_str();
        let id = run.fields.id;
        run.fields.phase = CoordinatorPhase::Committing;
        self.store_fields(ns, Some(run.fields.clone())).await?;
        for shard in run.participants.values() {
            if let Err(err) = shard.states.get_or_create(ns).critical_section().promote(id) {
                tracing::warn!(shard = %shard.id(), error = %err, "could not block reads for cutover");
            }
        }
        let old_epoch = run
            .old_map
            .as_ref()
            .map(|m| m.epoch())
            .ok_or_else(|| ShardError::Internal(format!("routing table of {ns} not loaded")))?;
        let pattern = run.fields.new_key_pattern.clone();
        let distribution = run.distribution.clone();
        let version = self
            .retry_until_done("commit resharded routing table", move || {
                self.manager
                    .commit_resharding(ns, old_epoch, pattern.clone(), distribution.clone())
            })
            .await?;

        for shard in self.registry.all() {
            let temp_ns = run
                .recipients
                .iter()
                .any(|r| r.shard.id() == shard.id())
                .then_some(run.fields.temp_ns.as_str());
            if !run.participants.contains_key(shard.id()) && !shard.is_up() {
                tracing::warn!(shard = %shard.id(), ns, "skipping data swap on a down shard that holds no chunks");
                continue;
            }
            let shard = &shard;
            self.retry_until_done("swap collection data", move || async move {
                shard.ensure_up()?;
                shard.swap_collection_data(ns, temp_ns).await
            })
            .await?;
        }
        for shard in run.participants.values() {
            shard.states.get_or_create(ns).critical_section().exit(id);
        }
        run.snapshots.clear();

        run.fields.phase = CoordinatorPhase::Done;
        self.store_fields(ns, Some(run.fields.clone())).await?;
        self.store_fields(ns, None).await?;
        tracing::info!(ns, resharding = %id, version = %version, "resharding committed");
        Ok(version)
    }

    async fn store_fields(&self, ns: &str, fields: Option<ReshardingFields>) -> ShardResult<()> {
        self.retry_until_done("record resharding state", move || {
            self.manager.set_resharding_fields(ns, fields.clone())
        })
        .await
    }

    /// Run `op` until it succeeds or the service shuts down.
    async fn retry_until_done<T, F, Fut>(&self, what: &str, mut op: F) -> ShardResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ShardResult<T>>,
    {
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(step = what, error = %err, "resharding commit step failed; retrying");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.commit_retry_interval) => {}
                _ = self.shutdown.cancelled() => {
                    return Err(ShardError::Interrupted(format!("shutting down during {what}")));
                }
            }
        }
    }

    async fn record_phase(
        &self,
        active: &ActiveResharding,
        run: &mut ReshardingRun,
        phase: CoordinatorPhase,
    ) -> ShardResult<()> {
        if active.cancel.is_cancelled() {
            return Err(self.cancelled(run));
        }
        run.fields.phase = phase;
        self.manager
            .set_resharding_fields(&run.ns, Some(run.fields.clone()))
            .await?;
        active.set_phase(phase);
        tracing::info!(ns = %run.ns, resharding = %run.id(), phase = ?phase, "resharding phase");
        Ok(())
    }

    fn cancelled(&self, run: &ReshardingRun) -> ShardError {
        ShardError::Interrupted(format!("resharding {} of {} was cancelled", run.id(), run.ns))
    }

    /// Undo everything: stop pipelines, drop temporary data, release
    /// critical sections and clear the collection entry.
    async fn roll_back(&self, active: &ActiveResharding, run: &mut ReshardingRun, err: ShardError) -> ShardError {
        let requested = active.requested_abort();
        let reason = requested.clone().unwrap_or_else(|| err.to_string());
        tracing::warn!(ns = %run.ns, resharding = %run.id(), reason, "aborting resharding");
        active.set_phase(CoordinatorPhase::Aborting);
        run.fields.phase = CoordinatorPhase::Aborting;
        run.fields.abort_reason = Some(reason.clone());
        if let Err(err) = self
            .manager
            .set_resharding_fields(&run.ns, Some(run.fields.clone()))
            .await
        {
            tracing::warn!(ns = %run.ns, error = %err, "could not record aborting phase");
        }

        active.cancel.cancel();
        // No pipeline may write to a recipient after this returns.
        run.pipelines.shutdown().await;
        for recipient in &run.recipients {
            if let Err(err) = recipient.shard.storage.drop_collection(&recipient.temp_ns) {
                tracing::warn!(shard = %recipient.shard.id(), error = %err, "could not drop temporary collection");
            }
        }
        for shard in run.participants.values() {
            shard.states.get_or_create(&run.ns).critical_section().exit(run.id());
        }
        run.snapshots.clear();
        if let Err(err) = self.store_fields(&run.ns, None).await {
            tracing::warn!(ns = %run.ns, error = %err, "could not clear resharding state");
        }
        tracing::info!(ns = %run.ns, resharding = %run.id(), "resharding rolled back");
        match requested {
            Some(reason) => ShardError::ReshardCollectionAborted {
                ns: run.ns.clone(),
                reason,
            },
            None => err,
        }
    }
}
