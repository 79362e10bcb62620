//! A shard: document storage plus the sharding metadata that guards it.
//!
//! Every user read and write runs the same checks before storage is touched:
//! critical section, attached version against the shard's authoritative
//! routing table, then ownership. Migration and resharding code reaches into
//! the shard through the `pub(crate)` surface below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLockReadGuard;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::load_chunk_map;
use crate::catalog_manager::ShardingCatalogManager;
use crate::chunk::ChunkRange;
use crate::chunk_map::ChunkMap;
use crate::clock::{ClusterClock, Timestamp};
use crate::error::{ShardError, ShardResult};
use crate::failpoint::FailPoints;
use crate::key::{document_id, Document, ShardKey, ShardKeyPattern};
use crate::migration::{MigrationConfig, MigrationDoc, MigrationPhase, MigrationRegistry, RecipientDoc};
use crate::orphan_filter::{admit_write, OrphanFilter};
use crate::query::{apply_update, upsert_document, Filter, Target, UpdateSpec};
use crate::range_deleter::{RangeDeleter, RangeDeleterConfig, RangeDeleterDeps, RangeDeletionTask};
use crate::registry::ShardRegistry;
use crate::replication::{MetadataOp, MetadataTxn, Replication};
use crate::session::{SessionCatalog, StmtRecord, StmtStatus, TxnInfo};
use crate::shard_version::{ShardVersionGuard, VersionCheck};
use crate::sharding_state::{
    CollectionMetadata, CollectionShardingState, OrphanRange, OrphanReason, ShardingStateRegistry,
};
use crate::snapshot_registry::{SnapshotGuard, SnapshotRegistry};
use crate::storage::StorageEngine;
use crate::types::ShardId;
use crate::version::ChunkVersion;
use crate::write_log::{WriteLog, WriteLogEntry, WriteOp};

const SCAN_PAGE: usize = 256;

/// Per-shard tunables.
#[derive(Clone, Copy, Debug)]
pub struct ShardOptions {
    pub migration: MigrationConfig,
    pub range_deleter: RangeDeleterConfig,
    /// Write-log entries kept for migration catch-up.
    pub write_log_retention: usize,
    /// Minimum age of MVCC versions before they may be pruned.
    pub history_window: Duration,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            migration: MigrationConfig::default(),
            range_deleter: RangeDeleterConfig::default(),
            write_log_retention: 100_000,
            history_window: Duration::from_secs(10),
        }
    }
}

/// Collaborators injected into a shard.
pub struct ShardDeps {
    pub id: ShardId,
    pub clock: Arc<ClusterClock>,
    pub manager: Arc<ShardingCatalogManager>,
    pub storage: Arc<dyn StorageEngine>,
    pub replication: Arc<dyn Replication>,
    pub failpoints: Arc<FailPoints>,
    pub registry: Weak<ShardRegistry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReply {
    /// Documents applied (or recognised as retries) before `error`.
    pub inserted: usize,
    #[serde(skip)]
    pub error: Option<ShardError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateReply {
    pub matched: usize,
    pub modified: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted: Option<Value>,
}

pub struct Shard {
    id: ShardId,
    pub(crate) clock: Arc<ClusterClock>,
    pub(crate) manager: Arc<ShardingCatalogManager>,
    pub(crate) storage: Arc<dyn StorageEngine>,
    pub(crate) write_log: Arc<WriteLog>,
    pub(crate) sessions: Arc<SessionCatalog>,
    pub(crate) snapshots: Arc<SnapshotRegistry>,
    pub(crate) states: Arc<ShardingStateRegistry>,
    pub(crate) replication: Arc<dyn Replication>,
    pub(crate) migrations: Arc<MigrationRegistry>,
    pub(crate) failpoints: Arc<FailPoints>,
    pub(crate) options: ShardOptions,
    registry: Weak<ShardRegistry>,
    /// Orders storage apply with write-log append.
    write_mutex: Mutex<()>,
    deleter_deps: Arc<RangeDeleterDeps>,
    range_deleter: RwLock<Arc<RangeDeleter>>,
    lifecycle: Mutex<CancellationToken>,
    up: AtomicBool,
    prune_horizon: Arc<Mutex<Timestamp>>,
}

impl Shard {
    /// Build the shard, start its range deleter and replay durable metadata.
    pub async fn start(deps: ShardDeps, options: ShardOptions) -> ShardResult<Arc<Self>> {
        let snapshots = Arc::new(SnapshotRegistry::new());
        let states = Arc::new(ShardingStateRegistry::new());
        let prune_horizon = Arc::new(Mutex::new(Timestamp::ZERO));
        let deleter_deps = Arc::new(RangeDeleterDeps {
            storage: deps.storage.clone(),
            snapshots: snapshots.clone(),
            states: states.clone(),
            replication: deps.replication.clone(),
            failpoints: deps.failpoints.clone(),
            clock: deps.clock.clone(),
            prune_horizon: prune_horizon.clone(),
            history_window: options.history_window,
        });
        let lifecycle = CancellationToken::new();
        let deleter = RangeDeleter::spawn(deleter_deps.clone(), options.range_deleter, lifecycle.clone());
        let shard = Arc::new(Self {
            id: deps.id,
            clock: deps.clock,
            manager: deps.manager,
            storage: deps.storage,
            write_log: Arc::new(WriteLog::new(options.write_log_retention)),
            sessions: Arc::new(SessionCatalog::new()),
            snapshots,
            states,
            replication: deps.replication,
            migrations: Arc::new(MigrationRegistry::default()),
            failpoints: deps.failpoints,
            options,
            registry: deps.registry,
            write_mutex: Mutex::new(()),
            deleter_deps,
            range_deleter: RwLock::new(deleter),
            lifecycle: Mutex::new(lifecycle),
            up: AtomicBool::new(true),
            prune_horizon,
        });
        shard.recover().await?;
        tracing::info!(shard = %shard.id, engine = shard.storage.name(), "shard started");
        Ok(shard)
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_up(&self) -> ShardResult<()> {
        if !self.is_up() {
            return Err(ShardError::ShardUnavailable(self.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn peer(&self, id: &ShardId) -> ShardResult<Arc<Shard>> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| ShardError::Internal("shard registry dropped".to_string()))?;
        registry.get(id)
    }

    pub(crate) fn lifecycle_token(&self) -> CancellationToken {
        self.lifecycle.lock().clone()
    }

    pub fn range_deleter(&self) -> Arc<RangeDeleter> {
        self.range_deleter.read().clone()
    }

    pub fn failpoints(&self) -> &Arc<FailPoints> {
        &self.failpoints
    }

    pub fn write_log(&self) -> &Arc<WriteLog> {
        &self.write_log
    }

    pub fn snapshots(&self) -> &Arc<SnapshotRegistry> {
        &self.snapshots
    }

    /// Simulate a process crash: volatile state is lost, background work stops.
    pub async fn crash(&self) {
        if !self.up.swap(false, Ordering::AcqRel) {
            return;
        }
        self.lifecycle.lock().cancel();
        self.migrations.clear();
        self.states.reset_all().await;
        tracing::warn!(shard = %self.id, "shard crashed");
    }

    /// Bring a crashed shard back and finish whatever its durable metadata says is pending.
    pub async fn restart(self: &Arc<Self>) -> ShardResult<()> {
        if self.is_up() {
            return Ok(());
        }
        let token = CancellationToken::new();
        *self.lifecycle.lock() = token.clone();
        *self.range_deleter.write() =
            RangeDeleter::spawn(self.deleter_deps.clone(), self.options.range_deleter, token);
        self.up.store(true, Ordering::Release);
        self.recover().await?;
        tracing::info!(shard = %self.id, "shard restarted");
        Ok(())
    }

    /// Stop background work for good.
    pub(crate) fn shutdown(&self) {
        self.lifecycle.lock().cancel();
        self.up.store(false, Ordering::Release);
    }

    async fn recover(self: &Arc<Self>) -> ShardResult<()> {
        let durable = self.replication.recover();
        let deleter = self.range_deleter();
        for task in durable.range_deletions.values() {
            let reason = if task.immediate {
                OrphanReason::AbortedReceive
            } else {
                OrphanReason::MigratedAway
            };
            self.states.get_or_create(&task.ns).add_orphan(OrphanRange {
                id: task.id,
                range: task.range.clone(),
                since: task.commit_ts,
                reason,
            });
            deleter.schedule(task.clone());
        }
        for doc in durable.recipients.values() {
            self.recover_receive(doc).await?;
        }
        for doc in durable.migrations.values() {
            self.recover_donation(doc).await?;
        }
        Ok(())
    }

    /// Owner of `range` according to the config catalog, if one shard owns all of it.
    async fn catalog_owner(&self, ns: &str, epoch: Uuid, range: &ChunkRange) -> ShardResult<Option<(ShardId, Timestamp)>> {
        let Some(map) = load_chunk_map(self.manager.catalog().as_ref(), ns).await? else {
            return Ok(None);
        };
        if map.epoch() != epoch {
            return Ok(None);
        }
        let chunks = map.chunks_overlapping(range);
        let Some(first) = chunks.first() else {
            return Ok(None);
        };
        if chunks.iter().any(|c| c.shard != first.shard) {
            return Ok(None);
        }
        let valid_after = chunks.iter().map(|c| c.latest_valid_after()).max().unwrap_or(Timestamp::ZERO);
        Ok(Some((first.shard.clone(), valid_after)))
    }

    async fn recover_receive(&self, doc: &RecipientDoc) -> ShardResult<()> {
        let owner = self.catalog_owner(&doc.ns, doc.epoch, &doc.range).await?;
        if owner.map(|(shard, _)| shard) == Some(self.id.clone()) {
            self.refresh_metadata(&doc.ns).await?;
            if !self
                .replication
                .durably_commit(MetadataTxn::single(MetadataOp::RemoveRecipient(doc.id)))
            {
                tracing::warn!(ns = %doc.ns, migration = %doc.id, "could not clear recipient document");
            }
            tracing::info!(ns = %doc.ns, range = %doc.range, migration = %doc.id, "recovered committed receive");
            return Ok(());
        }
        self.discard_receive(doc);
        Ok(())
    }

    async fn recover_donation(self: &Arc<Self>, doc: &MigrationDoc) -> ShardResult<()> {
        if doc.phase == MigrationPhase::Committed {
            self.spawn_recipient_finalizer(doc.clone(), Vec::new());
            return Ok(());
        }
        let owner = self.catalog_owner(&doc.ns, doc.epoch, &doc.range).await?;
        match owner {
            Some((shard, valid_after)) if shard == doc.recipient => {
                tracing::info!(ns = %doc.ns, range = %doc.range, migration = %doc.id, "recovered committed donation");
                self.finish_donation(doc, valid_after, self.pattern_of(&doc.ns).await?).await;
                let sessions = self
                    .sessions
                    .export_for_range(&doc.ns, &doc.range, self.write_log.truncated_through());
                self.spawn_recipient_finalizer(doc.clone(), sessions);
            }
            _ => {
                tracing::info!(ns = %doc.ns, range = %doc.range, migration = %doc.id, "dropping unfinished donation");
                if !self
                    .replication
                    .durably_commit(MetadataTxn::single(MetadataOp::RemoveMigration(doc.id)))
                {
                    tracing::warn!(migration = %doc.id, "could not clear migration document");
                }
            }
        }
        Ok(())
    }

    async fn pattern_of(&self, ns: &str) -> ShardResult<ShardKeyPattern> {
        match self.refresh_metadata(ns).await? {
            CollectionMetadata::Sharded(map) => Ok(map.pattern().clone()),
            _ => Err(ShardError::NamespaceNotSharded(ns.to_string())),
        }
    }

    /// Orphan `doc.range` after its ownership moved to the recipient.
    ///
    /// The committed phase and the range deletion are recorded in one durable
    /// transaction, retried until it lands.
    pub(crate) async fn finish_donation(&self, doc: &MigrationDoc, commit_ts: Timestamp, pattern: ShardKeyPattern) {
        let task = RangeDeletionTask {
            id: Uuid::new_v4(),
            ns: doc.ns.clone(),
            range: doc.range.clone(),
            pattern,
            commit_ts,
            immediate: false,
        };
        let committed = MigrationDoc {
            phase: MigrationPhase::Committed,
            ..doc.clone()
        };
        let txn = MetadataTxn::single(MetadataOp::UpsertMigration(committed))
            .with(MetadataOp::UpsertRangeDeletion(task.clone()));
        while !self.replication.durably_commit(txn.clone()) {
            tracing::warn!(migration = %doc.id, "retrying durable record of committed migration");
            tokio::time::sleep(self.options.migration.poll_interval).await;
        }
        loop {
            match self.refresh_metadata(&doc.ns).await {
                Ok(_) => break,
                Err(err) => {
                    tracing::warn!(ns = %doc.ns, error = %err, "refresh after migration commit failed");
                    tokio::time::sleep(self.options.migration.poll_interval).await;
                }
            }
        }
        self.states.get_or_create(&doc.ns).add_orphan(OrphanRange {
            id: task.id,
            range: task.range.clone(),
            since: commit_ts,
            reason: OrphanReason::MigratedAway,
        });
        self.range_deleter().schedule(task);
    }

    /// Drop a partial clone that never became owned.
    pub(crate) fn discard_receive(&self, doc: &RecipientDoc) {
        let task = RangeDeletionTask {
            id: Uuid::new_v4(),
            ns: doc.ns.clone(),
            range: doc.range.clone(),
            pattern: doc.pattern.clone(),
            commit_ts: self.clock.tick(),
            immediate: true,
        };
        let txn = MetadataTxn::single(MetadataOp::UpsertRangeDeletion(task.clone()))
            .with(MetadataOp::RemoveRecipient(doc.id));
        let state = self.states.get_or_create(&doc.ns);
        state.remove_receiving(doc.id);
        if !self.replication.durably_commit(txn) {
            tracing::warn!(ns = %doc.ns, migration = %doc.id, "could not record discarded receive; retrying on restart");
            return;
        }
        state.add_orphan(OrphanRange {
            id: task.id,
            range: task.range.clone(),
            since: task.commit_ts,
            reason: OrphanReason::AbortedReceive,
        });
        tracing::info!(ns = %doc.ns, range = %doc.range, migration = %doc.id, "discarding partial clone");
        self.range_deleter().schedule(task);
    }

    /// Reload routing for `ns` from the config catalog.
    ///
    /// A concurrent refresh that already installed something newer in the same
    /// epoch is kept.
    pub async fn refresh_metadata(&self, ns: &str) -> ShardResult<CollectionMetadata> {
        let state = self.states.get_or_create(ns);
        let _refresh = state.refresh_lock().lock().await;
        let loaded = match load_chunk_map(self.manager.catalog().as_ref(), ns).await? {
            Some(map) => CollectionMetadata::Sharded(Arc::new(map)),
            None => CollectionMetadata::Unsharded,
        };
        let mut current = state.metadata().write().await;
        if let (Some(have), Some(got)) = (current.version(), loaded.version()) {
            if got < have {
                return Ok(current.clone());
            }
        }
        if current.version() != loaded.version() {
            tracing::debug!(
                shard = %self.id,
                ns,
                version = ?loaded.version(),
                "installed shard routing metadata"
            );
        }
        *current = loaded;
        Ok(current.clone())
    }

    pub fn orphan_ranges(&self, ns: &str) -> Vec<OrphanRange> {
        self.states.get(ns).map(|s| s.orphan_ranges()).unwrap_or_default()
    }

    /// Metadata of `ns` after checking `attached` against it.
    ///
    /// The shard refreshes itself once when the caller is ahead of it or on
    /// another epoch; the returned guard keeps concurrent refreshes out while
    /// the caller works.
    async fn checked_metadata<'a>(
        &self,
        state: &'a CollectionShardingState,
        attached: Option<ChunkVersion>,
    ) -> ShardResult<RwLockReadGuard<'a, CollectionMetadata>> {
        let ns = state.ns();
        let mut refreshed = false;
        loop {
            {
                let meta = state.metadata().read().await;
                if !matches!(*meta, CollectionMetadata::Unknown) {
                    let authoritative = meta.version();
                    match ShardVersionGuard::compare(attached.as_ref(), authoritative.as_ref()) {
                        VersionCheck::Ok => {
                            if matches!(*meta, CollectionMetadata::Unsharded) {
                                return Err(ShardError::NamespaceNotSharded(ns.to_string()));
                            }
                            return Ok(meta);
                        }
                        VersionCheck::Stale => return Err(ShardError::stale(ns, attached, authoritative)),
                        VersionCheck::ShardBehind if refreshed => {
                            return Err(ShardError::stale(ns, attached, authoritative));
                        }
                        VersionCheck::ShardBehind => {}
                    }
                } else if refreshed {
                    return Err(ShardError::ShardUnavailable(self.id.clone()));
                }
            }
            self.refresh_metadata(ns).await?;
            refreshed = true;
        }
    }

    async fn current_pattern(&self, state: &CollectionShardingState) -> ShardResult<Option<ShardKeyPattern>> {
        {
            let meta = state.metadata().read().await;
            if !matches!(*meta, CollectionMetadata::Unknown) {
                return Ok(meta.map().map(|m| m.pattern().clone()));
            }
        }
        let meta = self.refresh_metadata(state.ns()).await?;
        Ok(meta.map().map(|m| m.pattern().clone()))
    }

    fn sharded_map<'m>(meta: &'m CollectionMetadata, ns: &str) -> ShardResult<&'m Arc<ChunkMap>> {
        meta.map()
            .ok_or_else(|| ShardError::NamespaceNotSharded(ns.to_string()))
    }

    fn write_wait(&self) -> Duration {
        self.options.migration.critical_section_timeout
    }

    /// Owned documents of `ns` matching `filter`, latest or as of `read_at`.
    pub async fn find(
        &self,
        ns: &str,
        filter: &Filter,
        attached: Option<ChunkVersion>,
        read_at: Option<Timestamp>,
    ) -> ShardResult<Vec<Document>> {
        self.ensure_up()?;
        let state = self.states.get_or_create(ns);
        state.critical_section().wait_for_read(None, self.write_wait()).await?;
        let meta = self.checked_metadata(&state, attached).await?;
        let map = Self::sharded_map(&meta, ns)?;
        let target = filter.target(map.pattern())?;
        if target.is_nothing() {
            return Ok(Vec::new());
        }

        let _snapshot = match read_at {
            Some(ts) => {
                // Register before checking; pruning and deletion fence first and
                // look for open snapshots after.
                let guard = self.snapshots.acquire(ns, ts, "snapshot read");
                if ts < *self.prune_horizon.lock() {
                    return Err(ShardError::SnapshotTooOld {
                        ns: ns.to_string(),
                        read_at: ts,
                    });
                }
                let range = match &target {
                    Target::Range(r) => Some(r.clone()),
                    Target::Key(k) => map.find_chunk(k).map(|c| c.range.clone()),
                    _ => None,
                };
                state.check_snapshot(ts, range.as_ref())?;
                Some(guard)
            }
            None => None,
        };

        let owned = OrphanFilter::new(map, &self.id, read_at);
        let mut out = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = self.storage.scan(ns, read_at, after.as_deref(), SCAN_PAGE)?;
            let last_page = page.len() < SCAN_PAGE;
            for (id_key, doc) in page {
                after = Some(id_key);
                let key = map.pattern().extract(&doc)?;
                if target.admits(&key) && filter.matches(&doc, map.pattern())? && owned.owns_key(&key)? {
                    out.push(doc);
                }
            }
            if last_page {
                return Ok(out);
            }
        }
    }

    /// Every document physically stored for `ns`, orphans included.
    pub fn raw_documents(&self, ns: &str) -> ShardResult<Vec<Document>> {
        let mut out = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = self.storage.scan(ns, None, after.as_deref(), SCAN_PAGE)?;
            let last_page = page.len() < SCAN_PAGE;
            for (id_key, doc) in page {
                after = Some(id_key);
                out.push(doc);
            }
            if last_page {
                return Ok(out);
            }
        }
    }

    /// Insert `docs` in order, stopping at the first failure.
    ///
    /// Document `i` runs as statement `txn.stmt_id + i` when `txn` is given.
    pub async fn insert(
        &self,
        ns: &str,
        docs: &[Document],
        attached: Option<ChunkVersion>,
        txn: Option<TxnInfo>,
    ) -> InsertReply {
        let mut reply = InsertReply::default();
        if let Err(err) = self.ensure_up() {
            reply.error = Some(err);
            return reply;
        }
        let state = self.states.get_or_create(ns);
        for (i, doc) in docs.iter().enumerate() {
            let stmt = txn.map(|t| t.offset(i));
            if let Err(err) = self.insert_one(&state, doc, attached, stmt).await {
                reply.error = Some(err);
                break;
            }
            reply.inserted += 1;
        }
        reply
    }

    async fn insert_one(
        &self,
        state: &CollectionShardingState,
        doc: &Document,
        attached: Option<ChunkVersion>,
        txn: Option<TxnInfo>,
    ) -> ShardResult<()> {
        let ns = state.ns();
        let hint = match self.current_pattern(state).await? {
            Some(pattern) => Some(pattern.extract(doc)?),
            None => None,
        };
        let _ticket = state.begin_write(hint.as_ref(), self.write_wait()).await?;
        let meta = self.checked_metadata(state, attached).await?;
        let map = Self::sharded_map(&meta, ns)?;
        let key = map.pattern().extract(doc)?;
        if hint.as_ref() != Some(&key) && state.critical_section().blocks_write(Some(&key)) {
            return Err(ShardError::conflict(ns, "shard key changed under a critical section"));
        }
        admit_write(map, &self.id, &key, &state.receiving_ranges())?;
        if let Some(txn) = &txn {
            if self.sessions.check(txn)? == StmtStatus::AlreadyExecuted {
                tracing::debug!(ns, lsid = %txn.lsid, stmt = txn.stmt_id, "skipping retried insert");
                return Ok(());
            }
        }
        let id = document_id(doc)?;
        if let Some(existing) = self.storage.get(ns, &id, None)? {
            if OrphanFilter::new(map, &self.id, None).is_owned(&existing)? {
                return Err(ShardError::DuplicateKey {
                    ns: ns.to_string(),
                    id: id.to_string(),
                });
            }
        }
        self.log_write(ns, WriteOp::Upsert { doc: doc.clone() }, key, txn)?;
        Ok(())
    }

    /// Update owned documents matching `spec.filter`.
    pub async fn update(
        &self,
        ns: &str,
        spec: &UpdateSpec,
        attached: Option<ChunkVersion>,
        txn: Option<TxnInfo>,
    ) -> ShardResult<UpdateReply> {
        self.ensure_up()?;
        if spec.multi && txn.is_some() {
            return Err(ShardError::InvalidOptions(
                "multi updates cannot be retryable writes".to_string(),
            ));
        }
        let state = self.states.get_or_create(ns);
        let hint = self.key_hint(&state, &spec.filter).await?;
        let _ticket = state.begin_write(hint.as_ref(), self.write_wait()).await?;
        let meta = self.checked_metadata(&state, attached).await?;
        let map = Self::sharded_map(&meta, ns)?;
        let pattern = map.pattern();

        if let Some(txn) = &txn {
            if self.sessions.check(txn)? == StmtStatus::AlreadyExecuted {
                return Ok(UpdateReply {
                    matched: 1,
                    modified: 1,
                    upserted: None,
                });
            }
        }

        let matched = self.matching_owned(ns, map, &spec.filter, spec.multi)?;
        self.ensure_unblocked(&state, &matched)?;

        if matched.is_empty() {
            if !spec.upsert {
                return Ok(UpdateReply::default());
            }
            if !matches!(spec.filter.target(pattern)?, Target::Key(_)) {
                return Err(ShardError::InvalidOptions(format!(
                    "upsert on {ns} must specify the full shard key {pattern}"
                )));
            }
            let doc = upsert_document(spec, pattern)?;
            let key = pattern.extract(&doc)?;
            admit_write(map, &self.id, &key, &state.receiving_ranges())?;
            let id = document_id(&doc)?;
            self.log_write(ns, WriteOp::Upsert { doc }, key, txn)?;
            return Ok(UpdateReply {
                matched: 0,
                modified: 0,
                upserted: Some(id.to_json()),
            });
        }

        let mut reply = UpdateReply {
            matched: matched.len(),
            ..UpdateReply::default()
        };
        for (key, doc) in matched {
            let next = apply_update(&doc, &spec.op, pattern)?;
            if next == doc {
                if let Some(txn) = &txn {
                    self.sessions.record(
                        txn,
                        StmtRecord {
                            ns: ns.to_string(),
                            key,
                            ts: self.clock.now(),
                        },
                    );
                }
                continue;
            }
            self.log_write(ns, WriteOp::Upsert { doc: next }, key, txn)?;
            reply.modified += 1;
        }
        Ok(reply)
    }

    /// Delete owned documents matching `filter`; returns how many were removed.
    pub async fn delete(
        &self,
        ns: &str,
        filter: &Filter,
        multi: bool,
        attached: Option<ChunkVersion>,
        txn: Option<TxnInfo>,
    ) -> ShardResult<usize> {
        self.ensure_up()?;
        if multi && txn.is_some() {
            return Err(ShardError::InvalidOptions(
                "multi deletes cannot be retryable writes".to_string(),
            ));
        }
        let state = self.states.get_or_create(ns);
        let hint = self.key_hint(&state, filter).await?;
        let _ticket = state.begin_write(hint.as_ref(), self.write_wait()).await?;
        let meta = self.checked_metadata(&state, attached).await?;
        let map = Self::sharded_map(&meta, ns)?;

        if let Some(txn) = &txn {
            if self.sessions.check(txn)? == StmtStatus::AlreadyExecuted {
                return Ok(1);
            }
        }

        let matched = self.matching_owned(ns, map, filter, multi)?;
        self.ensure_unblocked(&state, &matched)?;
        let mut deleted = 0;
        for (key, doc) in matched {
            let id = document_id(&doc)?;
            self.log_write(ns, WriteOp::Delete { id, pre_image: doc }, key, txn)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn key_hint(&self, state: &CollectionShardingState, filter: &Filter) -> ShardResult<Option<ShardKey>> {
        let Some(pattern) = self.current_pattern(state).await? else {
            return Ok(None);
        };
        match filter.target(&pattern)? {
            Target::Key(key) => Ok(Some(key)),
            _ => Ok(None),
        }
    }

    fn matching_owned(
        &self,
        ns: &str,
        map: &ChunkMap,
        filter: &Filter,
        multi: bool,
    ) -> ShardResult<Vec<(ShardKey, Document)>> {
        let target = filter.target(map.pattern())?;
        let mut out = Vec::new();
        if target.is_nothing() {
            return Ok(out);
        }
        let owned = OrphanFilter::new(map, &self.id, None);
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = self.storage.scan(ns, None, after.as_deref(), SCAN_PAGE)?;
            let last_page = page.len() < SCAN_PAGE;
            for (id_key, doc) in page {
                after = Some(id_key);
                let key = map.pattern().extract(&doc)?;
                if target.admits(&key) && filter.matches(&doc, map.pattern())? && owned.owns_key(&key)? {
                    out.push((key, doc));
                    if !multi {
                        return Ok(out);
                    }
                }
            }
            if last_page {
                return Ok(out);
            }
        }
    }

    /// Fail a multi-document write up front if any of its keys sits in a critical section.
    fn ensure_unblocked(&self, state: &CollectionShardingState, matched: &[(ShardKey, Document)]) -> ShardResult<()> {
        let section = state.critical_section();
        if let Some((key, _)) = matched.iter().find(|(key, _)| section.blocks_write(Some(key))) {
            return Err(ShardError::conflict(
                state.ns(),
                format!("{key} is in a range whose ownership is changing"),
            ));
        }
        Ok(())
    }

    /// Apply a user write to storage and the write log under one timestamp.
    fn log_write(&self, ns: &str, op: WriteOp, key: ShardKey, txn: Option<TxnInfo>) -> ShardResult<Timestamp> {
        let _serial = self.write_mutex.lock();
        let ts = self.clock.tick();
        match &op {
            WriteOp::Upsert { doc } => self.storage.apply_idempotent(ns, doc, ts)?,
            WriteOp::Delete { id, .. } => {
                self.storage.delete(ns, id, ts)?;
            }
        }
        self.write_log.append(WriteLogEntry {
            ts,
            ns: ns.to_string(),
            op,
            txn,
        });
        if let Some(txn) = &txn {
            self.sessions.record(
                txn,
                StmtRecord {
                    ns: ns.to_string(),
                    key,
                    ts,
                },
            );
        }
        Ok(ts)
    }

    /// Timestamp at or after every write applied so far.
    ///
    /// Writes that start afterwards get a larger timestamp, so a snapshot at
    /// this time plus the write log after it covers everything.
    pub(crate) fn stable_timestamp(&self) -> Timestamp {
        let _serial = self.write_mutex.lock();
        self.clock.tick()
    }

    /// Lock used by `stable_timestamp`; held across several shards to pick one time for all.
    pub(crate) fn write_mutex(&self) -> &Mutex<()> {
        &self.write_mutex
    }

    pub(crate) fn acquire_snapshot(&self, ns: &str, purpose: &'static str) -> SnapshotGuard {
        let ts = self.stable_timestamp();
        self.snapshots.acquire(ns, ts, purpose)
    }

    /// Apply a migration or resharding write; these never enter the write log.
    pub(crate) fn apply_internal(&self, ns: &str, op: &WriteOp) -> ShardResult<()> {
        let ts = self.clock.tick();
        match op {
            WriteOp::Upsert { doc } => self.storage.apply_idempotent(ns, doc, ts),
            WriteOp::Delete { id, .. } => self.storage.delete(ns, id, ts).map(|_| ()),
        }
    }

    /// Latest write-log position.
    pub(crate) fn write_log_tip(&self) -> Timestamp {
        self.write_log.latest().unwrap_or(Timestamp::ZERO)
    }

    /// Replace the data of `ns` after a resharding commit, then reload its routing.
    ///
    /// Recipients move `temp_ns` into place; pure donors drop their copy. The
    /// metadata write lock is held throughout so no reader sees the old
    /// routing table over the new data.
    pub(crate) async fn swap_collection_data(&self, ns: &str, temp_ns: Option<&str>) -> ShardResult<()> {
        let state = self.states.get_or_create(ns);
        let _refresh = state.refresh_lock().lock().await;
        let loaded = match load_chunk_map(self.manager.catalog().as_ref(), ns).await? {
            Some(map) => CollectionMetadata::Sharded(Arc::new(map)),
            None => CollectionMetadata::Unsharded,
        };
        let mut meta = state.metadata().write().await;
        self.range_deleter().cancel_namespace(ns);
        match temp_ns {
            Some(temp) => self.storage.rename_collection(temp, ns)?,
            None => self.storage.drop_collection(ns)?,
        }
        tracing::info!(shard = %self.id, ns, version = ?loaded.version(), "swapped collection data");
        *meta = loaded;
        Ok(())
    }

    /// Remove the local data of a dropped collection.
    pub async fn drop_collection_data(&self, ns: &str) -> ShardResult<()> {
        self.ensure_up()?;
        let state = self.states.get_or_create(ns);
        let _refresh = state.refresh_lock().lock().await;
        let mut meta = state.metadata().write().await;
        self.range_deleter().cancel_namespace(ns);
        self.storage.drop_collection(ns)?;
        *meta = CollectionMetadata::Unknown;
        Ok(())
    }

    /// Wait for pending orphan deletions of `ns` on or after `start`.
    ///
    /// Returns how many deletions were waited on.
    pub async fn cleanup_orphaned(&self, ns: &str, start: Option<&ShardKey>) -> ShardResult<usize> {
        self.ensure_up()?;
        if let CollectionMetadata::Unsharded = self.refresh_metadata(ns).await? {
            return Err(ShardError::NamespaceNotSharded(ns.to_string()));
        }
        let cancel = self.lifecycle_token();
        let deleter = self.range_deleter();
        tokio::select! {
            waited = deleter.wait_for_pending(ns, start) => Ok(waited),
            _ = cancel.cancelled() => Err(ShardError::Interrupted(format!("shard {} went down", self.id))),
        }
    }
}
