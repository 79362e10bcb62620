//! The router: routes user operations to shards and runs admin commands.
//!
//! Reads and writes attach the collection version of the router's cached
//! routing table. A `StaleConfig` reply marks the cache stale, so the retry
//! goes out with a freshly loaded table.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::try_join_all;
use serde_json::Value;
use uuid::Uuid;

use crate::catalog_cache::CatalogCache;
use crate::catalog_manager::{InitialChunks, ShardingCatalogManager};
use crate::chunk::{Chunk, ChunkRange};
use crate::chunk_map::ChunkMap;
use crate::clock::Timestamp;
use crate::command::{assignments, Command, CommandReply};
use crate::error::{ShardError, ShardResult};
use crate::key::{Document, KeyValue, ShardKey, ShardKeyPattern, ID_FIELD};
use crate::migration::{MoveRangeOutcome, MoveRangeRequest};
use crate::query::{run_pipeline, Filter, Stage, Target, UpdateSpec};
use crate::registry::ShardRegistry;
use crate::resharding::ReshardingService;
use crate::retry::{retry_routed, RetryPolicy};
use crate::session::TxnInfo;
use crate::shard::{InsertReply, UpdateReply};
use crate::types::ShardId;
use crate::version::ChunkVersion;

pub struct Router {
    cache: Arc<CatalogCache>,
    manager: Arc<ShardingCatalogManager>,
    registry: Arc<ShardRegistry>,
    resharding: Arc<ReshardingService>,
    policy: RetryPolicy,
}

impl Router {
    pub fn new(
        cache: Arc<CatalogCache>,
        manager: Arc<ShardingCatalogManager>,
        registry: Arc<ShardRegistry>,
        resharding: Arc<ReshardingService>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            manager,
            registry,
            resharding,
            policy,
        }
    }

    pub fn cache(&self) -> &Arc<CatalogCache> {
        &self.cache
    }

    pub async fn run_command(&self, command: Command) -> ShardResult<CommandReply> {
        let name = command.name();
        let res = self.dispatch(command).await;
        if let Err(err) = &res {
            tracing::debug!(command = name, error = %err, "command failed");
        }
        res
    }

    async fn dispatch(&self, command: Command) -> ShardResult<CommandReply> {
        Ok(match command {
            Command::ShardCollection {
                ns,
                key,
                chunks,
                primary,
            } => {
                let pattern = ShardKeyPattern::new(key)?;
                let initial = match (chunks.is_empty(), primary) {
                    (false, _) => InitialChunks::Distribution(assignments(chunks)?),
                    (true, Some(shard)) => InitialChunks::Primary(shard),
                    (true, None) => InitialChunks::Primary(self.default_primary()?),
                };
                let version = self.shard_collection(&ns, pattern, initial).await?;
                CommandReply::Version { version }
            }
            Command::DropCollection { ns } => CommandReply::Dropped {
                dropped: self.drop_collection(&ns).await?,
            },
            Command::RefineCollectionShardKey { ns, key } => CommandReply::Version {
                version: self.refine_shard_key(&ns, ShardKeyPattern::new(key)?).await?,
            },
            Command::MoveRange { ns, min, max, to } => {
                let outcome = self.move_range(&ns, min, max, to).await?;
                CommandReply::Moved {
                    migration: outcome.id,
                    version: outcome.version,
                }
            }
            Command::SplitChunk { ns, at } => CommandReply::Version {
                version: self.split_chunk(&ns, at).await?,
            },
            Command::MergeChunks { ns, min, max } => CommandReply::Version {
                version: self.merge_chunks(&ns, ChunkRange::new(min, max)?).await?,
            },
            Command::ReshardCollection { ns, key, chunks } => CommandReply::Version {
                version: self
                    .reshard_collection(&ns, ShardKeyPattern::new(key)?, assignments(chunks)?)
                    .await?,
            },
            Command::AbortReshardCollection { ns } => {
                self.abort_reshard_collection(&ns).await?;
                CommandReply::Ok
            }
            Command::FlushRouterConfig { ns } => {
                self.flush_router_config(ns.as_deref());
                CommandReply::Ok
            }
            Command::CleanupOrphaned { ns, start_key } => CommandReply::CleanedUp {
                ranges_waited: self.cleanup_orphaned(&ns, start_key.as_ref()).await?,
            },
            Command::ListChunks { ns } => {
                let map = self.cache.refresh(&ns).await?;
                CommandReply::Chunks {
                    version: map.collection_version(),
                    chunks: map.chunks().to_vec(),
                }
            }
            Command::SetAllowMigrations { ns, allow } => {
                self.set_allow_migrations(&ns, allow).await?;
                CommandReply::Ok
            }
            Command::Find { ns, filter, read_at } => CommandReply::Documents {
                documents: self.find(&ns, &filter, read_at).await?,
            },
            Command::Insert { ns, documents, txn } => {
                let reply = self.insert(&ns, documents, txn).await;
                match reply.error {
                    Some(err) => return Err(err),
                    None => CommandReply::Inserted {
                        inserted: reply.inserted,
                    },
                }
            }
            Command::Update { ns, update, txn } => CommandReply::Updated(self.update(&ns, &update, txn).await?),
            Command::Delete {
                ns,
                filter,
                multi,
                txn,
            } => CommandReply::Deleted {
                deleted: self.delete(&ns, &filter, multi, txn).await?,
            },
            Command::Aggregate { ns, pipeline } => CommandReply::Documents {
                documents: self.aggregate(&ns, &pipeline).await?,
            },
        })
    }

    fn default_primary(&self) -> ShardResult<ShardId> {
        self.registry
            .ids()
            .into_iter()
            .next()
            .ok_or_else(|| ShardError::IllegalOperation("the cluster has no shards".to_string()))
    }

    fn note_error(&self, ns: &str, err: &ShardError) {
        if err.is_stale_config() {
            self.cache.on_stale_config(ns, err.authoritative_version());
        }
    }

    pub async fn shard_collection(
        &self,
        ns: &str,
        pattern: ShardKeyPattern,
        initial: InitialChunks,
    ) -> ShardResult<ChunkVersion> {
        let version = self.manager.shard_collection(ns, pattern, initial).await?;
        self.cache.flush(ns);
        Ok(version)
    }

    /// Drop `ns` from the catalog, then its data on every shard.
    ///
    /// Shards that are down keep their copy; nothing routes to it once the
    /// catalog entry is gone.
    pub async fn drop_collection(&self, ns: &str) -> ShardResult<bool> {
        let dropped = self.manager.drop_collection(ns).await?;
        for shard in self.registry.all() {
            match shard.drop_collection_data(ns).await {
                Ok(()) => {}
                Err(ShardError::ShardUnavailable(id)) => {
                    tracing::warn!(ns, shard = %id, "skipping data drop on unavailable shard");
                }
                Err(err) => return Err(err),
            }
        }
        self.cache.flush(ns);
        Ok(dropped)
    }

    pub async fn refine_shard_key(&self, ns: &str, pattern: ShardKeyPattern) -> ShardResult<ChunkVersion> {
        let version = self.manager.refine_shard_key(ns, pattern).await?;
        self.cache.flush(ns);
        Ok(version)
    }

    /// Move `[min, max)` to `to`, splitting the enclosing chunk first when the
    /// bounds are not chunk boundaries. `max` defaults to the chunk's upper bound.
    pub async fn move_range(
        &self,
        ns: &str,
        min: ShardKey,
        max: Option<ShardKey>,
        to: ShardId,
    ) -> ShardResult<MoveRangeOutcome> {
        let outcome = retry_routed(
            &self.policy,
            "moveRange",
            |_| {
                let min = min.clone();
                let max = max.clone();
                let to = to.clone();
                async move {
                    let map = self.cache.get_routing(ns).await?;
                    let range = self.ensure_chunk_boundaries(ns, &map, min, max).await?;
                    let map = self.cache.get_routing(ns).await?;
                    let chunk = map
                        .chunk_exact(&range)
                        .ok_or_else(|| ShardError::stale(ns, None, None))?;
                    if chunk.shard == to {
                        return Ok(MoveRangeOutcome {
                            id: Uuid::nil(),
                            version: map.collection_version(),
                        });
                    }
                    let donor = self.registry.get(&chunk.shard)?;
                    donor
                        .move_range(MoveRangeRequest {
                            ns: ns.to_string(),
                            range,
                            to,
                            epoch: map.epoch(),
                        })
                        .await
                }
            },
            |err| self.note_error(ns, err),
        )
        .await?;
        self.cache.on_stale_config(ns, Some(outcome.version));
        Ok(outcome)
    }

    /// Split so that `[min, max)` is exactly one chunk; returns that range.
    async fn ensure_chunk_boundaries(
        &self,
        ns: &str,
        map: &ChunkMap,
        min: ShardKey,
        max: Option<ShardKey>,
    ) -> ShardResult<ChunkRange> {
        let width = map.pattern().width();
        if min.width() != width || max.as_ref().is_some_and(|m| m.width() != width) {
            return Err(ShardError::InvalidOptions(format!(
                "moveRange bounds must match the shard key {}",
                map.pattern()
            )));
        }
        let chunk = map
            .find_chunk(&min)
            .ok_or_else(|| ShardError::InvalidOptions(format!("no chunk of {ns} contains {min}")))?;
        let max = max.unwrap_or_else(|| chunk.range.max.clone());
        if max > chunk.range.max {
            return Err(ShardError::InvalidOptions(format!(
                "range [{min}, {max}) spans more than one chunk of {ns}"
            )));
        }
        let range = ChunkRange::new(min, max)?;
        let mut points = Vec::new();
        if range.min > chunk.range.min {
            points.push(range.min.clone());
        }
        if range.max < chunk.range.max {
            points.push(range.max.clone());
        }
        if !points.is_empty() {
            let version = self
                .manager
                .commit_split(ns, map.epoch(), &chunk.range, &points)
                .await?;
            self.cache.on_stale_config(ns, Some(version));
        }
        Ok(range)
    }

    /// Split the chunk containing `at` so that `at` becomes a boundary.
    /// Allow or refuse chunk migrations of `ns`, by users and the balancer alike.
    pub async fn set_allow_migrations(&self, ns: &str, allow: bool) -> ShardResult<()> {
        self.manager.set_allow_migrations(ns, allow).await?;
        tracing::info!(ns, allow, "set allowMigrations");
        Ok(())
    }

    pub async fn split_chunk(&self, ns: &str, at: ShardKey) -> ShardResult<ChunkVersion> {
        let version = retry_routed(
            &self.policy,
            "splitChunk",
            |_| {
                let at = at.clone();
                async move {
                    let map = self.cache.get_routing(ns).await?;
                    let chunk = map
                        .find_chunk(&at)
                        .ok_or_else(|| ShardError::InvalidOptions(format!("no chunk of {ns} contains {at}")))?;
                    if chunk.range.min == at {
                        return Ok(map.collection_version());
                    }
                    self.manager
                        .commit_split(ns, map.epoch(), &chunk.range, &[at])
                        .await
                }
            },
            |err| self.note_error(ns, err),
        )
        .await?;
        self.cache.on_stale_config(ns, Some(version));
        Ok(version)
    }

    /// Merge the chunks tiling `range` on one shard into a single chunk.
    pub async fn merge_chunks(&self, ns: &str, range: ChunkRange) -> ShardResult<ChunkVersion> {
        let range = &range;
        let version = retry_routed(
            &self.policy,
            "mergeChunks",
            |_| async move {
                let map = self.cache.get_routing(ns).await?;
                self.manager.commit_merge(ns, map.epoch(), range).await
            },
            |err| self.note_error(ns, err),
        )
        .await?;
        self.cache.on_stale_config(ns, Some(version));
        Ok(version)
    }

    pub async fn reshard_collection(
        &self,
        ns: &str,
        pattern: ShardKeyPattern,
        distribution: Vec<(ChunkRange, ShardId)>,
    ) -> ShardResult<ChunkVersion> {
        let res = self.resharding.reshard(ns, pattern, distribution).await;
        self.cache.flush(ns);
        res
    }

    pub async fn abort_reshard_collection(&self, ns: &str) -> ShardResult<()> {
        self.resharding.abort(ns).await
    }

    pub fn flush_router_config(&self, ns: Option<&str>) {
        match ns {
            Some(ns) => self.cache.flush(ns),
            None => self.cache.flush_all(),
        }
    }

    /// Wait on every shard for pending orphan deletions of `ns` from `start` on.
    pub async fn cleanup_orphaned(&self, ns: &str, start: Option<&ShardKey>) -> ShardResult<usize> {
        let map = self.cache.get_routing(ns).await?;
        if let Some(start) = start {
            if start.width() != map.pattern().width() {
                return Err(ShardError::InvalidOptions(format!(
                    "startingFromKey {start} does not match the shard key {}",
                    map.pattern()
                )));
            }
        }
        let mut waited = 0;
        for shard in self.registry.all() {
            waited += shard.cleanup_orphaned(ns, start).await?;
        }
        Ok(waited)
    }

    pub async fn find(&self, ns: &str, filter: &Filter, read_at: Option<Timestamp>) -> ShardResult<Vec<Document>> {
        let mut docs = retry_routed(
            &self.policy,
            "find",
            |_| async move {
                let map = self.cache.get_routing(ns).await?;
                let version = map.collection_version();
                let shards = target_shards(&map, filter, read_at)?;
                let handles = shards
                    .iter()
                    .map(|id| self.registry.get(id))
                    .collect::<ShardResult<Vec<_>>>()?;
                let pages = try_join_all(
                    handles
                        .iter()
                        .map(|shard| shard.find(ns, filter, Some(version), read_at)),
                )
                .await?;
                Ok(pages.into_iter().flatten().collect::<Vec<_>>())
            },
            |err| self.note_error(ns, err),
        )
        .await?;
        docs.sort_by_cached_key(|doc| doc.get(ID_FIELD).map(id_sort_key).unwrap_or_default());
        Ok(docs)
    }

    /// Insert `docs` in order. Documents without an `_id` get a generated one.
    ///
    /// Consecutive documents bound for the same shard go out as one batch.
    /// When a batch fails part-way with a retryable error only the remainder is
    /// resent, with statement ids continuing where the applied prefix stopped.
    pub async fn insert(&self, ns: &str, mut docs: Vec<Document>, txn: Option<TxnInfo>) -> InsertReply {
        let mut reply = InsertReply::default();
        for doc in &mut docs {
            if !doc.contains_key(ID_FIELD) {
                doc.insert(ID_FIELD.to_string(), Value::String(Uuid::new_v4().to_string()));
            }
        }
        let attempts = self.policy.max_attempts.max(1);
        let mut failures = 0;
        while reply.inserted < docs.len() {
            let applied = reply.inserted;
            let err = match self.insert_batch(ns, &docs[applied..], txn.map(|t| t.offset(applied))).await {
                Ok(batch) => {
                    reply.inserted += batch.inserted;
                    match batch.error {
                        Some(err) => err,
                        None => continue,
                    }
                }
                Err(err) => err,
            };
            failures += 1;
            if !err.is_retryable() || failures >= attempts {
                reply.error = Some(err);
                return reply;
            }
            tracing::debug!(ns, applied = reply.inserted, error = %err, "retrying insert remainder");
            self.note_error(ns, &err);
            tokio::time::sleep(self.policy.backoff(failures)).await;
        }
        reply
    }

    /// Send the leading run of `docs` that routes to one shard.
    async fn insert_batch(&self, ns: &str, docs: &[Document], txn: Option<TxnInfo>) -> ShardResult<InsertReply> {
        let map = self.cache.get_routing(ns).await?;
        let pattern = map.pattern();
        let owner = map.owner_of(&pattern.extract(&docs[0])?, None)?;
        let mut end = 1;
        while end < docs.len() && map.owner_of(&pattern.extract(&docs[end])?, None)? == owner {
            end += 1;
        }
        let shard = self.registry.get(&owner)?;
        Ok(shard
            .insert(ns, &docs[..end], Some(map.collection_version()), txn)
            .await)
    }

    /// Route an update. Single-document updates stop at the first shard with a match.
    ///
    /// Shards that already applied the update are not sent it again when a
    /// later shard asks for a retry; their counts are kept.
    pub async fn update(&self, ns: &str, spec: &UpdateSpec, txn: Option<TxnInfo>) -> ShardResult<UpdateReply> {
        let mut total = UpdateReply::default();
        let mut applied = BTreeSet::new();
        let mut failures = 0;
        loop {
            match self.update_pass(ns, spec, txn, &mut applied, &mut total).await {
                Ok(()) => return Ok(total),
                Err(err) => {
                    failures += 1;
                    self.back_off(ns, "update", err, failures).await?;
                }
            }
        }
    }

    async fn update_pass(
        &self,
        ns: &str,
        spec: &UpdateSpec,
        txn: Option<TxnInfo>,
        applied: &mut BTreeSet<ShardId>,
        total: &mut UpdateReply,
    ) -> ShardResult<()> {
        let map = self.cache.get_routing(ns).await?;
        let version = Some(map.collection_version());
        let shards = target_shards(&map, &spec.filter, None)?;
        if spec.upsert && shards.len() != 1 {
            return Err(ShardError::InvalidOptions(format!(
                "upsert on {ns} must specify the full shard key {}",
                map.pattern()
            )));
        }
        for id in shards.difference(applied).cloned().collect::<Vec<_>>() {
            let reply = self.registry.get(&id)?.update(ns, spec, version, txn).await?;
            total.matched += reply.matched;
            total.modified += reply.modified;
            total.upserted = total.upserted.take().or(reply.upserted);
            applied.insert(id);
            if !spec.multi && (total.matched > 0 || total.upserted.is_some()) {
                break;
            }
        }
        Ok(())
    }

    /// Route a delete; like `update`, a retry only reaches shards that have not applied it.
    pub async fn delete(&self, ns: &str, filter: &Filter, multi: bool, txn: Option<TxnInfo>) -> ShardResult<usize> {
        let mut deleted = 0;
        let mut applied = BTreeSet::new();
        let mut failures = 0;
        loop {
            match self.delete_pass(ns, filter, multi, txn, &mut applied, &mut deleted).await {
                Ok(()) => return Ok(deleted),
                Err(err) => {
                    failures += 1;
                    self.back_off(ns, "delete", err, failures).await?;
                }
            }
        }
    }

    async fn delete_pass(
        &self,
        ns: &str,
        filter: &Filter,
        multi: bool,
        txn: Option<TxnInfo>,
        applied: &mut BTreeSet<ShardId>,
        deleted: &mut usize,
    ) -> ShardResult<()> {
        let map = self.cache.get_routing(ns).await?;
        let version = Some(map.collection_version());
        let shards = target_shards(&map, filter, None)?;
        for id in shards.difference(applied).cloned().collect::<Vec<_>>() {
            *deleted += self
                .registry
                .get(&id)?
                .delete(ns, filter, multi, version, txn)
                .await?;
            applied.insert(id);
            if !multi && *deleted > 0 {
                break;
            }
        }
        Ok(())
    }

    /// Give up on `err` or wait before the next pass of a targeted write.
    async fn back_off(&self, ns: &str, what: &str, err: ShardError, failures: u32) -> ShardResult<()> {
        let attempts = self.policy.max_attempts.max(1);
        if !err.is_retryable() {
            return Err(err);
        }
        if failures >= attempts {
            tracing::warn!(op = what, attempts, error = %err, "routed operation ran out of retries");
            return Err(err);
        }
        tracing::debug!(op = what, attempt = failures, error = %err, "retrying shards that have not applied");
        self.note_error(ns, &err);
        tokio::time::sleep(self.policy.backoff(failures)).await;
        Ok(())
    }

    /// Leading `$match` stages run on the shards; the rest runs here.
    pub async fn aggregate(&self, ns: &str, stages: &[Stage]) -> ShardResult<Vec<Document>> {
        let pushed = stages
            .iter()
            .take_while(|s| matches!(s, Stage::Match(_)))
            .count();
        let filter = match &stages[..pushed] {
            [] => Filter::All,
            [Stage::Match(only)] => only.clone(),
            leading => Filter::And(
                leading
                    .iter()
                    .filter_map(|s| match s {
                        Stage::Match(f) => Some(f.clone()),
                        _ => None,
                    })
                    .collect(),
            ),
        };
        let docs = self.find(ns, &filter, None).await?;
        let map = self.cache.get_routing(ns).await?;
        run_pipeline(docs, &stages[pushed..], map.pattern())
    }

    /// Chunks of `ns` from a freshly loaded routing table.
    pub async fn list_chunks(&self, ns: &str) -> ShardResult<Vec<Chunk>> {
        Ok(self.cache.refresh(ns).await?.chunks().to_vec())
    }
}

/// Shards owning some part of the keyspace `filter` can match, latest or as of `read_at`.
fn target_shards(map: &ChunkMap, filter: &Filter, read_at: Option<Timestamp>) -> ShardResult<BTreeSet<ShardId>> {
    let owner = |chunk: &Chunk| -> ShardResult<ShardId> {
        match read_at {
            None => Ok(chunk.shard.clone()),
            Some(ts) => chunk.owner_at(ts).cloned().ok_or_else(|| ShardError::StaleChunkHistory {
                ns: map.ns().to_string(),
                read_at: ts,
            }),
        }
    };
    let mut shards = BTreeSet::new();
    match filter.target(map.pattern())? {
        Target::Nothing => {}
        Target::Key(key) => {
            shards.insert(map.owner_of(&key, read_at)?);
        }
        Target::Range(range) => {
            for chunk in map.chunks_overlapping(&range) {
                shards.insert(owner(chunk)?);
            }
        }
        Target::All => {
            for chunk in map.chunks() {
                shards.insert(owner(chunk)?);
            }
        }
    }
    Ok(shards)
}

fn id_sort_key(id: &Value) -> Vec<u8> {
    KeyValue::from_json(id)
        .map(|v| v.encode())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ConfigCatalog;
    use crate::clock::ClusterClock;
    use crate::failpoint::FailPoints;
    use crate::resharding::ReshardingConfig;
    use serde_json::json;
    use std::time::Duration;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scatter_targets_follow_filter_and_history() {
        let catalog: Arc<dyn crate::catalog::CatalogStore> = Arc::new(ConfigCatalog::in_memory());
        let clock = Arc::new(ClusterClock::new());
        let manager = Arc::new(ShardingCatalogManager::new(catalog.clone(), clock, Duration::from_secs(60)));
        for id in ["shard0", "shard1"] {
            manager.add_shard(ShardId::from(id)).await.expect("add shard");
        }
        let pattern = ShardKeyPattern::new(["x"]).expect("pattern");
        let split = ShardKey::int(0);
        manager
            .shard_collection(
                "foo.bar",
                pattern,
                InitialChunks::Distribution(vec![
                    (ChunkRange::new(ShardKey::min(1), split.clone()).expect("low"), ShardId::from("shard0")),
                    (ChunkRange::new(split.clone(), ShardKey::max(1)).expect("high"), ShardId::from("shard1")),
                ]),
            )
            .await
            .expect("shard collection");
        let map = manager.load("foo.bar").await.expect("load");

        let all = target_shards(&map, &Filter::All, None).expect("all");
        assert_eq!(all.len(), 2);
        let one = target_shards(&map, &Filter::eq("x", 5), None).expect("key");
        assert_eq!(one.into_iter().collect::<Vec<_>>(), vec![ShardId::from("shard1")]);
        let low = ChunkRange::new(ShardKey::int(-10), ShardKey::int(-1)).expect("range");
        let ranged = target_shards(&map, &Filter::ShardKeyRange(low), None).expect("range");
        assert_eq!(ranged.into_iter().collect::<Vec<_>>(), vec![ShardId::from("shard0")]);
        assert!(target_shards(&map, &Filter::And(vec![Filter::eq("x", 1), Filter::eq("x", 2)]), None)
            .expect("nothing")
            .is_empty());
        let before_sharding = Timestamp(0);
        assert!(matches!(
            target_shards(&map, &Filter::All, Some(before_sharding)),
            Err(ShardError::StaleChunkHistory { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn admin_commands_need_shards() {
        let catalog: Arc<dyn crate::catalog::CatalogStore> = Arc::new(ConfigCatalog::in_memory());
        let manager = Arc::new(ShardingCatalogManager::new(
            catalog.clone(),
            Arc::new(ClusterClock::new()),
            Duration::from_secs(60),
        ));
        let registry = Arc::new(ShardRegistry::new());
        let resharding = Arc::new(ReshardingService::new(
            manager.clone(),
            registry.clone(),
            Arc::new(FailPoints::new()),
            ReshardingConfig::default(),
        ));
        let router = Router::new(
            Arc::new(CatalogCache::new(catalog)),
            manager,
            registry,
            resharding,
            RetryPolicy::default(),
        );
        let res = router
            .run_command(Command::ShardCollection {
                ns: "foo.bar".into(),
                key: vec!["x".into()],
                chunks: Vec::new(),
                primary: None,
            })
            .await;
        assert!(matches!(res, Err(ShardError::IllegalOperation(_))));
        assert!(matches!(
            router.find("foo.bar", &Filter::All, None).await,
            Err(ShardError::NamespaceNotFound(_))
        ));
        let reply = router.insert("foo.bar", vec![doc(json!({"x": 1}))], None).await;
        assert_eq!(reply.inserted, 0);
        assert!(matches!(reply.error, Some(ShardError::NamespaceNotFound(_))));
    }
}
