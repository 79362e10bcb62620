//! Metadata commits against the config catalog.
//!
//! Every chunk-changing operation on the catalog goes through this manager:
//! it serialises them behind one lock, recomputes the new routing table with
//! `ChunkMap` and writes it back with a version compare-and-swap. Replays of an
//! already-applied operation return the current version without writing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::{
    load_chunk_map, CasOutcome, CatalogStore, CollectionEntry, ReshardingFields, ShardEntry,
};
use crate::chunk::ChunkRange;
use crate::chunk_map::ChunkMap;
use crate::clock::{ClusterClock, Timestamp};
use crate::error::{ShardError, ShardResult};
use crate::key::{ShardKey, ShardKeyPattern};
use crate::types::{split_namespace, ShardId};
use crate::version::ChunkVersion;

/// Bound on compare-and-swap retries when another writer slips in.
const MAX_CAS_ATTEMPTS: usize = 5;

/// How a new collection's keyspace is laid out.
#[derive(Debug, Clone)]
pub enum InitialChunks {
    /// One chunk covering everything, on this shard.
    Primary(ShardId),
    /// An explicit partition of the keyspace.
    Distribution(Vec<(ChunkRange, ShardId)>),
}

/// Result of a migration commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedMigration {
    pub version: ChunkVersion,
    /// Time from which the recipient owns the range.
    pub valid_after: Timestamp,
}

pub struct ShardingCatalogManager {
    catalog: Arc<dyn CatalogStore>,
    clock: Arc<ClusterClock>,
    chunk_op_lock: Mutex<()>,
    history_window: Duration,
}

impl ShardingCatalogManager {
    pub fn new(catalog: Arc<dyn CatalogStore>, clock: Arc<ClusterClock>, history_window: Duration) -> Self {
        Self {
            catalog,
            clock,
            chunk_op_lock: Mutex::new(()),
            history_window,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn clock(&self) -> &Arc<ClusterClock> {
        &self.clock
    }

    pub async fn add_shard(&self, id: ShardId) -> ShardResult<()> {
        self.catalog
            .add_shard(ShardEntry {
                id,
                draining: false,
            })
            .await
    }

    pub async fn ensure_shard(&self, id: &ShardId) -> ShardResult<()> {
        let shards = self.catalog.list_shards().await?;
        match shards.iter().find(|s| &s.id == id) {
            Some(s) if !s.draining => Ok(()),
            Some(_) => Err(ShardError::IllegalOperation(format!("shard {id} is draining"))),
            None => Err(ShardError::ShardNotFound(id.to_string())),
        }
    }

    /// Current routing table of `ns`.
    pub async fn load(&self, ns: &str) -> ShardResult<ChunkMap> {
        load_chunk_map(self.catalog.as_ref(), ns)
            .await?
            .ok_or_else(|| ShardError::NamespaceNotSharded(ns.to_string()))
    }

    pub async fn collection(&self, ns: &str) -> ShardResult<CollectionEntry> {
        self.catalog
            .read_collection(ns)
            .await?
            .ok_or_else(|| ShardError::NamespaceNotSharded(ns.to_string()))
    }

    pub async fn shard_collection(
        &self,
        ns: &str,
        pattern: ShardKeyPattern,
        initial: InitialChunks,
    ) -> ShardResult<ChunkVersion> {
        if split_namespace(ns).is_none() {
            return Err(ShardError::InvalidOptions(format!("invalid namespace {ns:?}")));
        }
        let _guard = self.chunk_op_lock.lock().await;
        if let Some(existing) = self.catalog.read_collection(ns).await? {
            if existing.key_pattern == pattern {
                return Ok(self.load(ns).await?.collection_version());
            }
            return Err(ShardError::IllegalOperation(format!(
                "{ns} is already sharded on {}",
                existing.key_pattern
            )));
        }

        let assignments = match initial {
            InitialChunks::Primary(shard) => vec![(ChunkRange::full(pattern.width()), shard)],
            InitialChunks::Distribution(assignments) => assignments,
        };
        for (_, shard) in &assignments {
            self.ensure_shard(shard).await?;
        }
        let epoch = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let now = self.clock.tick();
        let map = ChunkMap::create(ns, uuid, epoch, pattern.clone(), assignments, now).map_err(
            |err| match err {
                ShardError::DataInconsistency(msg) => ShardError::InvalidOptions(msg),
                other => other,
            },
        )?;
        let entry = CollectionEntry {
            ns: ns.to_string(),
            uuid,
            epoch,
            key_pattern: pattern,
            allow_migrations: true,
            resharding: None,
            updated_at: now,
        };
        let version = map.collection_version();
        match self
            .catalog
            .cas_write_chunks(ns, None, entry, map.into_chunks())
            .await?
        {
            CasOutcome::Applied => {
                tracing::info!(ns, version = %version, "sharded collection");
                Ok(version)
            }
            CasOutcome::VersionConflict { .. } => Err(ShardError::ConflictingOperationInProgress(
                format!("{ns} was sharded concurrently"),
            )),
        }
    }

    pub async fn drop_collection(&self, ns: &str) -> ShardResult<bool> {
        let _guard = self.chunk_op_lock.lock().await;
        if let Some(entry) = self.catalog.read_collection(ns).await? {
            if entry.resharding.is_some() {
                return Err(ShardError::ConflictingOperationInProgress(format!(
                    "cannot drop {ns} while it is being resharded"
                )));
            }
        }
        let removed = self.catalog.remove_collection(ns).await?;
        if removed {
            tracing::info!(ns, "dropped sharded collection");
        }
        Ok(removed)
    }

    pub async fn commit_split(
        &self,
        ns: &str,
        epoch: Uuid,
        range: &ChunkRange,
        split_points: &[ShardKey],
    ) -> ShardResult<ChunkVersion> {
        let _guard = self.chunk_op_lock.lock().await;
        let map = self
            .rewrite(ns, Some(epoch), |_, map| map.apply_split(range, split_points).map(Some))
            .await?;
        tracing::info!(ns, range = %range, points = split_points.len(), version = %map.collection_version(), "committed chunk split");
        Ok(map.collection_version())
    }

    pub async fn commit_merge(&self, ns: &str, epoch: Uuid, range: &ChunkRange) -> ShardResult<ChunkVersion> {
        let _guard = self.chunk_op_lock.lock().await;
        let map = self
            .rewrite(ns, Some(epoch), |_, map| map.apply_merge(range).map(Some))
            .await?;
        tracing::info!(ns, range = %range, version = %map.collection_version(), "committed chunk merge");
        Ok(map.collection_version())
    }

    /// Hand `range` from `from` to `to`. Idempotent for a replayed commit.
    pub async fn commit_migration(
        &self,
        ns: &str,
        epoch: Uuid,
        range: &ChunkRange,
        from: &ShardId,
        to: &ShardId,
    ) -> ShardResult<CommittedMigration> {
        let _guard = self.chunk_op_lock.lock().await;
        self.ensure_shard(to).await?;
        let window = self.history_window;
        let clock = self.clock.clone();
        let map = self
            .rewrite(ns, Some(epoch), |entry, map| {
                if !entry.allow_migrations || entry.resharding.is_some() {
                    return Err(ShardError::ConflictingOperationInProgress(format!(
                        "migrations are not allowed on {ns}"
                    )));
                }
                let valid_after = clock.tick();
                let next = map.apply_migration_commit(range, from, to, valid_after)?;
                if next == *map {
                    return Ok(None);
                }
                Ok(Some(next.trim_history(valid_after, window)))
            })
            .await?;
        let chunk = map.chunk_exact(range).ok_or_else(|| {
            ShardError::Internal(format!("committed range {range} vanished from {ns}"))
        })?;
        if chunk.shard != *to {
            return Err(ShardError::stale(ns, None, Some(map.collection_version())));
        }
        let committed = CommittedMigration {
            version: map.collection_version(),
            valid_after: chunk.latest_valid_after(),
        };
        tracing::info!(
            ns,
            range = %range,
            from = %from,
            to = %to,
            version = %committed.version,
            "committed chunk migration"
        );
        Ok(committed)
    }

    pub async fn refine_shard_key(&self, ns: &str, new_pattern: ShardKeyPattern) -> ShardResult<ChunkVersion> {
        let _guard = self.chunk_op_lock.lock().await;
        let entry = self.collection(ns).await?;
        if entry.resharding.is_some() {
            return Err(ShardError::ConflictingOperationInProgress(format!(
                "cannot refine {ns} while it is being resharded"
            )));
        }
        if entry.key_pattern == new_pattern {
            return Ok(self.load(ns).await?.collection_version());
        }
        let map = self.load(ns).await?;
        let new_epoch = Uuid::new_v4();
        let refined = map.refine(new_pattern.clone(), new_epoch)?;
        let next_entry = CollectionEntry {
            epoch: new_epoch,
            key_pattern: new_pattern,
            updated_at: self.clock.tick(),
            ..entry
        };
        let version = refined.collection_version();
        self.cas(ns, map.collection_version(), next_entry, refined).await?;
        tracing::info!(ns, version = %version, "refined shard key");
        Ok(version)
    }

    pub async fn set_allow_migrations(&self, ns: &str, allow: bool) -> ShardResult<()> {
        let _guard = self.chunk_op_lock.lock().await;
        let mut entry = self.collection(ns).await?;
        entry.allow_migrations = allow;
        entry.updated_at = self.clock.tick();
        self.catalog.update_collection(entry).await
    }

    /// Record (or clear) resharding state on the collection entry.
    pub async fn set_resharding_fields(&self, ns: &str, fields: Option<ReshardingFields>) -> ShardResult<()> {
        let _guard = self.chunk_op_lock.lock().await;
        let mut entry = self.collection(ns).await?;
        entry.allow_migrations = fields.is_none();
        entry.resharding = fields;
        entry.updated_at = self.clock.tick();
        self.catalog.update_collection(entry).await
    }

    /// Swap `ns` to a new key pattern, epoch and chunk layout in one write.
    pub async fn commit_resharding(
        &self,
        ns: &str,
        expected_epoch: Uuid,
        new_pattern: ShardKeyPattern,
        assignments: Vec<(ChunkRange, ShardId)>,
    ) -> ShardResult<ChunkVersion> {
        let _guard = self.chunk_op_lock.lock().await;
        let entry = self.collection(ns).await?;
        let current = self.load(ns).await?;
        if entry.epoch != expected_epoch {
            if entry.key_pattern == new_pattern {
                return Ok(current.collection_version());
            }
            return Err(ShardError::stale(ns, None, Some(current.collection_version())));
        }
        let epoch = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let now = self.clock.tick();
        let map = ChunkMap::create(ns, uuid, epoch, new_pattern.clone(), assignments, now)?;
        let next_entry = CollectionEntry {
            uuid,
            epoch,
            key_pattern: new_pattern,
            updated_at: now,
            ..entry
        };
        let version = map.collection_version();
        self.cas(ns, current.collection_version(), next_entry, map).await?;
        tracing::info!(ns, version = %version, "committed resharded routing table");
        Ok(version)
    }

    /// Read, transform and CAS-write the routing table of `ns`.
    ///
    /// `f` returns `None` when the operation was already applied.
    async fn rewrite(
        &self,
        ns: &str,
        expected_epoch: Option<Uuid>,
        mut f: impl FnMut(&CollectionEntry, &ChunkMap) -> ShardResult<Option<ChunkMap>>,
    ) -> ShardResult<ChunkMap> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let entry = self.collection(ns).await?;
            let map = self.load(ns).await?;
            if let Some(epoch) = expected_epoch {
                if epoch != entry.epoch {
                    return Err(ShardError::stale(ns, None, Some(map.collection_version())));
                }
            }
            let Some(next) = f(&entry, &map)? else {
                return Ok(map);
            };
            if next == map {
                return Ok(map);
            }
            let expected = map.collection_version();
            let next_entry = CollectionEntry {
                updated_at: self.clock.tick(),
                ..entry
            };
            match self
                .catalog
                .cas_write_chunks(ns, Some(expected), next_entry, next.chunks().to_vec())
                .await?
            {
                CasOutcome::Applied => return Ok(next),
                CasOutcome::VersionConflict { current } => {
                    tracing::debug!(ns, attempt, expected = %expected, current = ?current, "catalog write raced, retrying");
                }
            }
        }
        Err(ShardError::LockTimeout(format!(
            "gave up writing chunks of {ns} after {MAX_CAS_ATTEMPTS} conflicting attempts"
        )))
    }

    async fn cas(&self, ns: &str, expected: ChunkVersion, entry: CollectionEntry, map: ChunkMap) -> ShardResult<()> {
        match self
            .catalog
            .cas_write_chunks(ns, Some(expected), entry, map.into_chunks())
            .await?
        {
            CasOutcome::Applied => Ok(()),
            CasOutcome::VersionConflict { current } => Err(ShardError::ConflictingOperationInProgress(
                format!(
                    "{ns} changed while committing (expected {expected}, found {})",
                    current.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ConfigCatalog;

    async fn manager() -> ShardingCatalogManager {
        let catalog: Arc<dyn CatalogStore> = Arc::new(ConfigCatalog::in_memory());
        let manager = ShardingCatalogManager::new(catalog, Arc::new(ClusterClock::new()), Duration::from_secs(10));
        manager.add_shard(ShardId::from("shard0")).await.expect("shard0");
        manager.add_shard(ShardId::from("shard1")).await.expect("shard1");
        manager
    }

    fn upper() -> ChunkRange {
        ChunkRange::new(ShardKey::int(0), ShardKey::max(1)).expect("range")
    }

    async fn two_chunks(manager: &ShardingCatalogManager) -> Uuid {
        manager
            .shard_collection(
                "foo.bar",
                ShardKeyPattern::new(["x"]).expect("pattern"),
                InitialChunks::Distribution(vec![
                    (
                        ChunkRange::new(ShardKey::min(1), ShardKey::int(0)).expect("range"),
                        ShardId::from("shard0"),
                    ),
                    (upper(), ShardId::from("shard1")),
                ]),
            )
            .await
            .expect("shard collection");
        manager.collection("foo.bar").await.expect("entry").epoch
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shard_collection_is_idempotent_for_same_key() {
        let manager = manager().await;
        let pattern = ShardKeyPattern::new(["x"]).expect("pattern");
        let first = manager
            .shard_collection("a.b", pattern.clone(), InitialChunks::Primary(ShardId::from("shard0")))
            .await
            .expect("first");
        let second = manager
            .shard_collection("a.b", pattern, InitialChunks::Primary(ShardId::from("shard0")))
            .await
            .expect("second");
        assert_eq!(first, second);

        let other = manager
            .shard_collection(
                "a.b",
                ShardKeyPattern::new(["y"]).expect("pattern"),
                InitialChunks::Primary(ShardId::from("shard0")),
            )
            .await
            .expect_err("different key");
        assert!(matches!(other, ShardError::IllegalOperation(_)));

        let missing = manager
            .shard_collection(
                "a.c",
                ShardKeyPattern::new(["x"]).expect("pattern"),
                InitialChunks::Primary(ShardId::from("shard9")),
            )
            .await
            .expect_err("unknown shard");
        assert!(matches!(missing, ShardError::ShardNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn migration_commit_replay_returns_same_version() {
        let manager = manager().await;
        let epoch = two_chunks(&manager).await;
        let from = ShardId::from("shard1");
        let to = ShardId::from("shard0");
        let first = manager
            .commit_migration("foo.bar", epoch, &upper(), &from, &to)
            .await
            .expect("commit");
        let map_after_first = manager.load("foo.bar").await.expect("map");
        let replay = manager
            .commit_migration("foo.bar", epoch, &upper(), &from, &to)
            .await
            .expect("replay");
        assert_eq!(first, replay);
        assert_eq!(manager.load("foo.bar").await.expect("map"), map_after_first);
        assert_eq!(
            map_after_first.owner_of(&ShardKey::int(5), None).expect("owner"),
            to
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn migration_commit_checks_epoch_and_allow_flag() {
        let manager = manager().await;
        let epoch = two_chunks(&manager).await;
        let stale = manager
            .commit_migration(
                "foo.bar",
                Uuid::new_v4(),
                &upper(),
                &ShardId::from("shard1"),
                &ShardId::from("shard0"),
            )
            .await
            .expect_err("wrong epoch");
        assert!(stale.is_stale_config());

        manager.set_allow_migrations("foo.bar", false).await.expect("disallow");
        let blocked = manager
            .commit_migration(
                "foo.bar",
                epoch,
                &upper(),
                &ShardId::from("shard1"),
                &ShardId::from("shard0"),
            )
            .await
            .expect_err("blocked");
        assert!(matches!(blocked, ShardError::ConflictingOperationInProgress(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn split_then_merge_round_trip_versions() {
        let manager = manager().await;
        let epoch = two_chunks(&manager).await;
        let v0 = manager.load("foo.bar").await.expect("map").collection_version();
        let v1 = manager
            .commit_split("foo.bar", epoch, &upper(), &[ShardKey::int(50)])
            .await
            .expect("split");
        assert!(v1 > v0);
        let v2 = manager
            .commit_merge("foo.bar", epoch, &upper())
            .await
            .expect("merge");
        assert!(v2 > v1);
        assert_eq!(manager.load("foo.bar").await.expect("map").chunks().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refine_changes_epoch() {
        let manager = manager().await;
        let epoch = two_chunks(&manager).await;
        let version = manager
            .refine_shard_key("foo.bar", ShardKeyPattern::new(["x", "y"]).expect("pattern"))
            .await
            .expect("refine");
        assert_ne!(version.epoch, epoch);
        let map = manager.load("foo.bar").await.expect("map");
        assert_eq!(map.pattern().width(), 2);
    }
}
