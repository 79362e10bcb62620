//! Cluster metadata store: shards, sharded collections and their chunks.
//!
//! The store is the strongly consistent source of truth for routing. Writers
//! update chunks with a compare-and-swap on the collection version, so two
//! racing metadata commits can never both apply on top of the same state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::Chunk;
use crate::chunk_map::ChunkMap;
use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::key::ShardKeyPattern;
use crate::persist;
use crate::resharding::CoordinatorPhase;
use crate::types::ShardId;
use crate::version::ChunkVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: ShardId,
    #[serde(default)]
    pub draining: bool,
}

/// Resharding bookkeeping carried on the collection entry while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardingFields {
    pub id: Uuid,
    pub phase: CoordinatorPhase,
    pub new_key_pattern: ShardKeyPattern,
    pub temp_ns: String,
    pub donors: Vec<ShardId>,
    pub recipients: Vec<ShardId>,
    #[serde(default)]
    pub clone_timestamp: Option<Timestamp>,
    #[serde(default)]
    pub abort_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub ns: String,
    pub uuid: Uuid,
    pub epoch: Uuid,
    pub key_pattern: ShardKeyPattern,
    #[serde(default = "default_allow_migrations")]
    pub allow_migrations: bool,
    #[serde(default)]
    pub resharding: Option<ReshardingFields>,
    pub updated_at: Timestamp,
}

fn default_allow_migrations() -> bool {
    true
}

/// Result of `cas_write_chunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The stored collection version was not the expected one.
    VersionConflict { current: Option<ChunkVersion> },
}

#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    async fn list_shards(&self) -> ShardResult<Vec<ShardEntry>>;

    async fn add_shard(&self, entry: ShardEntry) -> ShardResult<()>;

    async fn read_collection(&self, ns: &str) -> ShardResult<Option<CollectionEntry>>;

    async fn list_collections(&self) -> ShardResult<Vec<CollectionEntry>>;

    async fn read_chunks(&self, ns: &str) -> ShardResult<Vec<Chunk>>;

    /// Replace the collection entry and all its chunks if the stored
    /// collection version equals `expected` (`None`: the collection must not exist).
    async fn cas_write_chunks(
        &self,
        ns: &str,
        expected: Option<ChunkVersion>,
        entry: CollectionEntry,
        chunks: Vec<Chunk>,
    ) -> ShardResult<CasOutcome>;

    /// Update non-routing collection fields; fails if the epoch changed underneath.
    async fn update_collection(&self, entry: CollectionEntry) -> ShardResult<()>;

    async fn remove_collection(&self, ns: &str) -> ShardResult<bool>;
}

/// Load the routing table of `ns`, or `None` if it is not sharded.
pub async fn load_chunk_map(catalog: &dyn CatalogStore, ns: &str) -> ShardResult<Option<ChunkMap>> {
    let Some(entry) = catalog.read_collection(ns).await? else {
        return Ok(None);
    };
    let chunks = catalog.read_chunks(ns).await?;
    ChunkMap::new(ns, entry.uuid, entry.key_pattern, chunks).map(Some)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogState {
    pub revision: u64,
    pub shards: BTreeMap<ShardId, ShardEntry>,
    pub collections: BTreeMap<String, CollectionEntry>,
    pub chunks: BTreeMap<String, Vec<Chunk>>,
}

impl CatalogState {
    fn collection_version(&self, ns: &str) -> Option<ChunkVersion> {
        self.chunks.get(ns).and_then(|chunks| {
            chunks
                .iter()
                .map(|c| c.version)
                .max_by_key(|v| (v.major, v.minor))
        })
    }
}

/// In-process config catalog with optional JSON persistence.
#[derive(Clone)]
pub struct ConfigCatalog {
    state: Arc<RwLock<CatalogState>>,
    path: Option<PathBuf>,
}

impl ConfigCatalog {
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(CatalogState::default())),
            path: None,
        }
    }

    /// Open the catalog persisted at `path`, starting empty if the file is absent.
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = persist::read_json::<CatalogState>(&path)
            .with_context(|| format!("load config catalog from {}", path.display()))?
            .unwrap_or_default();
        let catalog = Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(path),
        };
        catalog.persist(&catalog.state.read())?;
        Ok(catalog)
    }

    /// Copy of the full catalog state.
    pub fn snapshot(&self) -> CatalogState {
        self.state.read().clone()
    }

    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    /// Apply `mutate` to a copy of the state, persist it, then install it.
    fn update<T>(&self, mutate: impl FnOnce(&mut CatalogState) -> ShardResult<T>) -> ShardResult<T> {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        let out = mutate(&mut next)?;
        next.revision = next.revision.saturating_add(1);
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    fn persist(&self, state: &CatalogState) -> ShardResult<()> {
        match &self.path {
            Some(path) => persist::write_json(path, state),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CatalogStore for ConfigCatalog {
    async fn list_shards(&self) -> ShardResult<Vec<ShardEntry>> {
        Ok(self.state.read().shards.values().cloned().collect())
    }

    async fn add_shard(&self, entry: ShardEntry) -> ShardResult<()> {
        self.update(|state| {
            state.shards.insert(entry.id.clone(), entry);
            Ok(())
        })
    }

    async fn read_collection(&self, ns: &str) -> ShardResult<Option<CollectionEntry>> {
        Ok(self.state.read().collections.get(ns).cloned())
    }

    async fn list_collections(&self) -> ShardResult<Vec<CollectionEntry>> {
        Ok(self.state.read().collections.values().cloned().collect())
    }

    async fn read_chunks(&self, ns: &str) -> ShardResult<Vec<Chunk>> {
        Ok(self.state.read().chunks.get(ns).cloned().unwrap_or_default())
    }

    async fn cas_write_chunks(
        &self,
        ns: &str,
        expected: Option<ChunkVersion>,
        entry: CollectionEntry,
        chunks: Vec<Chunk>,
    ) -> ShardResult<CasOutcome> {
        if entry.ns != ns {
            return Err(ShardError::Internal(format!(
                "collection entry for {} written under {ns}",
                entry.ns
            )));
        }
        self.update(|state| {
            let current = state.collection_version(ns);
            if current != expected {
                return Ok(CasOutcome::VersionConflict { current });
            }
            state.collections.insert(ns.to_string(), entry);
            state.chunks.insert(ns.to_string(), chunks);
            Ok(CasOutcome::Applied)
        })
    }

    async fn update_collection(&self, entry: CollectionEntry) -> ShardResult<()> {
        self.update(|state| {
            let Some(existing) = state.collections.get_mut(&entry.ns) else {
                return Err(ShardError::NamespaceNotFound(entry.ns.clone()));
            };
            if existing.epoch != entry.epoch {
                return Err(ShardError::ConflictingOperationInProgress(format!(
                    "collection {} changed epoch while being updated",
                    entry.ns
                )));
            }
            *existing = entry;
            Ok(())
        })
    }

    async fn remove_collection(&self, ns: &str) -> ShardResult<bool> {
        self.update(|state| {
            let existed = state.collections.remove(ns).is_some();
            state.chunks.remove(ns);
            Ok(existed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkRange;

    fn entry(ns: &str, epoch: Uuid) -> CollectionEntry {
        CollectionEntry {
            ns: ns.to_string(),
            uuid: Uuid::new_v4(),
            epoch,
            key_pattern: ShardKeyPattern::new(["x"]).expect("pattern"),
            allow_migrations: true,
            resharding: None,
            updated_at: Timestamp(1),
        }
    }

    fn single_chunk(epoch: Uuid, major: u64) -> Vec<Chunk> {
        vec![Chunk::new(
            ChunkRange::full(1),
            ShardId::from("shard0"),
            ChunkVersion::new(epoch, major, 0),
            Timestamp(1),
        )]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cas_write_detects_version_conflicts() {
        let catalog = ConfigCatalog::in_memory();
        let epoch = Uuid::new_v4();
        let created = catalog
            .cas_write_chunks("a.b", None, entry("a.b", epoch), single_chunk(epoch, 1))
            .await
            .expect("create");
        assert_eq!(created, CasOutcome::Applied);

        let again = catalog
            .cas_write_chunks("a.b", None, entry("a.b", epoch), single_chunk(epoch, 1))
            .await
            .expect("second create");
        assert_eq!(
            again,
            CasOutcome::VersionConflict {
                current: Some(ChunkVersion::new(epoch, 1, 0))
            }
        );

        let bumped = catalog
            .cas_write_chunks(
                "a.b",
                Some(ChunkVersion::new(epoch, 1, 0)),
                entry("a.b", epoch),
                single_chunk(epoch, 2),
            )
            .await
            .expect("bump");
        assert_eq!(bumped, CasOutcome::Applied);

        let map = load_chunk_map(&catalog, "a.b")
            .await
            .expect("load")
            .expect("sharded");
        assert_eq!(map.collection_version(), ChunkVersion::new(epoch, 2, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn persisted_catalog_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let epoch = Uuid::new_v4();
        {
            let catalog = ConfigCatalog::load_or_init(&path).expect("open");
            catalog
                .add_shard(ShardEntry {
                    id: ShardId::from("shard0"),
                    draining: false,
                })
                .await
                .expect("add shard");
            catalog
                .cas_write_chunks("a.b", None, entry("a.b", epoch), single_chunk(epoch, 1))
                .await
                .expect("create");
        }
        let reopened = ConfigCatalog::load_or_init(&path).expect("reopen");
        assert_eq!(reopened.list_shards().await.expect("shards").len(), 1);
        assert_eq!(reopened.read_chunks("a.b").await.expect("chunks").len(), 1);
        assert!(reopened.remove_collection("a.b").await.expect("remove"));
        assert!(reopened.read_collection("a.b").await.expect("read").is_none());
    }
}
