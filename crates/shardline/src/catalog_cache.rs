//! Router-side cache of routing tables.
//!
//! Lookups serve the cached `ChunkMap` until something marks it stale: a
//! `StaleConfig` reply from a shard, an explicit flush, or the periodic
//! refresher. Refreshes are single-flight per namespace and only install a
//! table that is newer than the cached one; a new epoch replaces the entry
//! wholesale since versions across epochs do not compare.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::catalog::{load_chunk_map, CatalogStore};
use crate::chunk_map::ChunkMap;
use crate::error::{ShardError, ShardResult};
use crate::version::ChunkVersion;

struct CacheEntry {
    map: Arc<ChunkMap>,
    needs_refresh: bool,
}

pub struct CatalogCache {
    catalog: Arc<dyn CatalogStore>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// One refresh at a time per namespace; later callers reuse its result.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Bumped on every install or flush.
    generation: AtomicU64,
}

impl CatalogCache {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            catalog,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Routing table for `ns`, refreshing first if it is missing or marked stale.
    pub async fn get_routing(&self, ns: &str) -> ShardResult<Arc<ChunkMap>> {
        if let Some(entry) = self.entries.read().get(ns) {
            if !entry.needs_refresh {
                return Ok(entry.map.clone());
            }
        }
        self.refresh(ns).await
    }

    pub fn cached_version(&self, ns: &str) -> Option<ChunkVersion> {
        self.entries.read().get(ns).map(|e| e.map.collection_version())
    }

    /// Reload `ns` from the config catalog.
    pub async fn refresh(&self, ns: &str) -> ShardResult<Arc<ChunkMap>> {
        let seen = self.generation.load(Ordering::Acquire);
        let lock = self
            .inflight
            .lock()
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _flight = lock.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            if let Some(entry) = self.entries.read().get(ns) {
                if !entry.needs_refresh {
                    return Ok(entry.map.clone());
                }
            }
        }

        let Some(loaded) = load_chunk_map(self.catalog.as_ref(), ns).await? else {
            if self.entries.write().remove(ns).is_some() {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            return Err(ShardError::NamespaceNotFound(ns.to_string()));
        };
        Ok(self.install(ns, Arc::new(loaded)))
    }

    /// Install `loaded` unless the cache already holds something newer in the same epoch.
    fn install(&self, ns: &str, loaded: Arc<ChunkMap>) -> Arc<ChunkMap> {
        let mut entries = self.entries.write();
        let installed = match entries.get(ns) {
            Some(current)
                if current.map.epoch() == loaded.epoch()
                    && current.map.collection_version() > loaded.collection_version() =>
            {
                current.map.clone()
            }
            current => {
                let previous = current.map(|c| c.map.collection_version());
                if previous != Some(loaded.collection_version()) {
                    tracing::info!(
                        ns,
                        previous = ?previous,
                        version = %loaded.collection_version(),
                        "router installed routing table"
                    );
                }
                loaded
            }
        };
        entries.insert(
            ns.to_string(),
            CacheEntry {
                map: installed.clone(),
                needs_refresh: false,
            },
        );
        self.generation.fetch_add(1, Ordering::AcqRel);
        installed
    }

    /// A shard answered `StaleConfig`; refresh next time unless we already know `received`.
    pub fn on_stale_config(&self, ns: &str, received: Option<ChunkVersion>) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(ns) else {
            return;
        };
        let cached = entry.map.collection_version();
        let already_current = received.map_or(false, |r| cached.same_epoch(&r) && cached >= r);
        if !already_current {
            tracing::debug!(ns, cached = %cached, received = ?received, "marking routing table stale");
            entry.needs_refresh = true;
        }
    }

    pub fn flush(&self, ns: &str) {
        if self.entries.write().remove(ns).is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            tracing::info!(ns, "flushed routing table");
        }
    }

    pub fn flush_all(&self) {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            entries.clear();
            self.generation.fetch_add(1, Ordering::AcqRel);
            tracing::info!("flushed all routing tables");
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Refresh every cached namespace at `interval` until `cancel` fires.
    pub fn spawn_periodic_refresh(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => return,
                }
                for ns in cache.namespaces() {
                    match cache.refresh(&ns).await {
                        Ok(_) | Err(ShardError::NamespaceNotFound(_)) => {}
                        Err(err) => tracing::warn!(ns, error = %err, "periodic routing refresh failed"),
                    }
                }
            }
        });
    }
}
