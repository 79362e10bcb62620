//! In-process cluster: config catalog, shards, resharding service and
//! background tasks wired together, plus handles for routers and fault
//! injection.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;

use crate::balancer::Balancer;
use crate::catalog::{CatalogStore, ConfigCatalog};
use crate::catalog_cache::CatalogCache;
use crate::catalog_manager::ShardingCatalogManager;
use crate::clock::ClusterClock;
use crate::config::{ClusterConfig, StorageKind};
use crate::failpoint::FailPoints;
use crate::registry::ShardRegistry;
use crate::replication::{LocalReplication, Replication};
use crate::resharding::ReshardingService;
use crate::router::Router;
use crate::shard::{Shard, ShardDeps};
use crate::storage::{FjallStorage, MemoryStorage, StorageEngine};
use crate::types::ShardId;

pub struct Cluster {
    config: ClusterConfig,
    clock: Arc<ClusterClock>,
    catalog: Arc<dyn CatalogStore>,
    manager: Arc<ShardingCatalogManager>,
    registry: Arc<ShardRegistry>,
    failpoints: Arc<FailPoints>,
    resharding: Arc<ReshardingService>,
    balancer: Arc<Balancer>,
    shutdown: CancellationToken,
}

impl Cluster {
    pub async fn start(config: ClusterConfig) -> anyhow::Result<Arc<Self>> {
        if config.shards == 0 {
            bail!("a cluster needs at least one shard");
        }
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir).with_context(|| format!("create data dir {}", dir.display()))?;
        }
        let clock = Arc::new(ClusterClock::new());
        let catalog: Arc<dyn CatalogStore> = match &config.data_dir {
            Some(dir) => Arc::new(ConfigCatalog::load_or_init(dir.join("catalog.json"))?),
            None => Arc::new(ConfigCatalog::in_memory()),
        };
        let manager = Arc::new(ShardingCatalogManager::new(
            catalog.clone(),
            clock.clone(),
            config.shard.history_window,
        ));
        let failpoints = Arc::new(FailPoints::new());
        let registry = Arc::new(ShardRegistry::new());

        for idx in 0..config.shards {
            let id = ShardId::new(format!("shard{idx}"));
            manager
                .add_shard(id.clone())
                .await
                .with_context(|| format!("register {id} in the config catalog"))?;
            let storage = open_storage(&config, &id, &clock)?;
            let replication: Arc<dyn Replication> = match &config.data_dir {
                Some(dir) => Arc::new(
                    LocalReplication::open(dir.join(format!("{id}.meta.json")), failpoints.clone())
                        .with_context(|| format!("open metadata log of {id}"))?,
                ),
                None => Arc::new(LocalReplication::in_memory(failpoints.clone())),
            };
            let shard = Shard::start(
                ShardDeps {
                    id: id.clone(),
                    clock: clock.clone(),
                    manager: manager.clone(),
                    storage,
                    replication,
                    failpoints: failpoints.clone(),
                    registry: Arc::downgrade(&registry),
                },
                config.shard,
            )
            .await
            .with_context(|| format!("start {id}"))?;
            registry.insert(shard);
        }

        let resharding = Arc::new(ReshardingService::new(
            manager.clone(),
            registry.clone(),
            failpoints.clone(),
            config.resharding,
        ));
        let balancer = Arc::new(Balancer::new(manager.clone(), registry.clone(), config.balancer));
        let shutdown = CancellationToken::new();
        balancer.clone().spawn(shutdown.child_token());

        tracing::info!(
            shards = config.shards,
            storage = ?config.storage,
            persistent = config.data_dir.is_some(),
            "cluster started"
        );
        Ok(Arc::new(Self {
            config,
            clock,
            catalog,
            manager,
            registry,
            failpoints,
            resharding,
            balancer,
            shutdown,
        }))
    }

    /// A router with its own routing cache.
    pub fn router(&self) -> Router {
        let cache = Arc::new(CatalogCache::new(self.catalog.clone()));
        if !self.config.catalog_refresh_interval.is_zero() {
            cache.spawn_periodic_refresh(self.config.catalog_refresh_interval, self.shutdown.child_token());
        }
        Router::new(
            cache,
            self.manager.clone(),
            self.registry.clone(),
            self.resharding.clone(),
            self.config.retry,
        )
    }

    pub fn shard(&self, id: &str) -> anyhow::Result<Arc<Shard>> {
        Ok(self.registry.get_any(&ShardId::from(id))?)
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.registry.ids()
    }

    pub fn manager(&self) -> &Arc<ShardingCatalogManager> {
        &self.manager
    }

    pub fn clock(&self) -> &Arc<ClusterClock> {
        &self.clock
    }

    pub fn failpoints(&self) -> &Arc<FailPoints> {
        &self.failpoints
    }

    pub fn resharding(&self) -> &Arc<ReshardingService> {
        &self.resharding
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    pub async fn crash_shard(&self, id: &str) -> anyhow::Result<()> {
        self.shard(id)?.crash().await;
        Ok(())
    }

    pub async fn restart_shard(&self, id: &str) -> anyhow::Result<()> {
        self.shard(id)?
            .restart()
            .await
            .with_context(|| format!("restart {id}"))
    }

    /// Stop background tasks and every shard.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.resharding.shutdown();
        for shard in self.registry.all() {
            shard.shutdown();
        }
        tracing::info!("cluster stopped");
    }
}

fn open_storage(config: &ClusterConfig, id: &ShardId, clock: &Arc<ClusterClock>) -> anyhow::Result<Arc<dyn StorageEngine>> {
    Ok(match (config.storage, config.data_dir.as_deref()) {
        (StorageKind::Memory, _) => Arc::new(MemoryStorage::new(clock.clone())),
        (StorageKind::Fjall, Some(dir)) => Arc::new(open_fjall(&dir.join(id.as_str()), clock)?),
        (StorageKind::Fjall, None) => bail!("fjall storage needs a data directory"),
    })
}

fn open_fjall(path: &Path, clock: &Arc<ClusterClock>) -> anyhow::Result<FjallStorage> {
    FjallStorage::open(path, clock.clone()).with_context(|| format!("open fjall storage at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn starts_named_shards() {
        let cluster = Cluster::start(ClusterConfig {
            shards: 3,
            ..ClusterConfig::default()
        })
        .await
        .expect("start");
        assert_eq!(
            cluster.shard_ids(),
            vec![ShardId::from("shard0"), ShardId::from("shard1"), ShardId::from("shard2")]
        );
        cluster.crash_shard("shard1").await.expect("crash");
        assert!(!cluster.shard("shard1").expect("shard1").is_up());
        cluster.restart_shard("shard1").await.expect("restart");
        assert!(cluster.shard("shard1").expect("shard1").is_up());
        assert!(cluster.shard("shard9").is_err());
        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rejects_fjall_without_a_data_dir() {
        let res = Cluster::start(ClusterConfig {
            storage: StorageKind::Fjall,
            ..ClusterConfig::default()
        })
        .await;
        assert!(res.is_err());
    }
}
