//! Background chunk balancing.
//!
//! Each round moves at most one chunk per collection, from the shard holding
//! the most chunks to the one holding the fewest, through the same donor
//! path as an admin `moveRange`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::catalog_manager::ShardingCatalogManager;
use crate::chunk::ChunkRange;
use crate::chunk_map::ChunkMap;
use crate::error::ShardError;
use crate::migration::MoveRangeRequest;
use crate::registry::ShardRegistry;
use crate::types::ShardId;

#[derive(Clone, Copy, Debug)]
pub struct BalancerConfig {
    pub interval: Duration,
    /// Move only when the chunk count gap is larger than this.
    pub threshold: usize,
    pub enabled: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            threshold: 2,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub range: ChunkRange,
    pub from: ShardId,
    pub to: ShardId,
}

pub struct Balancer {
    manager: Arc<ShardingCatalogManager>,
    registry: Arc<ShardRegistry>,
    config: BalancerConfig,
}

impl Balancer {
    pub fn new(manager: Arc<ShardingCatalogManager>, registry: Arc<ShardRegistry>, config: BalancerConfig) -> Self {
        Self {
            manager,
            registry,
            config,
        }
    }

    /// Run `balance_once` every interval until `cancel` fires. No-op when disabled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            return;
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => return,
                }
                if let Err(err) = self.balance_once().await {
                    tracing::warn!(error = ?err, "balancer round failed");
                }
            }
        });
    }

    /// One balancing round over every collection; returns how many chunks moved.
    pub async fn balance_once(&self) -> anyhow::Result<usize> {
        let shards: Vec<ShardId> = self
            .manager
            .catalog()
            .list_shards()
            .await?
            .into_iter()
            .filter(|s| !s.draining)
            .map(|s| s.id)
            .filter(|id| self.registry.get(id).is_ok())
            .collect();
        let mut moved = 0;
        for entry in self.manager.catalog().list_collections().await? {
            if !entry.allow_migrations || entry.resharding.is_some() {
                continue;
            }
            let map = match self.manager.load(&entry.ns).await {
                Ok(map) => map,
                Err(ShardError::NamespaceNotSharded(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let Some(planned) = plan_move(&map, &shards, self.config.threshold) else {
                continue;
            };
            let donor = self.registry.get(&planned.from)?;
            let req = MoveRangeRequest {
                ns: entry.ns.clone(),
                range: planned.range.clone(),
                to: planned.to.clone(),
                epoch: map.epoch(),
            };
            match donor.move_range(req).await {
                Ok(outcome) => {
                    tracing::info!(
                        ns = %entry.ns,
                        range = %planned.range,
                        from = %planned.from,
                        to = %planned.to,
                        version = %outcome.version,
                        "balancer moved chunk"
                    );
                    moved += 1;
                }
                Err(err) => {
                    tracing::warn!(ns = %entry.ns, range = %planned.range, error = %err, "balancer move failed");
                }
            }
        }
        Ok(moved)
    }
}

/// Pick one chunk to move from the most to the least loaded of `shards`.
pub fn plan_move(map: &ChunkMap, shards: &[ShardId], threshold: usize) -> Option<PlannedMove> {
    let owned = map.chunk_counts();
    let counts: BTreeMap<&ShardId, usize> = shards
        .iter()
        .map(|id| (id, owned.get(id).copied().unwrap_or(0)))
        .collect();
    // Ties go to the lowest shard id on both ends.
    let (&from, &most) = counts.iter().rev().max_by_key(|(_, count)| **count)?;
    let (&to, &least) = counts.iter().min_by_key(|(_, count)| **count)?;
    if most.saturating_sub(least) <= threshold {
        return None;
    }
    let chunk = map.chunks().iter().find(|c| &c.shard == from)?;
    Some(PlannedMove {
        range: chunk.range.clone(),
        from: from.clone(),
        to: to.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::key::{ShardKey, ShardKeyPattern};
    use uuid::Uuid;

    fn map_with(owners: &[&str]) -> ChunkMap {
        let mut bounds = vec![ShardKey::min(1)];
        bounds.extend((1..owners.len()).map(|i| ShardKey::int(i as i64 * 10)));
        bounds.push(ShardKey::max(1));
        let assignments = owners
            .iter()
            .enumerate()
            .map(|(i, owner)| {
                (
                    ChunkRange::new(bounds[i].clone(), bounds[i + 1].clone()).expect("range"),
                    ShardId::from(*owner),
                )
            })
            .collect();
        ChunkMap::create(
            "foo.bar",
            Uuid::new_v4(),
            Uuid::new_v4(),
            ShardKeyPattern::new(["x"]).expect("pattern"),
            assignments,
            Timestamp(1),
        )
        .expect("map")
    }

    #[test]
    fn moves_from_most_to_least_loaded() {
        let shards = vec![ShardId::from("shard0"), ShardId::from("shard1"), ShardId::from("shard2")];
        let map = map_with(&["shard0", "shard0", "shard0", "shard0", "shard1"]);
        let planned = plan_move(&map, &shards, 2).expect("a move");
        assert_eq!(planned.from, ShardId::from("shard0"));
        assert_eq!(planned.to, ShardId::from("shard2"));
        assert_eq!(planned.range, map.chunks()[0].range);
    }

    #[test]
    fn balanced_collections_stay_put() {
        let shards = vec![ShardId::from("shard0"), ShardId::from("shard1")];
        let map = map_with(&["shard0", "shard0", "shard0", "shard1"]);
        assert_eq!(plan_move(&map, &shards, 2), None);
        assert_eq!(plan_move(&map, &[], 0), None);
    }
}
