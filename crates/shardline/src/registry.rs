//! Shard id to live shard handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ShardError, ShardResult};
use crate::shard::Shard;
use crate::types::ShardId;

#[derive(Default)]
pub struct ShardRegistry {
    shards: RwLock<BTreeMap<ShardId, Arc<Shard>>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, shard: Arc<Shard>) {
        self.shards.write().insert(shard.id().clone(), shard);
    }

    /// Handle of a shard that is currently up.
    pub fn get(&self, id: &ShardId) -> ShardResult<Arc<Shard>> {
        let shard = self.get_any(id)?;
        if !shard.is_up() {
            return Err(ShardError::ShardUnavailable(id.clone()));
        }
        Ok(shard)
    }

    /// Handle regardless of whether the shard is up.
    pub fn get_any(&self, id: &ShardId) -> ShardResult<Arc<Shard>> {
        self.shards
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<ShardId> {
        self.shards.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<Shard>> {
        self.shards.read().values().cloned().collect()
    }
}
