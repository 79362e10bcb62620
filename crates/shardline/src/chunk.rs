//! Chunks: contiguous key ranges owned by one shard.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::key::ShardKey;
use crate::types::ShardId;
use crate::version::ChunkVersion;

/// Half-open interval `[min, max)` over a shard keyspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: ShardKey,
    pub max: ShardKey,
}

impl ChunkRange {
    pub fn new(min: ShardKey, max: ShardKey) -> ShardResult<Self> {
        if min.width() != max.width() {
            return Err(ShardError::InvalidOptions(format!(
                "range bounds {min} and {max} have different widths"
            )));
        }
        if min >= max {
            return Err(ShardError::InvalidOptions(format!(
                "range min {min} must be below max {max}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Whole keyspace for a key of `width` fields.
    pub fn full(width: usize) -> Self {
        Self {
            min: ShardKey::min(width),
            max: ShardKey::max(width),
        }
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        *key >= self.min && *key < self.max
    }

    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// True when `other` lies entirely inside this range.
    pub fn covers(&self, other: &ChunkRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Ownership record: `shard` owns the chunk for reads at or after `valid_after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHistoryEntry {
    pub valid_after: Timestamp,
    pub shard: ShardId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub range: ChunkRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
    /// Newest entry first.
    #[serde(default)]
    pub history: Vec<ChunkHistoryEntry>,
}

impl Chunk {
    pub fn new(range: ChunkRange, shard: ShardId, version: ChunkVersion, valid_after: Timestamp) -> Self {
        let history = vec![ChunkHistoryEntry {
            valid_after,
            shard: shard.clone(),
        }];
        Self {
            range,
            shard,
            version,
            history,
        }
    }

    /// Owner for a read at `ts`, or `None` when history does not reach back that far.
    pub fn owner_at(&self, ts: Timestamp) -> Option<&ShardId> {
        self.history
            .iter()
            .find(|entry| entry.valid_after <= ts)
            .map(|entry| &entry.shard)
    }

    /// Most recent ownership change.
    pub fn latest_valid_after(&self) -> Timestamp {
        self.history
            .first()
            .map(|entry| entry.valid_after)
            .unwrap_or(Timestamp::ZERO)
    }
}
