//! Ownership filtering for documents physically present on a shard.
//!
//! Documents left behind by a committed migration (or cloned by an aborted
//! one) stay in storage until the range deleter removes them. Reads must not
//! return them and user writes must not land in ranges the shard does not own.

use crate::chunk::ChunkRange;
use crate::chunk_map::ChunkMap;
use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::key::{Document, ShardKey};
use crate::types::ShardId;

pub struct OrphanFilter<'a> {
    map: &'a ChunkMap,
    shard: &'a ShardId,
    read_at: Option<Timestamp>,
}

impl<'a> OrphanFilter<'a> {
    /// Filter as of `read_at` (latest ownership when `None`).
    pub fn new(map: &'a ChunkMap, shard: &'a ShardId, read_at: Option<Timestamp>) -> Self {
        Self { map, shard, read_at }
    }

    pub fn is_owned(&self, doc: &Document) -> ShardResult<bool> {
        let key = self.map.pattern().extract(doc)?;
        self.owns_key(&key)
    }

    pub fn owns_key(&self, key: &ShardKey) -> ShardResult<bool> {
        self.map.is_owned_by(key, self.shard, self.read_at)
    }
}

/// Decide whether a user write to `key` may be applied on `shard`.
///
/// Keys in a range the shard is still receiving are refused with a retryable
/// conflict: they become owned only once the incoming migration commits.
pub fn admit_write(
    map: &ChunkMap,
    shard: &ShardId,
    key: &ShardKey,
    receiving: &[ChunkRange],
) -> ShardResult<()> {
    if receiving.iter().any(|r| r.contains(key)) {
        return Err(ShardError::conflict(
            map.ns(),
            format!("{key} belongs to a range still being received"),
        ));
    }
    if map.owner_of(key, None)? != *shard {
        return Err(ShardError::stale(
            map.ns(),
            None,
            Some(map.collection_version()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyPattern;
    use serde_json::json;
    use uuid::Uuid;

    fn two_chunk_map() -> ChunkMap {
        let pattern = ShardKeyPattern::new(["x"]).expect("pattern");
        let split = ShardKey::int(0);
        ChunkMap::create(
            "foo.bar",
            Uuid::new_v4(),
            Uuid::new_v4(),
            pattern,
            vec![
                (ChunkRange::new(ShardKey::min(1), split.clone()).expect("range"), ShardId::from("shard0")),
                (ChunkRange::new(split, ShardKey::max(1)).expect("range"), ShardId::from("shard1")),
            ],
            Timestamp(1 << 16),
        )
        .expect("map")
    }

    fn doc(x: i64) -> Document {
        json!({"_id": x, "x": x}).as_object().cloned().expect("object")
    }

    #[test]
    fn orphans_are_filtered_out() {
        let map = two_chunk_map();
        let shard0 = ShardId::from("shard0");
        let filter = OrphanFilter::new(&map, &shard0, None);
        assert!(filter.is_owned(&doc(-5)).expect("owned"));
        assert!(!filter.is_owned(&doc(5)).expect("orphan"));
        assert!(!filter.owns_key(&ShardKey::int(0)).expect("boundary belongs to shard1"));
    }

    #[test]
    fn write_admission_rejects_unowned_and_receiving_keys() {
        let map = two_chunk_map();
        let shard0 = ShardId::from("shard0");
        admit_write(&map, &shard0, &ShardKey::int(-3), &[]).expect("owned");

        let err = admit_write(&map, &shard0, &ShardKey::int(3), &[]).expect_err("not owned");
        assert!(err.is_stale_config());

        let receiving = vec![ChunkRange::new(ShardKey::int(0), ShardKey::max(1)).expect("range")];
        let err = admit_write(&map, &shard0, &ShardKey::int(3), &receiving).expect_err("receiving");
        assert!(matches!(err, ShardError::MigrationConflict { .. }));
    }
}
