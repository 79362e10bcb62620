//! Versioned key-range-to-shard assignment for one collection.
//!
//! A `ChunkMap` is immutable: every mutation returns a new map, so readers can
//! hold an `Arc<ChunkMap>` snapshot while a newer one is installed. Every map
//! partitions `[MinKey, MaxKey)` exactly; mutations re-check this and a
//! violation panics, since it can only come from a bug in this module.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use uuid::Uuid;

use crate::chunk::{Chunk, ChunkHistoryEntry, ChunkRange};
use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::key::{ShardKey, ShardKeyPattern};
use crate::types::ShardId;
use crate::version::{ChunkVersion, CollectionVersion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMap {
    ns: String,
    uuid: Uuid,
    epoch: Uuid,
    pattern: ShardKeyPattern,
    chunks: Vec<Chunk>,
    collection_version: CollectionVersion,
}

impl ChunkMap {
    /// Build a map from chunks read out of the catalog.
    pub fn new(
        ns: impl Into<String>,
        uuid: Uuid,
        pattern: ShardKeyPattern,
        mut chunks: Vec<Chunk>,
    ) -> ShardResult<Self> {
        let ns = ns.into();
        let Some(first) = chunks.first() else {
            return Err(ShardError::DataInconsistency(format!(
                "collection {ns} has no chunks"
            )));
        };
        let epoch = first.version.epoch;
        if let Some(bad) = chunks.iter().find(|c| c.version.epoch != epoch) {
            return Err(ShardError::DataInconsistency(format!(
                "chunk {} of {ns} has epoch {} but the collection epoch is {epoch}",
                bad.range, bad.version.epoch
            )));
        }
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        check_partition(&pattern, &chunks).map_err(|msg| {
            ShardError::DataInconsistency(format!("chunks of {ns} do not partition the keyspace: {msg}"))
        })?;
        let collection_version = max_version(&chunks);
        Ok(Self {
            ns,
            uuid,
            epoch,
            pattern,
            chunks,
            collection_version,
        })
    }

    /// Initial map for a newly sharded collection; versions run `1|0, 1|1, ...`.
    pub fn create(
        ns: impl Into<String>,
        uuid: Uuid,
        epoch: Uuid,
        pattern: ShardKeyPattern,
        mut assignments: Vec<(ChunkRange, ShardId)>,
        valid_after: Timestamp,
    ) -> ShardResult<Self> {
        assignments.sort_by(|a, b| a.0.min.cmp(&b.0.min));
        let chunks = assignments
            .into_iter()
            .enumerate()
            .map(|(idx, (range, shard))| {
                Chunk::new(
                    range,
                    shard,
                    ChunkVersion::new(epoch, 1, idx as u64),
                    valid_after,
                )
            })
            .collect();
        Self::new(ns, uuid, pattern, chunks)
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    pub fn pattern(&self) -> &ShardKeyPattern {
        &self.pattern
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    pub fn collection_version(&self) -> CollectionVersion {
        self.collection_version
    }

    /// Highest chunk version owned by `shard`.
    pub fn shard_version(&self, shard: &ShardId) -> Option<ChunkVersion> {
        self.chunks
            .iter()
            .filter(|c| &c.shard == shard)
            .map(|c| c.version)
            .max_by_key(|v| (v.major, v.minor))
    }

    pub fn shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|c| c.shard.clone()).collect()
    }

    pub fn chunk_counts(&self) -> BTreeMap<ShardId, usize> {
        let mut counts = BTreeMap::new();
        for chunk in &self.chunks {
            *counts.entry(chunk.shard.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Chunk whose range contains `key`.
    pub fn find_chunk(&self, key: &ShardKey) -> Option<&Chunk> {
        let idx = self.chunks.partition_point(|c| c.range.max <= *key);
        self.chunks.get(idx).filter(|c| c.range.contains(key))
    }

    /// Chunk whose range is exactly `range`.
    pub fn chunk_exact(&self, range: &ChunkRange) -> Option<&Chunk> {
        self.find_chunk(&range.min).filter(|c| c.range == *range)
    }

    /// Chunks overlapping `range`, in key order.
    pub fn chunks_overlapping(&self, range: &ChunkRange) -> &[Chunk] {
        let start = self.chunks.partition_point(|c| c.range.max <= range.min);
        let end = self.chunks.partition_point(|c| c.range.min < range.max);
        &self.chunks[start..end.max(start)]
    }

    /// Owner of `key`, either now or as of `read_at` using chunk history.
    pub fn owner_of(&self, key: &ShardKey, read_at: Option<Timestamp>) -> ShardResult<ShardId> {
        if key.width() != self.pattern.width() {
            return Err(ShardError::InvalidOptions(format!(
                "key {key} does not match shard key {}",
                self.pattern
            )));
        }
        let chunk = self.find_chunk(key).ok_or_else(|| {
            ShardError::InvalidOptions(format!("key {key} lies outside the keyspace of {}", self.ns))
        })?;
        match read_at {
            None => Ok(chunk.shard.clone()),
            Some(ts) => chunk.owner_at(ts).cloned().ok_or_else(|| ShardError::StaleChunkHistory {
                ns: self.ns.clone(),
                read_at: ts,
            }),
        }
    }

    pub fn is_owned_by(
        &self,
        key: &ShardKey,
        shard: &ShardId,
        read_at: Option<Timestamp>,
    ) -> ShardResult<bool> {
        Ok(self.owner_of(key, read_at)? == *shard)
    }

    /// Move `range` from `from` to `to`, bumping the major version.
    ///
    /// `range` must match an existing chunk exactly. Replaying a commit whose
    /// chunk already sits on `to` returns the map unchanged.
    pub fn apply_migration_commit(
        &self,
        range: &ChunkRange,
        from: &ShardId,
        to: &ShardId,
        valid_after: Timestamp,
    ) -> ShardResult<ChunkMap> {
        let idx = self
            .chunks
            .iter()
            .position(|c| c.range == *range)
            .ok_or_else(|| self.stale_boundaries(range))?;
        let chunk = &self.chunks[idx];
        if chunk.shard == *to && from != to {
            return Ok(self.clone());
        }
        if chunk.shard != *from {
            return Err(ShardError::stale(
                self.ns.clone(),
                None,
                Some(self.collection_version),
            ));
        }
        if let Some(latest) = chunk.history.first() {
            if latest.valid_after >= valid_after {
                return Err(ShardError::DataInconsistency(format!(
                    "chunk {} of {} has history at {} not older than commit time {valid_after}",
                    range, self.ns, latest.valid_after
                )));
            }
        }

        let mut chunks = self.chunks.clone();
        let moved = &mut chunks[idx];
        moved.shard = to.clone();
        moved.version = self.collection_version.inc_major();
        moved.history.insert(
            0,
            ChunkHistoryEntry {
                valid_after,
                shard: to.clone(),
            },
        );
        Ok(self.rebuilt(chunks))
    }

    /// Split the chunk `range` at `split_points`, bumping minor versions.
    pub fn apply_split(&self, range: &ChunkRange, split_points: &[ShardKey]) -> ShardResult<ChunkMap> {
        if split_points.is_empty() {
            return Err(ShardError::InvalidOptions("no split points given".to_string()));
        }
        let mut bounds = Vec::with_capacity(split_points.len() + 2);
        bounds.push(range.min.clone());
        for point in split_points {
            if point.width() != self.pattern.width() {
                return Err(ShardError::InvalidOptions(format!(
                    "split key {point} does not match shard key {}",
                    self.pattern
                )));
            }
            if *point == range.min {
                return Err(ShardError::InvalidOptions(format!(
                    "cannot split {range} on its lower bound {point}"
                )));
            }
            if !range.contains(point) {
                return Err(ShardError::InvalidOptions(format!(
                    "split key {point} is not contained in {range}"
                )));
            }
            if bounds.last().is_some_and(|prev| prev >= point) {
                return Err(ShardError::InvalidOptions(format!(
                    "split keys must be strictly increasing, found {point} after {}",
                    bounds.last().map(|k| k.to_string()).unwrap_or_default()
                )));
            }
            bounds.push(point.clone());
        }
        bounds.push(range.max.clone());

        let Some(idx) = self.chunks.iter().position(|c| c.range == *range) else {
            if self.split_already_applied(&bounds) {
                return Ok(self.clone());
            }
            return Err(self.stale_boundaries(range));
        };

        let parent = &self.chunks[idx];
        let mut version = self.collection_version;
        let children: Vec<Chunk> = bounds
            .windows(2)
            .map(|pair| {
                version = version.inc_minor();
                Chunk {
                    range: ChunkRange {
                        min: pair[0].clone(),
                        max: pair[1].clone(),
                    },
                    shard: parent.shard.clone(),
                    version,
                    history: parent.history.clone(),
                }
            })
            .collect();

        let mut chunks = self.chunks.clone();
        chunks.splice(idx..=idx, children);
        Ok(self.rebuilt(chunks))
    }

    fn split_already_applied(&self, bounds: &[ShardKey]) -> bool {
        let mut shard: Option<&ShardId> = None;
        for pair in bounds.windows(2) {
            let expected = ChunkRange {
                min: pair[0].clone(),
                max: pair[1].clone(),
            };
            let Some(chunk) = self.chunk_exact(&expected) else {
                return false;
            };
            match shard {
                Some(s) if s != &chunk.shard => return false,
                _ => shard = Some(&chunk.shard),
            }
        }
        true
    }

    /// Merge the contiguous chunks exactly filling `range` into one chunk.
    pub fn apply_merge(&self, range: &ChunkRange) -> ShardResult<ChunkMap> {
        let overlapping = self.chunks_overlapping(range);
        let (Some(first), Some(last)) = (overlapping.first(), overlapping.last()) else {
            return Err(self.stale_boundaries(range));
        };
        if first.range.min != range.min || last.range.max != range.max {
            return Err(ShardError::IllegalOperation(format!(
                "merge range {range} does not align with chunk boundaries of {}",
                self.ns
            )));
        }
        if overlapping.len() == 1 {
            return Ok(self.clone());
        }
        if let Some(other) = overlapping.iter().find(|c| c.shard != first.shard) {
            return Err(ShardError::IllegalOperation(format!(
                "cannot merge {range}: chunk {} is on {} while {} is on {}",
                other.range, other.shard, first.range, first.shard
            )));
        }

        let valid_after = overlapping
            .iter()
            .map(Chunk::latest_valid_after)
            .max()
            .unwrap_or(Timestamp::ZERO);
        let merged = Chunk {
            range: range.clone(),
            shard: first.shard.clone(),
            version: self.collection_version.inc_minor(),
            history: vec![ChunkHistoryEntry {
                valid_after,
                shard: first.shard.clone(),
            }],
        };

        let start = self.chunks.iter().position(|c| c.range == first.range).unwrap_or(0);
        let mut chunks = self.chunks.clone();
        chunks.splice(start..start + overlapping.len(), [merged]);
        Ok(self.rebuilt(chunks))
    }

    /// Drop history entries that only serve reads older than `now - window`.
    /// The newest entry of each chunk is always kept.
    pub fn trim_history(&self, now: Timestamp, window: Duration) -> ChunkMap {
        let cutoff = now.saturating_sub(window);
        let mut out = self.clone();
        for chunk in &mut out.chunks {
            let keep = chunk
                .history
                .iter()
                .enumerate()
                .take_while(|(idx, _)| *idx == 0 || chunk.history[idx - 1].valid_after > cutoff)
                .count();
            chunk.history.truncate(keep.max(1));
        }
        out
    }

    /// Extend every boundary to `new_pattern` under a new epoch.
    pub fn refine(&self, new_pattern: ShardKeyPattern, new_epoch: Uuid) -> ShardResult<ChunkMap> {
        if !self.pattern.is_prefix_of(&new_pattern) || new_pattern == self.pattern {
            return Err(ShardError::InvalidOptions(format!(
                "refined shard key {new_pattern} must extend {}",
                self.pattern
            )));
        }
        let width = new_pattern.width();
        let chunks = self
            .chunks
            .iter()
            .map(|c| Chunk {
                range: ChunkRange {
                    min: c.range.min.extend_to(width),
                    max: c.range.max.extend_to(width),
                },
                shard: c.shard.clone(),
                version: ChunkVersion::new(new_epoch, c.version.major, c.version.minor),
                history: c.history.clone(),
            })
            .collect();
        ChunkMap::new(self.ns.clone(), self.uuid, new_pattern, chunks)
    }

    /// Re-validate the partition invariant.
    pub fn validate(&self) -> Result<(), String> {
        check_partition(&self.pattern, &self.chunks)
    }

    fn rebuilt(&self, mut chunks: Vec<Chunk>) -> ChunkMap {
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        if let Err(msg) = check_partition(&self.pattern, &chunks) {
            panic!("chunk map of {} lost its partition invariant: {msg}", self.ns);
        }
        let collection_version = max_version(&chunks);
        ChunkMap {
            ns: self.ns.clone(),
            uuid: self.uuid,
            epoch: self.epoch,
            pattern: self.pattern.clone(),
            chunks,
            collection_version,
        }
    }

    fn stale_boundaries(&self, range: &ChunkRange) -> ShardError {
        tracing::debug!(ns = %self.ns, range = %range, "range does not match current chunk boundaries");
        ShardError::stale(self.ns.clone(), None, Some(self.collection_version))
    }
}

fn max_version(chunks: &[Chunk]) -> ChunkVersion {
    chunks
        .iter()
        .map(|c| c.version)
        .max_by_key(|v| (v.major, v.minor))
        .unwrap_or_else(|| ChunkVersion::new(Uuid::nil(), 0, 0))
}

fn check_partition(pattern: &ShardKeyPattern, chunks: &[Chunk]) -> Result<(), String> {
    let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
        return Err("no chunks".to_string());
    };
    if first.range.min != pattern.global_min() {
        return Err(format!("first chunk starts at {} instead of MinKey", first.range.min));
    }
    if last.range.max != pattern.global_max() {
        return Err(format!("last chunk ends at {} instead of MaxKey", last.range.max));
    }
    for chunk in chunks {
        if chunk.range.min.width() != pattern.width() || chunk.range.max.width() != pattern.width() {
            return Err(format!("chunk {} does not match key width {}", chunk.range, pattern.width()));
        }
        if chunk.range.min >= chunk.range.max {
            return Err(format!("chunk {} is empty", chunk.range));
        }
    }
    for pair in chunks.windows(2) {
        if pair[0].range.max < pair[1].range.min {
            return Err(format!("gap between {} and {}", pair[0].range, pair[1].range));
        }
        if pair[0].range.max > pair[1].range.min {
            return Err(format!("overlap between {} and {}", pair[0].range, pair[1].range));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str) -> ShardId {
        ShardId::from(id)
    }

    fn range(min: ShardKey, max: ShardKey) -> ChunkRange {
        ChunkRange::new(min, max).expect("range")
    }

    /// `foo.bar` on `{x: 1}` with `[MinKey, 0) -> shard0`, `[0, MaxKey) -> shard1`.
    fn two_chunk_map() -> ChunkMap {
        let pattern = ShardKeyPattern::new(["x"]).expect("pattern");
        ChunkMap::create(
            "foo.bar",
            Uuid::new_v4(),
            Uuid::new_v4(),
            pattern,
            vec![
                (range(ShardKey::min(1), ShardKey::int(0)), shard("shard0")),
                (range(ShardKey::int(0), ShardKey::max(1)), shard("shard1")),
            ],
            Timestamp(100),
        )
        .expect("map")
    }

    #[test]
    fn create_rejects_gaps_and_overlaps() {
        let pattern = ShardKeyPattern::new(["x"]).expect("pattern");
        let gap = ChunkMap::create(
            "a.b",
            Uuid::new_v4(),
            Uuid::new_v4(),
            pattern.clone(),
            vec![
                (range(ShardKey::min(1), ShardKey::int(0)), shard("s0")),
                (range(ShardKey::int(1), ShardKey::max(1)), shard("s1")),
            ],
            Timestamp(1),
        );
        assert!(matches!(gap, Err(ShardError::DataInconsistency(_))));

        let overlap = ChunkMap::create(
            "a.b",
            Uuid::new_v4(),
            Uuid::new_v4(),
            pattern,
            vec![
                (range(ShardKey::min(1), ShardKey::int(5)), shard("s0")),
                (range(ShardKey::int(1), ShardKey::max(1)), shard("s1")),
            ],
            Timestamp(1),
        );
        assert!(matches!(overlap, Err(ShardError::DataInconsistency(_))));
    }

    #[test]
    fn owner_of_binary_searches_ranges() {
        let map = two_chunk_map();
        assert_eq!(map.owner_of(&ShardKey::int(-5), None).expect("owner"), shard("shard0"));
        assert_eq!(map.owner_of(&ShardKey::int(0), None).expect("owner"), shard("shard1"));
        assert_eq!(map.owner_of(&ShardKey::int(5), None).expect("owner"), shard("shard1"));
        assert!(map.owner_of(&ShardKey::max(1), None).is_err());
    }

    #[test]
    fn migration_commit_moves_ownership_and_bumps_major() {
        let map = two_chunk_map();
        let before = map.collection_version();
        let moved = map
            .apply_migration_commit(
                &range(ShardKey::int(0), ShardKey::max(1)),
                &shard("shard1"),
                &shard("shard0"),
                Timestamp(200),
            )
            .expect("commit");
        assert_eq!(moved.owner_of(&ShardKey::int(5), None).expect("owner"), shard("shard0"));
        let after = moved.collection_version();
        assert_eq!(after, before.inc_major());
        assert!(after > before);
        moved.validate().expect("partition");

        // Snapshot reads before the commit still resolve to the donor.
        assert_eq!(
            moved.owner_of(&ShardKey::int(5), Some(Timestamp(150))).expect("owner"),
            shard("shard1")
        );
        assert_eq!(
            moved.owner_of(&ShardKey::int(5), Some(Timestamp(250))).expect("owner"),
            shard("shard0")
        );
        assert!(matches!(
            moved.owner_of(&ShardKey::int(5), Some(Timestamp(50))),
            Err(ShardError::StaleChunkHistory { .. })
        ));
    }

    #[test]
    fn replayed_migration_commit_is_identical() {
        let map = two_chunk_map();
        let r = range(ShardKey::int(0), ShardKey::max(1));
        let once = map
            .apply_migration_commit(&r, &shard("shard1"), &shard("shard0"), Timestamp(200))
            .expect("commit");
        let twice = once
            .apply_migration_commit(&r, &shard("shard1"), &shard("shard0"), Timestamp(200))
            .expect("replay");
        assert_eq!(once, twice);
    }

    #[test]
    fn migration_commit_requires_exact_chunk() {
        let map = two_chunk_map();
        let err = map
            .apply_migration_commit(
                &range(ShardKey::int(0), ShardKey::int(10)),
                &shard("shard1"),
                &shard("shard0"),
                Timestamp(200),
            )
            .expect_err("partial chunk");
        assert!(err.is_stale_config());
    }

    #[test]
    fn migration_commit_rejects_non_monotonic_history() {
        let map = two_chunk_map();
        let err = map
            .apply_migration_commit(
                &range(ShardKey::int(0), ShardKey::max(1)),
                &shard("shard1"),
                &shard("shard0"),
                Timestamp(100),
            )
            .expect_err("history");
        assert!(matches!(err, ShardError::DataInconsistency(_)));
    }

    #[test]
    fn split_validates_points_and_bumps_minor() {
        let map = two_chunk_map();
        let upper = range(ShardKey::int(0), ShardKey::max(1));
        let before = map.collection_version();
        let split = map
            .apply_split(&upper, &[ShardKey::int(10), ShardKey::int(20)])
            .expect("split");
        assert_eq!(split.chunks().len(), 4);
        assert_eq!(split.collection_version().major, before.major);
        assert_eq!(split.collection_version().minor, before.minor + 2);
        split.validate().expect("partition");

        // Replay of an applied split is a no-op.
        let replay = split
            .apply_split(&upper, &[ShardKey::int(10), ShardKey::int(20)])
            .expect("replay");
        assert_eq!(replay, split);

        for bad in [
            vec![ShardKey::int(0)],
            vec![ShardKey::int(-1)],
            vec![ShardKey::int(20), ShardKey::int(10)],
            vec![ShardKey::int(10), ShardKey::int(10)],
        ] {
            let err = map.apply_split(&upper, &bad).expect_err("bad split");
            assert!(matches!(err, ShardError::InvalidOptions(_)), "{bad:?}: {err}");
        }
    }

    #[test]
    fn merge_requires_contiguous_same_shard_chunks() {
        let map = two_chunk_map();
        let upper = range(ShardKey::int(0), ShardKey::max(1));
        let split = map
            .apply_split(&upper, &[ShardKey::int(10), ShardKey::int(20)])
            .expect("split");
        let merged = split
            .apply_merge(&range(ShardKey::int(0), ShardKey::int(20)))
            .expect("merge");
        assert_eq!(merged.chunks().len(), 3);
        assert!(merged.collection_version() > split.collection_version());
        merged.validate().expect("partition");

        let again = merged
            .apply_merge(&range(ShardKey::int(0), ShardKey::int(20)))
            .expect("already merged");
        assert_eq!(again, merged);

        let across = split
            .apply_merge(&range(ShardKey::min(1), ShardKey::int(10)))
            .expect_err("different shards");
        assert!(matches!(across, ShardError::IllegalOperation(_)));

        let misaligned = split
            .apply_merge(&range(ShardKey::int(5), ShardKey::int(20)))
            .expect_err("misaligned");
        assert!(matches!(misaligned, ShardError::IllegalOperation(_)));
    }

    #[test]
    fn versions_increase_across_a_sequence_of_operations() {
        let mut map = two_chunk_map();
        let mut seen = vec![map.collection_version()];
        let mut ts = 200;
        for step in 0..20i64 {
            let upper = map
                .find_chunk(&ShardKey::int(1_000))
                .map(|c| c.range.clone())
                .expect("chunk");
            map = map
                .apply_split(&upper, &[ShardKey::int(100 + step * 10)])
                .expect("split");
            seen.push(map.collection_version());
            let target = map
                .find_chunk(&ShardKey::int(100 + step * 10))
                .cloned()
                .expect("chunk");
            let to = if target.shard == shard("shard0") { "shard1" } else { "shard0" };
            ts += 10;
            map = map
                .apply_migration_commit(&target.range, &target.shard, &shard(to), Timestamp(ts))
                .expect("move");
            seen.push(map.collection_version());
            map.validate().expect("partition");
        }
        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn trim_history_keeps_newest_entry() {
        let map = two_chunk_map();
        let r = range(ShardKey::int(0), ShardKey::max(1));
        let t1 = Timestamp::from_millis(1_000);
        let t2 = Timestamp::from_millis(20_000);
        let moved = map
            .apply_migration_commit(&r, &shard("shard1"), &shard("shard0"), t1)
            .expect("move");
        let back = moved
            .apply_migration_commit(&r, &shard("shard0"), &shard("shard1"), t2)
            .expect("move back");
        assert_eq!(back.chunk_exact(&r).expect("chunk").history.len(), 3);

        let trimmed = back.trim_history(Timestamp::from_millis(30_000), Duration::from_secs(5));
        let history = &trimmed.chunk_exact(&r).expect("chunk").history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].shard, shard("shard1"));

        let wide = back.trim_history(Timestamp::from_millis(30_000), Duration::from_secs(15));
        assert_eq!(wide.chunk_exact(&r).expect("chunk").history.len(), 2);
    }

    #[test]
    fn refine_extends_boundaries_under_new_epoch() {
        let map = two_chunk_map();
        let new_epoch = Uuid::new_v4();
        let refined = map
            .refine(ShardKeyPattern::new(["x", "y"]).expect("pattern"), new_epoch)
            .expect("refine");
        assert_eq!(refined.epoch(), new_epoch);
        assert_eq!(refined.chunks().len(), 2);
        assert_eq!(
            refined.chunks()[1].range.min,
            ShardKey::int(0).extend_to(2)
        );
        refined.validate().expect("partition");
        assert!(map
            .refine(ShardKeyPattern::new(["y"]).expect("pattern"), new_epoch)
            .is_err());
    }
}
