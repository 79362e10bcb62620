//! Per-shard document storage.
//!
//! Engines keep multiple timestamped versions of each document (keyed by the
//! order-preserving encoding of `_id`) so snapshot reads at a past timestamp
//! see a consistent state. Deletes write tombstones; `purge` removes every
//! version physically and is reserved for orphan cleanup.

mod fjall_engine;
mod memory;

use std::sync::Arc;

pub use self::fjall_engine::FjallStorage;
pub use self::memory::MemoryStorage;

use crate::chunk::ChunkRange;
use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::key::{document_id, Document, KeyValue, ShardKeyPattern};

pub trait StorageEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Latest timestamp handed out by the engine's clock.
    fn current_timestamp(&self) -> Timestamp;

    /// Insert or replace a document by `_id` as of `ts`.
    fn apply_idempotent(&self, ns: &str, doc: &Document, ts: Timestamp) -> ShardResult<()>;

    /// Write a tombstone for `id`; returns whether a live document existed.
    fn delete(&self, ns: &str, id: &KeyValue, ts: Timestamp) -> ShardResult<bool>;

    /// Visible version of `id` as of `at` (latest when `None`).
    fn get(&self, ns: &str, id: &KeyValue, at: Option<Timestamp>) -> ShardResult<Option<Document>>;

    /// Up to `limit` live documents after the encoded id `after`, in id order.
    fn scan(
        &self,
        ns: &str,
        at: Option<Timestamp>,
        after: Option<&[u8]>,
        limit: usize,
    ) -> ShardResult<Vec<(Vec<u8>, Document)>>;

    /// Remove every version of `id`.
    fn purge(&self, ns: &str, id: &KeyValue) -> ShardResult<bool>;

    fn drop_collection(&self, ns: &str) -> ShardResult<()>;

    /// Move all documents of `from` to `to`, replacing whatever `to` held.
    fn rename_collection(&self, from: &str, to: &str) -> ShardResult<()>;

    /// Discard versions no reader at or after `before` can see.
    fn prune_versions(&self, before: Timestamp) -> ShardResult<usize>;
}

/// Cursor over the documents of one shard-key range as of a timestamp.
pub struct SnapshotCursor {
    engine: Arc<dyn StorageEngine>,
    ns: String,
    pattern: ShardKeyPattern,
    range: ChunkRange,
    at: Option<Timestamp>,
    batch_size: usize,
    after: Option<Vec<u8>>,
    exhausted: bool,
}

/// Open a cursor over `range` of `ns` as of `at`.
pub fn snapshot_cursor(
    engine: Arc<dyn StorageEngine>,
    ns: impl Into<String>,
    pattern: ShardKeyPattern,
    range: ChunkRange,
    at: Option<Timestamp>,
    batch_size: usize,
) -> SnapshotCursor {
    SnapshotCursor {
        engine,
        ns: ns.into(),
        pattern,
        range,
        at,
        batch_size: batch_size.max(1),
        after: None,
        exhausted: false,
    }
}

impl SnapshotCursor {
    /// Next batch of in-range documents, or `None` once the cursor is drained.
    pub fn next_batch(&mut self) -> ShardResult<Option<Vec<Document>>> {
        let mut out = Vec::new();
        while !self.exhausted && out.len() < self.batch_size {
            let page = self.engine.scan(
                &self.ns,
                self.at,
                self.after.as_deref(),
                self.batch_size,
            )?;
            if page.len() < self.batch_size {
                self.exhausted = true;
            }
            for (id_key, doc) in page {
                self.after = Some(id_key);
                if self.range.contains(&self.pattern.extract(&doc)?) {
                    out.push(doc);
                }
            }
        }
        if out.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(out))
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.at
    }
}

/// Physically delete up to `limit` documents of `ns` whose shard key falls in `range`.
pub fn delete_range(
    engine: &dyn StorageEngine,
    ns: &str,
    pattern: &ShardKeyPattern,
    range: &ChunkRange,
    limit: usize,
) -> ShardResult<usize> {
    let mut deleted = 0;
    let mut after: Option<Vec<u8>> = None;
    loop {
        let page = engine.scan(ns, None, after.as_deref(), 256)?;
        let last_page = page.len() < 256;
        for (id_key, doc) in page {
            after = Some(id_key);
            if deleted >= limit {
                return Ok(deleted);
            }
            if range.contains(&pattern.extract(&doc)?) && engine.purge(ns, &document_id(&doc)?)? {
                deleted += 1;
            }
        }
        if last_page {
            return Ok(deleted);
        }
    }
}

pub(crate) fn storage_err(context: &str, err: impl std::fmt::Display) -> ShardError {
    ShardError::Storage(format!("{context}: {err}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ClusterClock;
    use crate::key::ShardKey;
    use serde_json::json;

    pub(crate) fn doc(id: i64, x: i64) -> Document {
        json!({"_id": id, "x": x}).as_object().cloned().expect("object")
    }

    /// Behaviour every engine must share.
    pub(crate) fn exercise_engine(engine: Arc<dyn StorageEngine>, clock: &ClusterClock) {
        let ns = "db.coll";
        let t1 = clock.tick();
        for i in 0..10 {
            engine.apply_idempotent(ns, &doc(i, i * 10), t1).expect("insert");
        }
        let t2 = clock.tick();
        engine.apply_idempotent(ns, &doc(3, 999), t2).expect("update");
        assert!(engine.delete(ns, &KeyValue::Int(4), t2).expect("delete"));
        assert!(!engine.delete(ns, &KeyValue::Int(42), t2).expect("delete missing"));

        // Latest view reflects both writes, the snapshot at t1 neither.
        let latest = engine.get(ns, &KeyValue::Int(3), None).expect("get").expect("doc");
        assert_eq!(latest.get("x"), Some(&json!(999)));
        assert!(engine.get(ns, &KeyValue::Int(4), None).expect("get").is_none());
        let old = engine.get(ns, &KeyValue::Int(3), Some(t1)).expect("get").expect("doc");
        assert_eq!(old.get("x"), Some(&json!(30)));
        assert!(engine.get(ns, &KeyValue::Int(4), Some(t1)).expect("get").is_some());

        // Paging walks ids in order.
        let first = engine.scan(ns, None, None, 4).expect("scan");
        assert_eq!(first.len(), 4);
        let rest = engine
            .scan(ns, None, Some(first[3].0.as_slice()), 100)
            .expect("scan rest");
        assert_eq!(first.len() + rest.len(), 9);

        // Range cursor at t1 sees the pre-delete state.
        let pattern = ShardKeyPattern::new(["x"]).expect("pattern");
        let range = ChunkRange::new(ShardKey::int(20), ShardKey::int(60)).expect("range");
        let mut cursor = snapshot_cursor(engine.clone(), ns, pattern.clone(), range.clone(), Some(t1), 2);
        let mut seen = Vec::new();
        while let Some(batch) = cursor.next_batch().expect("batch") {
            seen.extend(batch);
        }
        assert_eq!(seen.len(), 4);

        let removed = delete_range(engine.as_ref(), ns, &pattern, &range, 100).expect("delete range");
        assert_eq!(removed, 2, "x=20 and x=50 remain live in range");

        // Pruning up to t3 drops the history older snapshots relied on.
        let t3 = clock.tick();
        assert!(engine.prune_versions(t3).expect("prune") > 0);
        assert!(engine.get(ns, &KeyValue::Int(3), Some(t1)).expect("get").is_none());
        let kept = engine.get(ns, &KeyValue::Int(3), None).expect("get").expect("doc");
        assert_eq!(kept.get("x"), Some(&json!(999)));

        engine.rename_collection(ns, "db.other").expect("rename");
        assert!(engine.scan(ns, None, None, 100).expect("scan").is_empty());
        assert_eq!(engine.scan("db.other", None, None, 100).expect("scan").len(), 7);
        engine.drop_collection("db.other").expect("drop");
        assert!(engine.scan("db.other", None, None, 100).expect("scan").is_empty());
    }
}
