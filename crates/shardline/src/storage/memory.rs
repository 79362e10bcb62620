use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use super::StorageEngine;
use crate::clock::{ClusterClock, Timestamp};
use crate::error::ShardResult;
use crate::key::{document_id, Document, KeyValue};

#[derive(Debug, Clone)]
struct VersionedDoc {
    ts: Timestamp,
    /// `None` is a tombstone.
    doc: Option<Document>,
}

type Collection = BTreeMap<Vec<u8>, Vec<VersionedDoc>>;

/// Multi-version in-memory engine.
pub struct MemoryStorage {
    clock: Arc<ClusterClock>,
    collections: RwLock<BTreeMap<String, Collection>>,
}

impl MemoryStorage {
    pub fn new(clock: Arc<ClusterClock>) -> Self {
        Self {
            clock,
            collections: RwLock::new(BTreeMap::new()),
        }
    }
}

fn visible(versions: &[VersionedDoc], at: Option<Timestamp>) -> Option<&VersionedDoc> {
    match at {
        None => versions.last(),
        Some(ts) => versions.iter().rev().find(|v| v.ts <= ts),
    }
}

fn put_version(versions: &mut Vec<VersionedDoc>, ts: Timestamp, doc: Option<Document>) {
    match versions.binary_search_by(|v| v.ts.cmp(&ts)) {
        Ok(idx) => versions[idx].doc = doc,
        Err(idx) => versions.insert(idx, VersionedDoc { ts, doc }),
    }
}

impl StorageEngine for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn current_timestamp(&self) -> Timestamp {
        self.clock.now()
    }

    fn apply_idempotent(&self, ns: &str, doc: &Document, ts: Timestamp) -> ShardResult<()> {
        let id = document_id(doc)?.encode();
        let mut collections = self.collections.write();
        let versions = collections.entry(ns.to_string()).or_default().entry(id).or_default();
        put_version(versions, ts, Some(doc.clone()));
        Ok(())
    }

    fn delete(&self, ns: &str, id: &KeyValue, ts: Timestamp) -> ShardResult<bool> {
        let mut collections = self.collections.write();
        let Some(versions) = collections.get_mut(ns).and_then(|c| c.get_mut(&id.encode())) else {
            return Ok(false);
        };
        let existed = versions.last().is_some_and(|v| v.doc.is_some());
        if existed {
            put_version(versions, ts, None);
        }
        Ok(existed)
    }

    fn get(&self, ns: &str, id: &KeyValue, at: Option<Timestamp>) -> ShardResult<Option<Document>> {
        let collections = self.collections.read();
        Ok(collections
            .get(ns)
            .and_then(|c| c.get(&id.encode()))
            .and_then(|versions| visible(versions, at))
            .and_then(|v| v.doc.clone()))
    }

    fn scan(
        &self,
        ns: &str,
        at: Option<Timestamp>,
        after: Option<&[u8]>,
        limit: usize,
    ) -> ShardResult<Vec<(Vec<u8>, Document)>> {
        let collections = self.collections.read();
        let Some(collection) = collections.get(ns) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_vec()),
            None => Bound::Unbounded,
        };
        Ok(collection
            .range((lower, Bound::Unbounded))
            .filter_map(|(key, versions)| {
                visible(versions, at)
                    .and_then(|v| v.doc.clone())
                    .map(|doc| (key.clone(), doc))
            })
            .take(limit)
            .collect())
    }

    fn purge(&self, ns: &str, id: &KeyValue) -> ShardResult<bool> {
        let mut collections = self.collections.write();
        Ok(collections
            .get_mut(ns)
            .and_then(|c| c.remove(&id.encode()))
            .is_some())
    }

    fn drop_collection(&self, ns: &str) -> ShardResult<()> {
        self.collections.write().remove(ns);
        Ok(())
    }

    fn rename_collection(&self, from: &str, to: &str) -> ShardResult<()> {
        let mut collections = self.collections.write();
        let moved = collections.remove(from).unwrap_or_default();
        collections.insert(to.to_string(), moved);
        Ok(())
    }

    fn prune_versions(&self, before: Timestamp) -> ShardResult<usize> {
        let mut pruned = 0;
        let mut collections = self.collections.write();
        for collection in collections.values_mut() {
            collection.retain(|_, versions| {
                let Some(keep_from) = versions.iter().rposition(|v| v.ts <= before) else {
                    return true;
                };
                pruned += keep_from;
                versions.drain(..keep_from);
                if versions.len() == 1 && versions[0].doc.is_none() {
                    pruned += 1;
                    return false;
                }
                true
            });
        }
        Ok(pruned)
    }
}
