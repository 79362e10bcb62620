//! Bounded per-shard log of user writes.
//!
//! Migrations and resharding replay these entries to catch a recipient up
//! with writes made after its snapshot. Entries are appended under the shard's
//! write mutex, so they are ordered by timestamp. Once the log evicts an entry
//! it can no longer serve readers positioned before it.

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::{ShardError, ShardResult};
use crate::key::{Document, KeyValue};
use crate::session::TxnInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Full post-image of an inserted or updated document.
    Upsert { doc: Document },
    /// Removal; the pre-image locates the document's shard key.
    Delete { id: KeyValue, pre_image: Document },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteLogEntry {
    pub ts: Timestamp,
    pub ns: String,
    pub op: WriteOp,
    #[serde(default)]
    pub txn: Option<TxnInfo>,
}

impl WriteLogEntry {
    /// Document image carrying the shard key of the write.
    pub fn image(&self) -> &Document {
        match &self.op {
            WriteOp::Upsert { doc } => doc,
            WriteOp::Delete { pre_image, .. } => pre_image,
        }
    }
}

#[derive(Debug, Default)]
struct LogInner {
    entries: VecDeque<WriteLogEntry>,
    truncated_through: Timestamp,
}

#[derive(Debug)]
pub struct WriteLog {
    inner: RwLock<LogInner>,
    retention: usize,
}

impl WriteLog {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(LogInner::default()),
            retention: retention.max(1),
        }
    }

    pub fn append(&self, entry: WriteLogEntry) {
        let mut inner = self.inner.write();
        inner.entries.push_back(entry);
        while inner.entries.len() > self.retention {
            if let Some(evicted) = inner.entries.pop_front() {
                inner.truncated_through = evicted.ts;
            }
        }
    }

    /// Entries of `ns` with `ts > after`, at most `limit` of them.
    ///
    /// Also returns the timestamp of the last entry examined, so callers that
    /// filter further can advance past entries they skip.
    pub fn read_after(
        &self,
        ns: &str,
        after: Timestamp,
        limit: usize,
    ) -> ShardResult<(Vec<WriteLogEntry>, Timestamp)> {
        let inner = self.inner.read();
        if after < inner.truncated_through {
            return Err(ShardError::DataInconsistency(format!(
                "write log no longer covers {after}; entries through {} were evicted",
                inner.truncated_through
            )));
        }
        let start = inner.entries.partition_point(|e| e.ts <= after);
        let mut out = Vec::new();
        let mut last_seen = after;
        for entry in inner.entries.range(start..) {
            if out.len() >= limit {
                break;
            }
            last_seen = entry.ts;
            if entry.ns == ns {
                out.push(entry.clone());
            }
        }
        Ok((out, last_seen))
    }

    /// Timestamp of the newest evicted entry.
    pub fn truncated_through(&self) -> Timestamp {
        self.inner.read().truncated_through
    }

    pub fn latest(&self) -> Option<Timestamp> {
        self.inner.read().entries.back().map(|e| e.ts)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(ts: u64, ns: &str) -> WriteLogEntry {
        WriteLogEntry {
            ts: Timestamp(ts),
            ns: ns.to_string(),
            op: WriteOp::Upsert {
                doc: json!({"_id": ts}).as_object().cloned().expect("object"),
            },
            txn: None,
        }
    }

    #[test]
    fn read_after_filters_by_namespace_and_position() {
        let log = WriteLog::new(100);
        for ts in 1..=6 {
            log.append(entry(ts, if ts % 2 == 0 { "a.b" } else { "c.d" }));
        }
        let (entries, last) = log.read_after("a.b", Timestamp(2), 100).expect("read");
        assert_eq!(
            entries.iter().map(|e| e.ts.0).collect::<Vec<_>>(),
            vec![4, 6]
        );
        assert_eq!(last, Timestamp(6));

        let (limited, last) = log.read_after("a.b", Timestamp(0), 3).expect("read");
        assert_eq!(limited.len(), 1);
        assert_eq!(last, Timestamp(3));
    }

    #[test]
    fn eviction_makes_old_positions_unreadable() {
        let log = WriteLog::new(3);
        for ts in 1..=5 {
            log.append(entry(ts, "a.b"));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.truncated_through(), Timestamp(2));
        assert!(matches!(
            log.read_after("a.b", Timestamp(1), 10),
            Err(ShardError::DataInconsistency(_))
        ));
        let (entries, _) = log.read_after("a.b", Timestamp(2), 10).expect("read");
        assert_eq!(entries.len(), 3);
    }
}
