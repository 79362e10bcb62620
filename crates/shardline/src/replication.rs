//! Durable per-shard metadata log.
//!
//! Migration state documents, recipient state documents and pending range
//! deletions must survive a shard restart. `Replication::durably_commit`
//! applies a batch of such changes all-or-nothing; `recover` returns what was
//! durable when the shard comes back.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ShardResult;
use crate::failpoint::{FailPoints, REPLICATION_FAIL_COMMIT};
use crate::migration::{MigrationDoc, RecipientDoc};
use crate::persist;
use crate::range_deleter::RangeDeletionTask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataOp {
    UpsertMigration(MigrationDoc),
    RemoveMigration(Uuid),
    UpsertRecipient(RecipientDoc),
    RemoveRecipient(Uuid),
    UpsertRangeDeletion(RangeDeletionTask),
    RemoveRangeDeletion(Uuid),
}

/// Changes applied together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataTxn {
    pub ops: Vec<MetadataOp>,
}

impl MetadataTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(op: MetadataOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn with(mut self, op: MetadataOp) -> Self {
        self.ops.push(op);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurableState {
    pub migrations: BTreeMap<Uuid, MigrationDoc>,
    pub recipients: BTreeMap<Uuid, RecipientDoc>,
    pub range_deletions: BTreeMap<Uuid, RangeDeletionTask>,
}

impl DurableState {
    fn apply(&mut self, op: MetadataOp) {
        match op {
            MetadataOp::UpsertMigration(doc) => {
                self.migrations.insert(doc.id, doc);
            }
            MetadataOp::RemoveMigration(id) => {
                self.migrations.remove(&id);
            }
            MetadataOp::UpsertRecipient(doc) => {
                self.recipients.insert(doc.id, doc);
            }
            MetadataOp::RemoveRecipient(id) => {
                self.recipients.remove(&id);
            }
            MetadataOp::UpsertRangeDeletion(task) => {
                self.range_deletions.insert(task.id, task);
            }
            MetadataOp::RemoveRangeDeletion(id) => {
                self.range_deletions.remove(&id);
            }
        }
    }
}

pub trait Replication: Send + Sync + 'static {
    /// Make `txn` durable; false means nothing was applied.
    fn durably_commit(&self, txn: MetadataTxn) -> bool;

    fn recover(&self) -> DurableState;
}

/// Single-node replication: state in memory, optionally mirrored to a JSON file.
pub struct LocalReplication {
    state: Mutex<DurableState>,
    path: Option<PathBuf>,
    failpoints: Arc<FailPoints>,
}

impl LocalReplication {
    pub fn in_memory(failpoints: Arc<FailPoints>) -> Self {
        Self {
            state: Mutex::new(DurableState::default()),
            path: None,
            failpoints,
        }
    }

    pub fn open(path: PathBuf, failpoints: Arc<FailPoints>) -> ShardResult<Self> {
        let state = persist::read_json::<DurableState>(&path)?.unwrap_or_default();
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
            failpoints,
        })
    }
}

impl Replication for LocalReplication {
    fn durably_commit(&self, txn: MetadataTxn) -> bool {
        if self.failpoints.should_fail(REPLICATION_FAIL_COMMIT) {
            tracing::warn!(ops = txn.ops.len(), "metadata commit failed by failpoint");
            return false;
        }
        let mut state = self.state.lock();
        let mut next = state.clone();
        for op in txn.ops {
            next.apply(op);
        }
        if let Some(path) = &self.path {
            if let Err(err) = persist::write_json(path, &next) {
                tracing::error!(error = %err, path = %path.display(), "persist shard metadata failed");
                return false;
            }
        }
        *state = next;
        true
    }

    fn recover(&self) -> DurableState {
        self.state.lock().clone()
    }
}
