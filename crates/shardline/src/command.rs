//! The router's command surface as a closed set of typed variants.
//!
//! Commands arrive as JSON objects tagged by `"command"`, e.g.
//! `{"command": "moveRange", "ns": "foo.bar", "min": [0], "to": "shard0"}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::{Chunk, ChunkRange};
use crate::clock::Timestamp;
use crate::error::ShardError;
use crate::key::{Document, ShardKey};
use crate::query::{Filter, Stage, UpdateSpec};
use crate::session::TxnInfo;
use crate::shard::UpdateReply;
use crate::types::ShardId;
use crate::version::ChunkVersion;

fn match_all() -> Filter {
    Filter::All
}

/// One chunk of an explicit initial or resharded layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAssignment {
    pub min: ShardKey,
    pub max: ShardKey,
    pub shard: ShardId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    ShardCollection {
        ns: String,
        key: Vec<String>,
        /// Explicit layout; empty puts everything on `primary`.
        #[serde(default)]
        chunks: Vec<ChunkAssignment>,
        #[serde(default)]
        primary: Option<ShardId>,
    },
    DropCollection {
        ns: String,
    },
    RefineCollectionShardKey {
        ns: String,
        key: Vec<String>,
    },
    MoveRange {
        ns: String,
        min: ShardKey,
        #[serde(default)]
        max: Option<ShardKey>,
        to: ShardId,
    },
    SplitChunk {
        ns: String,
        at: ShardKey,
    },
    MergeChunks {
        ns: String,
        min: ShardKey,
        max: ShardKey,
    },
    ReshardCollection {
        ns: String,
        key: Vec<String>,
        #[serde(default)]
        chunks: Vec<ChunkAssignment>,
    },
    AbortReshardCollection {
        ns: String,
    },
    FlushRouterConfig {
        #[serde(default)]
        ns: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CleanupOrphaned {
        ns: String,
        #[serde(default)]
        start_key: Option<ShardKey>,
    },
    ListChunks {
        ns: String,
    },
    SetAllowMigrations {
        ns: String,
        allow: bool,
    },
    #[serde(rename_all = "camelCase")]
    Find {
        ns: String,
        #[serde(default = "match_all")]
        filter: Filter,
        #[serde(default)]
        read_at: Option<Timestamp>,
    },
    Insert {
        ns: String,
        documents: Vec<Document>,
        #[serde(default)]
        txn: Option<TxnInfo>,
    },
    Update {
        ns: String,
        update: UpdateSpec,
        #[serde(default)]
        txn: Option<TxnInfo>,
    },
    Delete {
        ns: String,
        #[serde(default = "match_all")]
        filter: Filter,
        #[serde(default)]
        multi: bool,
        #[serde(default)]
        txn: Option<TxnInfo>,
    },
    Aggregate {
        ns: String,
        pipeline: Vec<Stage>,
    },
}

impl Command {
    /// Wire name of the command, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ShardCollection { .. } => "shardCollection",
            Command::DropCollection { .. } => "dropCollection",
            Command::RefineCollectionShardKey { .. } => "refineCollectionShardKey",
            Command::MoveRange { .. } => "moveRange",
            Command::SplitChunk { .. } => "splitChunk",
            Command::MergeChunks { .. } => "mergeChunks",
            Command::ReshardCollection { .. } => "reshardCollection",
            Command::AbortReshardCollection { .. } => "abortReshardCollection",
            Command::FlushRouterConfig { .. } => "flushRouterConfig",
            Command::CleanupOrphaned { .. } => "cleanupOrphaned",
            Command::ListChunks { .. } => "listChunks",
            Command::SetAllowMigrations { .. } => "setAllowMigrations",
            Command::Find { .. } => "find",
            Command::Insert { .. } => "insert",
            Command::Update { .. } => "update",
            Command::Delete { .. } => "delete",
            Command::Aggregate { .. } => "aggregate",
        }
    }
}

pub(crate) fn assignments(chunks: Vec<ChunkAssignment>) -> crate::error::ShardResult<Vec<(ChunkRange, ShardId)>> {
    chunks
        .into_iter()
        .map(|c| Ok((ChunkRange::new(c.min, c.max)?, c.shard)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "camelCase")]
pub enum CommandReply {
    Ok,
    Version {
        version: ChunkVersion,
    },
    Dropped {
        dropped: bool,
    },
    Moved {
        migration: Uuid,
        version: ChunkVersion,
    },
    #[serde(rename_all = "camelCase")]
    CleanedUp {
        ranges_waited: usize,
    },
    Chunks {
        version: ChunkVersion,
        chunks: Vec<Chunk>,
    },
    Documents {
        documents: Vec<Document>,
    },
    Inserted {
        inserted: usize,
    },
    Updated(UpdateReply),
    Deleted {
        deleted: usize,
    },
}

/// JSON shape of a failed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authoritative_version: Option<ChunkVersion>,
}

impl From<&ShardError> for CommandError {
    fn from(err: &ShardError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            authoritative_version: err.authoritative_version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_parse_from_tagged_json() {
        let cmd: Command = serde_json::from_value(json!({
            "command": "moveRange",
            "ns": "foo.bar",
            "min": [0],
            "to": "shard0"
        }))
        .expect("moveRange");
        assert_eq!(
            cmd,
            Command::MoveRange {
                ns: "foo.bar".into(),
                min: ShardKey::int(0),
                max: None,
                to: ShardId::from("shard0"),
            }
        );
        assert_eq!(cmd.name(), "moveRange");

        let find: Command = serde_json::from_value(json!({"command": "find", "ns": "foo.bar"})).expect("find");
        assert!(matches!(find, Command::Find { filter: Filter::All, read_at: None, .. }));

        let cleanup: Command = serde_json::from_value(json!({
            "command": "cleanupOrphaned",
            "ns": "foo.bar",
            "startKey": [{"$minKey": 1}]
        }))
        .expect("cleanupOrphaned");
        assert!(matches!(cleanup, Command::CleanupOrphaned { start_key: Some(_), .. }));

        assert!(serde_json::from_value::<Command>(json!({"command": "shutdown"})).is_err());
    }

    #[test]
    fn errors_carry_code_and_version() {
        let version = ChunkVersion::new(Uuid::new_v4(), 3, 1);
        let err = ShardError::stale("foo.bar", None, Some(version));
        let wire = CommandError::from(&err);
        assert_eq!(wire.code, "StaleConfig");
        assert_eq!(wire.authoritative_version, Some(version));
        let reply = serde_json::to_value(CommandReply::Deleted { deleted: 2 }).expect("json");
        assert_eq!(reply, json!({"reply": "deleted", "deleted": 2}));
    }
}
