//! Error taxonomy shared by shards, routers and the config catalog.

use thiserror::Error;
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::types::ShardId;
use crate::version::{ChunkVersion, DisplayVersion};

pub type ShardResult<T> = Result<T, ShardError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// Caller's routing metadata disagrees with the shard's authoritative copy.
    #[error(
        "stale config for {ns}: attached {}, authoritative {}",
        DisplayVersion(.attached),
        DisplayVersion(.authoritative)
    )]
    StaleConfig {
        ns: String,
        attached: Option<ChunkVersion>,
        authoritative: Option<ChunkVersion>,
    },

    #[error("migration conflict on {ns}: {reason}")]
    MigrationConflict { ns: String, reason: String },

    #[error("incomplete history for session {lsid} txn {txn_number}; the retried statement cannot be verified")]
    IncompleteTransactionHistory { lsid: Uuid, txn_number: u64 },

    /// A migration gave up and rolled back; ownership did not change.
    #[error("migration on {ns} aborted: {reason}")]
    MigrationAborted { ns: String, reason: String },

    #[error("duplicate key {id} in {ns}")]
    DuplicateKey { ns: String, id: String },

    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("namespace {0} is not sharded")]
    NamespaceNotSharded(String),

    #[error("shard {0} not found")]
    ShardNotFound(String),

    #[error("shard {0} is unavailable")]
    ShardUnavailable(ShardId),

    #[error("chunk history for {ns} does not reach back to {read_at}")]
    StaleChunkHistory { ns: String, read_at: Timestamp },

    #[error("snapshot at {read_at} on {ns} is older than a completed range deletion")]
    SnapshotTooOld { ns: String, read_at: Timestamp },

    #[error("resharding of {ns} aborted: {reason}")]
    ReshardCollectionAborted { ns: String, reason: String },

    #[error("resharding of {0} is already in progress")]
    ReshardCollectionInProgress(String),

    #[error("resharding of {0} has entered its commit phase and can no longer be aborted")]
    ReshardCollectionCommitted(String),

    #[error("operation interrupted: {0}")]
    Interrupted(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ShardError {
    pub fn stale(
        ns: impl Into<String>,
        attached: Option<ChunkVersion>,
        authoritative: Option<ChunkVersion>,
    ) -> Self {
        ShardError::StaleConfig {
            ns: ns.into(),
            attached,
            authoritative,
        }
    }

    pub fn conflict(ns: impl Into<String>, reason: impl Into<String>) -> Self {
        ShardError::MigrationConflict {
            ns: ns.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ShardError::StaleConfig { .. } => "StaleConfig",
            ShardError::MigrationConflict { .. } => "MigrationConflict",
            ShardError::MigrationAborted { .. } => "MigrationAborted",
            ShardError::IncompleteTransactionHistory { .. } => "IncompleteTransactionHistory",
            ShardError::DuplicateKey { .. } => "DuplicateKey",
            ShardError::DataInconsistency(_) => "DataInconsistency",
            ShardError::LockTimeout(_) => "LockTimeout",
            ShardError::InvalidOptions(_) => "InvalidOptions",
            ShardError::IllegalOperation(_) => "IllegalOperation",
            ShardError::ConflictingOperationInProgress(_) => "ConflictingOperationInProgress",
            ShardError::NamespaceNotFound(_) => "NamespaceNotFound",
            ShardError::NamespaceNotSharded(_) => "NamespaceNotSharded",
            ShardError::ShardNotFound(_) => "ShardNotFound",
            ShardError::ShardUnavailable(_) => "ShardUnavailable",
            ShardError::StaleChunkHistory { .. } => "StaleChunkHistory",
            ShardError::SnapshotTooOld { .. } => "SnapshotTooOld",
            ShardError::ReshardCollectionAborted { .. } => "ReshardCollectionAborted",
            ShardError::ReshardCollectionInProgress(_) => "ReshardCollectionInProgress",
            ShardError::ReshardCollectionCommitted(_) => "ReshardCollectionCommitted",
            ShardError::Interrupted(_) => "Interrupted",
            ShardError::Storage(_) => "Storage",
            ShardError::Internal(_) => "Internal",
        }
    }

    /// Errors a router or retrying component may resolve by refreshing and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardError::StaleConfig { .. }
                | ShardError::MigrationConflict { .. }
                | ShardError::LockTimeout(_)
                | ShardError::ShardUnavailable(_)
        )
    }

    pub fn is_stale_config(&self) -> bool {
        matches!(self, ShardError::StaleConfig { .. })
    }

    /// Authoritative version carried by a `StaleConfig` error.
    pub fn authoritative_version(&self) -> Option<ChunkVersion> {
        match self {
            ShardError::StaleConfig { authoritative, .. } => *authoritative,
            _ => None,
        }
    }
}
