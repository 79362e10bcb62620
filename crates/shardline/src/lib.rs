//! Shardline: a sharded document store.
//!
//! Collections are split into chunks of shard-key space, each owned by one
//! shard. The config catalog holds the authoritative routing table; routers
//! cache it and shards guard every operation against it. Chunks move between
//! shards through migrations, whole collections change key through
//! resharding, and documents left behind are hidden by the orphan filter
//! until the range deleter removes them.

pub mod balancer;
pub mod catalog;
pub mod catalog_cache;
pub mod catalog_manager;
pub mod chunk;
pub mod chunk_map;
pub mod clock;
pub mod cluster;
pub mod command;
pub mod config;
pub mod critical_section;
pub mod error;
pub mod failpoint;
pub mod key;
pub mod migration;
pub mod orphan_filter;
mod persist;
pub mod query;
pub mod range_deleter;
pub mod registry;
pub mod replication;
pub mod resharding;
pub mod retry;
pub mod router;
pub mod session;
pub mod shard;
pub mod shard_version;
pub mod sharding_state;
pub mod snapshot_registry;
pub mod storage;
pub mod types;
pub mod version;
pub mod write_log;

pub use crate::chunk::{Chunk, ChunkRange};
pub use crate::chunk_map::ChunkMap;
pub use crate::clock::Timestamp;
pub use crate::cluster::Cluster;
pub use crate::command::{Command, CommandError, CommandReply};
pub use crate::config::{ClusterArgs, ClusterConfig, StorageKind};
pub use crate::error::{ShardError, ShardResult};
pub use crate::key::{Document, KeyValue, ShardKey, ShardKeyPattern};
pub use crate::query::{Filter, Stage, UpdateOp, UpdateSpec};
pub use crate::router::Router;
pub use crate::types::ShardId;
pub use crate::version::ChunkVersion;
