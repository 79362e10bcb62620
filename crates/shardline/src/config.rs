//! Cluster-wide configuration and its command-line/environment surface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::balancer::BalancerConfig;
use crate::migration::MigrationConfig;
use crate::range_deleter::RangeDeleterConfig;
use crate::resharding::ReshardingConfig;
use crate::retry::RetryPolicy;
use crate::shard::ShardOptions;

/// Document storage engine for every shard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    #[default]
    Memory,
    Fjall,
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub shards: usize,
    pub storage: StorageKind,
    /// Where the catalog, shard metadata logs and fjall data live; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub shard: ShardOptions,
    pub retry: RetryPolicy,
    pub resharding: ReshardingConfig,
    pub balancer: BalancerConfig,
    /// Background refresh of router caches; zero disables it.
    pub catalog_refresh_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: 2,
            storage: StorageKind::Memory,
            data_dir: None,
            shard: ShardOptions::default(),
            retry: RetryPolicy::default(),
            resharding: ReshardingConfig::default(),
            balancer: BalancerConfig::default(),
            catalog_refresh_interval: Duration::ZERO,
        }
    }
}

/// Every cluster tunable as a flag with a `SHARDLINE_*` environment fallback.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Number of shards (`shard0`, `shard1`, ...).
    #[arg(long, env = "SHARDLINE_SHARDS", default_value_t = 2)]
    pub shards: usize,

    #[arg(long, env = "SHARDLINE_STORAGE", value_enum, default_value_t = StorageKind::Memory)]
    pub storage: StorageKind,

    /// Persist catalog, shard metadata and fjall data under this directory.
    #[arg(long, env = "SHARDLINE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "SHARDLINE_CLONE_BATCH_SIZE", default_value_t = 128)]
    pub clone_batch_size: usize,

    #[arg(long, env = "SHARDLINE_CATCH_UP_BATCH_SIZE", default_value_t = 256)]
    pub catch_up_batch_size: usize,

    #[arg(long, env = "SHARDLINE_MAX_CATCH_UP_ROUNDS", default_value_t = 32)]
    pub max_catch_up_rounds: u32,

    /// A catch-up round with at most this many entries counts as converged.
    #[arg(long, env = "SHARDLINE_CONVERGED_THRESHOLD", default_value_t = 16)]
    pub converged_threshold: usize,

    /// How long a write waits on a critical section before failing.
    #[arg(long, env = "SHARDLINE_CRITICAL_SECTION_TIMEOUT", default_value = "5s")]
    pub critical_section_timeout: humantime::Duration,

    #[arg(long, env = "SHARDLINE_DRAIN_TIMEOUT", default_value = "2s")]
    pub drain_timeout: humantime::Duration,

    /// Donor aborts when the recipient is unreachable for longer than this.
    #[arg(long, env = "SHARDLINE_LEASE_TTL", default_value = "2s")]
    pub lease_ttl: humantime::Duration,

    #[arg(long, env = "SHARDLINE_PENDING_DELETION_WAIT", default_value = "5s")]
    pub pending_deletion_wait: humantime::Duration,

    #[arg(long, env = "SHARDLINE_RANGE_DELETER_BATCH_SIZE", default_value_t = 64)]
    pub range_deleter_batch_size: usize,

    #[arg(long, env = "SHARDLINE_RANGE_DELETER_BATCH_DELAY", default_value = "5ms")]
    pub range_deleter_batch_delay: humantime::Duration,

    #[arg(long, env = "SHARDLINE_ORPHAN_CLEANUP_DELAY", default_value = "0s")]
    pub orphan_cleanup_delay: humantime::Duration,

    /// Chunk history and MVCC versions younger than this are kept for snapshot reads.
    #[arg(long, env = "SHARDLINE_HISTORY_WINDOW", default_value = "10s")]
    pub history_window: humantime::Duration,

    #[arg(long, env = "SHARDLINE_WRITE_LOG_RETENTION", default_value_t = 100_000)]
    pub write_log_retention: usize,

    #[arg(long, env = "SHARDLINE_RETRY_ATTEMPTS", default_value_t = 10)]
    pub retry_attempts: u32,

    #[arg(long, env = "SHARDLINE_RETRY_BASE_BACKOFF", default_value = "5ms")]
    pub retry_base_backoff: humantime::Duration,

    #[arg(long, env = "SHARDLINE_RETRY_MAX_BACKOFF", default_value = "500ms")]
    pub retry_max_backoff: humantime::Duration,

    #[arg(long, env = "SHARDLINE_BALANCER_ENABLED", default_value_t = false, action = clap::ArgAction::Set)]
    pub balancer_enabled: bool,

    #[arg(long, env = "SHARDLINE_BALANCER_INTERVAL", default_value = "1s")]
    pub balancer_interval: humantime::Duration,

    /// Chunk count gap that triggers a balancer move.
    #[arg(long, env = "SHARDLINE_BALANCER_THRESHOLD", default_value_t = 2)]
    pub balancer_threshold: usize,

    /// Periodic router cache refresh; 0s disables it.
    #[arg(long, env = "SHARDLINE_CATALOG_REFRESH_INTERVAL", default_value = "0s")]
    pub catalog_refresh_interval: humantime::Duration,
}

impl ClusterArgs {
    pub fn to_config(&self) -> ClusterConfig {
        let migration = MigrationConfig {
            clone_batch_size: self.clone_batch_size,
            catch_up_batch_size: self.catch_up_batch_size,
            max_catch_up_rounds: self.max_catch_up_rounds,
            converged_threshold: self.converged_threshold,
            critical_section_timeout: self.critical_section_timeout.into(),
            drain_timeout: self.drain_timeout.into(),
            lease_ttl: self.lease_ttl.into(),
            pending_deletion_wait: self.pending_deletion_wait.into(),
            ..MigrationConfig::default()
        };
        let range_deleter = RangeDeleterConfig {
            batch_size: self.range_deleter_batch_size,
            batch_delay: self.range_deleter_batch_delay.into(),
            orphan_cleanup_delay: self.orphan_cleanup_delay.into(),
            ..RangeDeleterConfig::default()
        };
        ClusterConfig {
            shards: self.shards,
            storage: self.storage,
            data_dir: self.data_dir.clone(),
            shard: ShardOptions {
                migration,
                range_deleter,
                write_log_retention: self.write_log_retention,
                history_window: self.history_window.into(),
            },
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                base_backoff: self.retry_base_backoff.into(),
                max_backoff: self.retry_max_backoff.into(),
            },
            resharding: ReshardingConfig {
                clone_batch_size: self.clone_batch_size,
                apply_batch_size: self.catch_up_batch_size,
                converged_threshold: self.converged_threshold,
                drain_timeout: self.drain_timeout.into(),
                ..ReshardingConfig::default()
            },
            balancer: BalancerConfig {
                interval: self.balancer_interval.into(),
                threshold: self.balancer_threshold,
                enabled: self.balancer_enabled,
            },
            catalog_refresh_interval: self.catalog_refresh_interval.into(),
        }
    }
}
