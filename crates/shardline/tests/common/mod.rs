//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use shardline::catalog_manager::InitialChunks;
use shardline::{
    ChunkRange, ChunkVersion, Cluster, ClusterConfig, Document, Router, ShardId, ShardKey, ShardKeyPattern,
};

pub const NS: &str = "foo.bar";

/// Upper bound for anything a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Config with short timeouts so failure paths finish quickly.
pub fn fast_config(shards: usize) -> ClusterConfig {
    let mut config = ClusterConfig {
        shards,
        ..ClusterConfig::default()
    };
    config.shard.migration.lease_ttl = Duration::from_millis(300);
    config.shard.migration.critical_section_timeout = Duration::from_secs(2);
    config.shard.migration.pending_deletion_wait = Duration::from_millis(500);
    config.shard.range_deleter.batch_delay = Duration::from_millis(1);
    config
}

pub async fn start_cluster(shards: usize) -> Arc<Cluster> {
    init_tracing();
    Cluster::start(fast_config(shards)).await.expect("start cluster")
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Documents `{_id: i, x: i}` for every `i` in `keys`.
pub fn docs_for(keys: impl IntoIterator<Item = i64>) -> Vec<Document> {
    keys.into_iter()
        .map(|i| doc(serde_json::json!({"_id": i, "x": i})))
        .collect()
}

pub fn range(min: i64, max: i64) -> ChunkRange {
    ChunkRange::new(ShardKey::int(min), ShardKey::int(max)).expect("range")
}

/// `[MinKey, 0) -> shard0`, `[0, MaxKey) -> shard1`, sharded on `x`.
pub async fn shard_split_at_zero(router: &Router) {
    router
        .shard_collection(
            NS,
            ShardKeyPattern::new(["x"]).expect("pattern"),
            InitialChunks::Distribution(vec![
                (
                    ChunkRange::new(ShardKey::min(1), ShardKey::int(0)).expect("low"),
                    ShardId::from("shard0"),
                ),
                (
                    ChunkRange::new(ShardKey::int(0), ShardKey::max(1)).expect("high"),
                    ShardId::from("shard1"),
                ),
            ]),
        )
        .await
        .expect("shard collection");
}

/// Everything on `shard0`, sharded on `x`.
pub async fn shard_on_primary(router: &Router) {
    router
        .shard_collection(
            NS,
            ShardKeyPattern::new(["x"]).expect("pattern"),
            InitialChunks::Primary(ShardId::from("shard0")),
        )
        .await
        .expect("shard collection");
}

pub async fn insert_all(router: &Router, docs: Vec<Document>) {
    let expected = docs.len();
    let reply = router.insert(NS, docs, None).await;
    assert!(reply.error.is_none(), "insert failed: {:?}", reply.error);
    assert_eq!(reply.inserted, expected);
}

pub async fn catalog_version(cluster: &Cluster) -> ChunkVersion {
    cluster
        .manager()
        .load(NS)
        .await
        .expect("load routing table")
        .collection_version()
}

/// `x` values of `docs`, sorted.
pub fn xs(docs: &[Document]) -> Vec<i64> {
    let mut out: Vec<i64> = docs
        .iter()
        .filter_map(|d| d.get("x").and_then(Value::as_i64))
        .collect();
    out.sort_unstable();
    out
}

/// Poll `check` until it returns true or the wait timeout passes.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while !check().await {
        if start.elapsed() > WAIT_TIMEOUT {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
