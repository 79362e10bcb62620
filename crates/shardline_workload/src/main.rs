//! Load generator for exercising Shardline while chunks move.
//!
//! Writers insert uniquely-identified documents through their own routers
//! while a chaos task splits chunks and moves them between shards. At the end
//! every acknowledged document must be visible exactly once.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time;

use shardline::catalog_manager::InitialChunks;
use shardline::{Cluster, ClusterArgs, Document, Filter, ShardKey, ShardKeyPattern, ShardId};

const NS: &str = "workload.docs";

#[derive(Parser, Debug)]
#[command(name = "shardline-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Concurrent writers, each with its own router.
    #[arg(long, default_value_t = 8)]
    writers: usize,

    /// Shard key values are drawn from `[-key_range, key_range)`.
    #[arg(long, default_value_t = 1000)]
    key_range: i64,

    /// Documents per insert batch.
    #[arg(long, default_value_t = 4)]
    batch: usize,

    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Pause between chaos operations.
    #[arg(long, default_value = "50ms")]
    chaos_interval: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[command(flatten)]
    cluster: ClusterArgs,
}

#[derive(Debug, Default, Serialize)]
struct WriterStats {
    acknowledged: Vec<String>,
    failed: usize,
}

#[derive(Debug, Default, Serialize)]
struct ChaosStats {
    splits: usize,
    moves: usize,
    errors: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct Summary {
    seed: u64,
    duration_ms: u64,
    acknowledged: usize,
    failed_batches: usize,
    visible: usize,
    missing: usize,
    duplicated: usize,
    chunks: usize,
    chaos: ChaosStats,
    ok: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.writers > 0, "--writers must be > 0");
    anyhow::ensure!(args.key_range > 0, "--key-range must be > 0");
    anyhow::ensure!(args.batch > 0, "--batch must be > 0");

    let mut config = args.cluster.to_config();
    config.shards = config.shards.max(2);
    let cluster = Cluster::start(config).await?;
    let shards = cluster.shard_ids();
    let pattern = ShardKeyPattern::new(["x"])?;
    cluster
        .router()
        .shard_collection(NS, pattern, InitialChunks::Primary(shards[0].clone()))
        .await
        .context("shard the workload collection")?;

    let seed = if args.seed == 0 { rand::thread_rng().gen() } else { args.seed };
    let duration: Duration = args.duration.into();
    let start = time::Instant::now();
    let deadline = start + duration;

    let writers = (0..args.writers).map(|writer| {
        let cluster = cluster.clone();
        let args = args.clone();
        // Mix the base seed with the writer id for deterministic per-writer RNG.
        let seed = seed ^ (writer as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tokio::spawn(async move { run_writer(cluster, writer, args, seed, deadline).await })
    });
    let chaos = tokio::spawn(run_chaos(
        cluster.clone(),
        shards.clone(),
        args.key_range,
        args.chaos_interval.into(),
        seed,
        deadline,
    ));

    let mut acknowledged = Vec::new();
    let mut failed_batches = 0;
    for res in join_all(writers).await {
        let stats = res.context("writer task panicked")?;
        acknowledged.extend(stats.acknowledged);
        failed_batches += stats.failed;
    }
    let chaos = chaos.await.context("chaos task panicked")?;

    let router = cluster.router();
    let docs = router.find(NS, &Filter::All, None).await.context("final scan")?;
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for doc in &docs {
        if let Some(Value::String(id)) = doc.get("_id") {
            *seen.entry(id.clone()).or_insert(0) += 1;
        }
    }
    let acked: HashSet<&String> = acknowledged.iter().collect();
    let missing = acked.iter().filter(|id| !seen.contains_key(id.as_str())).count();
    let duplicated = seen.values().filter(|n| **n > 1).count();
    let chunks = router.list_chunks(NS).await?.len();

    let summary = Summary {
        seed,
        duration_ms: start.elapsed().as_millis() as u64,
        acknowledged: acknowledged.len(),
        failed_batches,
        visible: docs.len(),
        missing,
        duplicated,
        chunks,
        chaos,
        ok: missing == 0 && duplicated == 0,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    cluster.shutdown();
    anyhow::ensure!(summary.ok, "{missing} acknowledged documents missing, {duplicated} duplicated");
    Ok(())
}

async fn run_writer(
    cluster: Arc<Cluster>,
    writer: usize,
    args: RunArgs,
    seed: u64,
    deadline: time::Instant,
) -> WriterStats {
    let router = cluster.router();
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut stats = WriterStats::default();
    let mut next = 0usize;
    while time::Instant::now() < deadline {
        let batch: Vec<Document> = (0..args.batch)
            .map(|_| {
                next += 1;
                let doc = json!({
                    "_id": format!("w{writer}-{next}"),
                    "x": rng.gen_range(-args.key_range..args.key_range),
                    "writer": writer,
                });
                match doc {
                    Value::Object(map) => map,
                    _ => Document::new(),
                }
            })
            .collect();
        let ids: Vec<String> = batch
            .iter()
            .filter_map(|d| d.get("_id").and_then(Value::as_str).map(str::to_string))
            .collect();
        let reply = router.insert(NS, batch, None).await;
        stats.acknowledged.extend(ids.into_iter().take(reply.inserted));
        if let Some(err) = reply.error {
            tracing::warn!(writer, error = %err, "insert batch failed");
            stats.failed += 1;
        }
    }
    stats
}

async fn run_chaos(
    cluster: Arc<Cluster>,
    shards: Vec<ShardId>,
    key_range: i64,
    interval: Duration,
    seed: u64,
    deadline: time::Instant,
) -> ChaosStats {
    let router = cluster.router();
    let mut rng = SmallRng::seed_from_u64(seed.rotate_left(17));
    let mut stats = ChaosStats::default();
    while time::Instant::now() < deadline {
        time::sleep(interval).await;
        let res = if rng.gen_bool(0.4) {
            let at = ShardKey::int(rng.gen_range(-key_range..key_range));
            router.split_chunk(NS, at).await.map(|_| stats.splits += 1)
        } else {
            match router.list_chunks(NS).await {
                Ok(chunks) => {
                    let chunk = &chunks[rng.gen_range(0..chunks.len())];
                    let others: Vec<&ShardId> = shards.iter().filter(|s| **s != chunk.shard).collect();
                    let to = others[rng.gen_range(0..others.len())].clone();
                    router
                        .move_range(NS, chunk.range.min.clone(), Some(chunk.range.max.clone()), to)
                        .await
                        .map(|_| stats.moves += 1)
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = res {
            *stats.errors.entry(err.code().to_string()).or_insert(0) += 1;
        }
    }
    stats
}
