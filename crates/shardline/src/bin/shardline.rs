use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use shardline::{ClusterArgs, Cluster, Command, CommandError, Router};

#[derive(Parser, Debug)]
#[command(name = "shardline")]
struct Args {
    /// Disable ANSI colors in log output.
    #[arg(long, global = true)]
    no_ansi: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Execute a JSON-lines command script against an in-process cluster.
    Run {
        #[arg(long)]
        script: PathBuf,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Shard `foo.bar`, move a chunk with a stale router in play, and print what happened.
    Demo {
        /// Documents inserted before the migration.
        #[arg(long, default_value_t = 100)]
        docs: usize,
        /// Random seed (0 picks one).
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let ansi = !args.no_ansi && std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    match args.cmd {
        Cmd::Run { script, cluster } => run_script(&script, &cluster).await,
        Cmd::Demo { docs, seed, cluster } => run_demo(docs, seed, &cluster).await,
    }
}

async fn run_script(path: &Path, args: &ClusterArgs) -> anyhow::Result<()> {
    let script = std::fs::read_to_string(path).with_context(|| format!("read script {}", path.display()))?;
    let cluster = Cluster::start(args.to_config()).await?;
    let router = cluster.router();
    for (idx, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let command: Command =
            serde_json::from_str(line).with_context(|| format!("parse command on line {}", idx + 1))?;
        println!("{}", execute(&router, command).await?);
    }
    cluster.shutdown();
    Ok(())
}

/// Run one command and render its reply (or error) as a JSON line.
async fn execute(router: &Router, command: Command) -> anyhow::Result<String> {
    let out = match router.run_command(command).await {
        Ok(reply) => json!({"ok": 1, "result": reply}),
        Err(err) => json!({"ok": 0, "error": CommandError::from(&err)}),
    };
    Ok(serde_json::to_string(&out)?)
}

async fn run_demo(docs: usize, seed: u64, args: &ClusterArgs) -> anyhow::Result<()> {
    let mut config = args.to_config();
    config.shards = config.shards.max(2);
    let cluster = Cluster::start(config).await?;
    let router = cluster.router();
    let seed = if seed == 0 { rand::random() } else { seed };
    let mut rng = SmallRng::seed_from_u64(seed);

    let setup: Vec<Value> = vec![
        json!({"command": "shardCollection", "ns": "foo.bar", "key": ["x"], "chunks": [
            {"min": [{"$minKey": 1}], "max": [0], "shard": "shard0"},
            {"min": [0], "max": [{"$maxKey": 1}], "shard": "shard1"}
        ]}),
        json!({"command": "insert", "ns": "foo.bar", "documents": (0..docs)
            .map(|i| json!({"_id": i, "x": rng.gen_range(-1000i64..1000)}))
            .collect::<Vec<_>>()}),
    ];
    for cmd in setup {
        println!("{}", execute(&router, serde_json::from_value(cmd)?).await?);
    }

    // Warm a second router before the migration so it holds the old routing table.
    let stale = cluster.router();
    let warm = json!({"command": "find", "ns": "foo.bar", "filter": {"eq": {"field": "x", "value": 5}}});
    println!("{}", execute(&stale, serde_json::from_value(warm)?).await?);

    let after: Vec<Value> = vec![
        json!({"command": "moveRange", "ns": "foo.bar", "min": [0], "to": "shard0"}),
        json!({"command": "listChunks", "ns": "foo.bar"}),
    ];
    for cmd in after {
        println!("{}", execute(&router, serde_json::from_value(cmd)?).await?);
    }
    let write = json!({"command": "insert", "ns": "foo.bar", "documents": [{"_id": "stale-write", "x": 5}]});
    println!("{}", execute(&stale, serde_json::from_value(write)?).await?);
    let check = json!({"command": "aggregate", "ns": "foo.bar", "pipeline": [
        {"match": {"eq": {"field": "_id", "value": "stale-write"}}},
        {"count": "n"}
    ]});
    println!("{}", execute(&router, serde_json::from_value(check)?).await?);
    let cleanup = json!({"command": "cleanupOrphaned", "ns": "foo.bar"});
    println!("{}", execute(&router, serde_json::from_value(cleanup)?).await?);
    for id in cluster.shard_ids() {
        let shard = cluster.shard(id.as_str())?;
        println!(
            "{}",
            json!({"shard": id, "storedDocuments": shard.raw_documents("foo.bar")?.len()})
        );
    }
    tracing::info!(seed, "demo finished");
    cluster.shutdown();
    Ok(())
}
