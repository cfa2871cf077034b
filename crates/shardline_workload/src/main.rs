//! Load generator for the shardline client pipeline.
//!
//! Runs a put/get mix from many concurrent tasks through one `Client` backed by
//! an in-process cluster, optionally killing write streams mid-run, and emits
//! a JSON summary with per-operation counts and client-side batch statistics.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use shardline_client::{Client, ClientConfig, ClientStatsSnapshot, LocalCluster, Status};
use tokio::time;

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
    /// Number of concurrent tasks issuing operations.
    #[arg(long, default_value_t = 32)]
    clients: usize,

    /// Number of distinct keys.
    #[arg(long, default_value_t = 1_000)]
    keys: usize,

    /// Number of shards the in-process cluster splits the hash space into.
    #[arg(long, default_value_t = 4)]
    shards: u32,

    /// Percent of operations that are puts (rest are gets).
    #[arg(long, default_value_t = 50)]
    put_pct: u8,

    /// Total runtime.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Percent of operations preceded by terminating the key's write streams.
    #[arg(long, default_value_t = 0)]
    fault_pct: u8,

    /// Batch linger.
    #[arg(long, default_value = "5ms")]
    linger: humantime::Duration,

    /// Maximum calls per batch.
    #[arg(long, default_value_t = 1_000)]
    max_batch: usize,

    /// Write the JSON summary to this path as well as stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Serialize, Debug, Clone)]
struct RunMeta {
    clients: usize,
    keys: usize,
    shards: u32,
    put_pct: u8,
    duration_ms: u64,
    seed: u64,
    fault_pct: u8,
    linger_ms: u64,
    max_batch: usize,
}

/// Per-task outcome counters.
#[derive(Serialize, Debug, Clone, Copy, Default)]
struct OpCounts {
    puts: u64,
    put_errors: u64,
    gets: u64,
    get_errors: u64,
    found: u64,
    not_found: u64,
    faults_injected: u64,
}

impl OpCounts {
    fn merge(&mut self, other: &OpCounts) {
        self.puts += other.puts;
        self.put_errors += other.put_errors;
        self.gets += other.gets;
        self.get_errors += other.get_errors;
        self.found += other.found;
        self.not_found += other.not_found;
        self.faults_injected += other.faults_injected;
    }
}

#[derive(Serialize, Debug)]
struct Summary {
    meta: RunMeta,
    totals: OpCounts,
    ops_per_sec: f64,
    write_streams_opened: u64,
    write_requests: u64,
    read_calls: u64,
    client: Option<ClientStatsSnapshot>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(args.shards > 0, "--shards must be > 0");
    anyhow::ensure!(args.put_pct <= 100, "--put-pct must be <= 100");
    anyhow::ensure!(args.fault_pct <= 100, "--fault-pct must be <= 100");

    let duration: Duration = args.duration.into();
    let linger: Duration = args.linger.into();
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let cluster = LocalCluster::new(args.shards);
    let config = ClientConfig {
        batch_linger: linger,
        max_requests_per_batch: args.max_batch,
        ..ClientConfig::default()
    };
    let client = Arc::new(
        Client::connect(config, Arc::new(cluster.clone()), Arc::new(cluster.clone()))
            .await
            .context("connect client")?,
    );
    tracing::info!(shards = args.shards, clients = args.clients, seed, "workload started");

    let keyspace: Arc<Vec<String>> = Arc::new((0..args.keys).map(|i| format!("k{seed}_{i}")).collect());
    let deadline = time::Instant::now() + duration;
    let started = time::Instant::now();

    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let client = client.clone();
        let cluster = cluster.clone();
        let keyspace = keyspace.clone();
        let put_pct = args.put_pct;
        let fault_pct = args.fault_pct;
        // Mix the base seed with the task id for deterministic per-task RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(client_id, client, cluster, keyspace, put_pct, fault_pct, seed, deadline).await
        }));
    }

    let mut totals = OpCounts::default();
    for task in tasks {
        let counts = task.await.context("client task panicked")?;
        totals.merge(&counts);
    }
    let elapsed = started.elapsed();

    let summary = Summary {
        meta: RunMeta {
            clients: args.clients,
            keys: args.keys,
            shards: args.shards,
            put_pct: args.put_pct,
            duration_ms: duration.as_millis() as u64,
            seed,
            fault_pct: args.fault_pct,
            linger_ms: linger.as_millis() as u64,
            max_batch: args.max_batch,
        },
        totals,
        ops_per_sec: (totals.puts + totals.gets) as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        write_streams_opened: cluster.write_streams_opened(),
        write_requests: cluster.write_requests(),
        read_calls: cluster.read_calls(),
        client: client.stats().map(|stats| stats.snapshot_and_reset()),
    };
    client.close().await;

    let data = serde_json::to_vec_pretty(&summary).context("serialize summary")?;
    if let Some(path) = &args.out {
        write_summary(path, &data)?;
        tracing::info!(path = %path.display(), "wrote summary");
    }
    println!("{}", String::from_utf8_lossy(&data));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    client_id: usize,
    client: Arc<Client>,
    cluster: LocalCluster,
    keyspace: Arc<Vec<String>>,
    put_pct: u8,
    fault_pct: u8,
    seed: u64,
    deadline: time::Instant,
) -> OpCounts {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut counts = OpCounts::default();
    let mut seq = 0u64;

    while time::Instant::now() < deadline {
        seq += 1;
        let key = &keyspace[rng.gen_range(0..keyspace.len())];

        if should_inject_fault(&mut rng, fault_pct) {
            if let Some(shard) = cluster.shard_for_key(key) {
                cluster.terminate_write_streams(shard);
                counts.faults_injected += 1;
            }
        }

        if rng.gen_range(0..100) < put_pct as u32 {
            counts.puts += 1;
            let value = format!("c{client_id}:{seq}");
            if let Err(err) = client.put(key.clone(), value).await {
                counts.put_errors += 1;
                tracing::debug!(client_id, key = %key, error = %err, "put failed");
            }
        } else {
            counts.gets += 1;
            match client.get(key.clone()).await {
                Ok(response) if response.status == Status::Ok => counts.found += 1,
                Ok(_) => counts.not_found += 1,
                Err(err) => {
                    counts.get_errors += 1;
                    tracing::debug!(client_id, key = %key, error = %err, "get failed");
                }
            }
        }
    }
    counts
}

fn should_inject_fault(rng: &mut SmallRng, pct: u8) -> bool {
    if pct == 0 {
        return false;
    }
    rng.gen_range(0..100) < pct as u32
}

fn write_summary(path: &PathBuf, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
