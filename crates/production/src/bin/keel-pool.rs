//! Keel local pool
//!
//! Runs a replica pool in one process, submits requests and optionally
//! restarts a group of replicas part way through.
//!
//! # Usage
//!
//! ```bash
//! # Four replicas, ten requests
//! keel-pool --pool-size 4 --requests 10
//!
//! # Restart all but one replica after the requests
//! keel-pool --config pool.toml --restart 0,1,2
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use keel_core::{Ledger, NodeNotification};
use keel_production::{init_tracing, LocalPool, PoolFileConfig, ReplicaEvent};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Run a keel replica pool locally.
#[derive(Parser, Debug)]
#[command(name = "keel-pool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of replicas (overrides config)
    #[arg(long)]
    pool_size: Option<u32>,

    /// Requests to submit once the pool is up
    #[arg(long, default_value_t = 10)]
    requests: u32,

    /// Replicas to restart after the requests, comma separated
    #[arg(long, value_delimiter = ',')]
    restart: Vec<u32>,

    /// How long to let the pool settle after each phase, in seconds
    #[arg(long, default_value_t = 5)]
    settle_secs: u64,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let mut file_config = match &cli.config {
        Some(path) => PoolFileConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PoolFileConfig::default(),
    };
    if let Some(size) = cli.pool_size {
        file_config.pool.size = size;
    }
    file_config.validate()?;

    let pool_size = file_config.pool.size;
    if let Some(&bad) = cli.restart.iter().find(|&&n| n >= pool_size) {
        bail!("cannot restart replica {bad}: pool has {pool_size} replicas");
    }

    let settle = Duration::from_secs(cli.settle_secs);
    let mut pool = LocalPool::new(pool_size, file_config.replica_config())?;
    let mut events = pool.subscribe();
    pool.start_all()?;
    info!(pool_size, "Pool started");
    tokio::time::sleep(settle).await;

    for i in 0..cli.requests {
        pool.submit(format!("request-{i}")).await;
    }
    tokio::time::sleep(settle).await;

    if !cli.restart.is_empty() {
        info!(nodes = ?cli.restart, "Restarting group");
        for &node in &cli.restart {
            pool.stop(node).await?;
        }
        for &node in &cli.restart {
            pool.start(node)?;
        }
        tokio::time::sleep(settle).await;
        pool.submit("after-restart").await;
        tokio::time::sleep(settle).await;
    }

    report(&pool, &mut events);
    pool.shutdown().await?;
    Ok(())
}

fn report(pool: &LocalPool, events: &mut broadcast::Receiver<ReplicaEvent>) {
    let mut inconsistencies = 0;
    let mut replies = 0;
    loop {
        match events.try_recv() {
            Ok(ReplicaEvent::Notification {
                node,
                notification: NodeNotification::InconsistentThreePcState { uncertain_peers, .. },
            }) => {
                warn!(%node, uncertain_peers, "Replica reported inconsistent 3PC state");
                inconsistencies += 1;
            }
            Ok(ReplicaEvent::Reply { .. }) => replies += 1,
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event receiver lagged");
            }
            Err(_) => break,
        }
    }

    for node in 0..pool.pool_size() {
        let committed = pool
            .ledger(node)
            .map_or(0, |l| l.last_committed_seq_no().0);
        info!(node, committed, "Ledger");
    }
    info!(replies, inconsistencies, "Run complete");
}
