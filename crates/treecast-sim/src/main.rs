//! Cluster simulator for Treecast.
//!
//! Runs a whole cluster in-process on a paused clock and reports convergence.
//!
//! Usage:
//!   treecast-sim --nodes 25 --values 200 --loss 0.2
//!   treecast-sim --nodes 5 --isolate 3 --partition-from-ms 0 --partition-until-ms 10000 --json

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use treecast_core::logging::JsonlLayer;
use treecast_core::NodeConfig;
use treecast_sim::{run, PartitionPlan, Scenario};

/// Treecast cluster simulator.
#[derive(Parser, Debug)]
#[command(name = "treecast-sim")]
#[command(about = "Simulate a Treecast cluster with message loss and partitions")]
struct Args {
    /// Number of nodes
    #[arg(short, long, default_value_t = 5)]
    nodes: usize,

    /// Number of values to broadcast
    #[arg(long, default_value_t = 50)]
    values: usize,

    /// Probability in [0, 1] that a message is lost
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Seed for the network, the tree and the broadcast targets
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Gap between client broadcasts (ms)
    #[arg(long, default_value_t = 10)]
    interval_ms: u64,

    /// Isolate this node index from every other node
    #[arg(long)]
    isolate: Option<usize>,

    /// When the isolation starts, after the first broadcast (ms)
    #[arg(long, default_value_t = 0)]
    partition_from_ms: u64,

    /// When the isolation heals, after the first broadcast (ms)
    #[arg(long, default_value_t = 5000)]
    partition_until_ms: u64,

    /// Simulated seconds to wait for convergence
    #[arg(long, default_value_t = 120)]
    time_limit_s: u64,

    /// Node config JSON file
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let jsonl = std::env::var("TREECAST_LOGS_DIR")
        .ok()
        .map(|dir| JsonlLayer::new(&dir).map(|layer| (dir, layer)));
    match jsonl {
        Some(Ok((dir, layer))) => {
            let tag = layer.tag();
            tracing_subscriber::registry()
                .with(layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                )
                .with(filter)
                .init();
            if let Err(e) = tag.set("sim") {
                tracing::warn!(logs_dir = %dir, error = %e, "Failed to open JSONL log file");
            }
        }
        Some(Err(e)) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                )
                .with(filter)
                .init();
            tracing::warn!("Failed to initialize JSONL logging: {}", e);
        }
        None => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                )
                .with(filter)
                .init();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);
    tokio::time::pause();

    let config = match &args.config {
        Some(path) => NodeConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };

    let scenario = Scenario {
        nodes: args.nodes,
        values: args.values,
        loss: args.loss,
        seed: args.seed,
        broadcast_interval: Duration::from_millis(args.interval_ms),
        partition: args.isolate.map(|isolate| PartitionPlan {
            isolate,
            from: Duration::from_millis(args.partition_from_ms),
            until: Duration::from_millis(args.partition_until_ms),
        }),
        time_limit: Duration::from_secs(args.time_limit_s),
        config,
    };

    let report = run(&scenario).await.context("Simulation failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Treecast simulation");
        println!("  nodes:            {}", report.nodes);
        println!("  values:           {}", report.values);
        println!(
            "  tree:             {} edges, max degree {}",
            report.tree_edges, report.tree_max_degree
        );
        match report.converged_after_ms {
            Some(ms) => println!("  converged after:  {} ms (simulated)", ms),
            None => println!("  converged:        no"),
        }
        println!(
            "  messages:         {} sent, {} dropped, {:.1} per value",
            report.network.sent, report.network.dropped, report.messages_per_value
        );
        println!(
            "  deliveries:       {} jobs, {} attempts, {} retries, {} dead-lettered",
            report.delivery.submitted,
            report.delivery.attempts,
            report.delivery.retries,
            report.delivery.dead_lettered
        );
        for (node, gap) in &report.missing {
            println!("  {} is missing {} values", node, gap);
        }
    }

    if !report.converged {
        anyhow::bail!("cluster did not converge within {}s", args.time_limit_s);
    }
    Ok(())
}
