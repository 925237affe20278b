//! Treecast Maelstrom node.
//!
//! Speaks the Maelstrom JSON-lines protocol on stdin/stdout; logs go to
//! stderr (and optionally to a JSONL file per node).
//!
//! Usage:
//!   maelstrom test -w broadcast --bin target/release/treecast-node --node-count 25 \
//!       --time-limit 20 --rate 100 --latency 100 --nemesis partition
//!   TREECAST_LOGS_DIR=./logs treecast-node -v

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use treecast_core::logging::{JsonlLayer, NodeTag};
use treecast_core::{BroadcastNode, MaelstromRuntime, NodeConfig, NodeId, Transport};

/// Tree-routed broadcast node for Maelstrom.
#[derive(Parser, Debug)]
#[command(name = "treecast-node")]
#[command(about = "Fault-tolerant spanning-tree broadcast node for Maelstrom", version)]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON config file; the flags below override its values
    #[arg(long, env = "TREECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Write JSONL logs to <dir>/raw/<date>_<node>.jsonl
    #[arg(long, env = "TREECAST_LOGS_DIR")]
    logs_dir: Option<PathBuf>,

    /// How long one delivery attempt waits for broadcast_ok (ms)
    #[arg(long, env = "TREECAST_RPC_TIMEOUT_MS")]
    rpc_timeout_ms: Option<u64>,

    /// First retry delay (ms)
    #[arg(long, env = "TREECAST_RETRY_BASE_MS")]
    retry_base_ms: Option<u64>,

    /// Retry delay cap (ms)
    #[arg(long, env = "TREECAST_RETRY_MAX_MS")]
    retry_max_ms: Option<u64>,

    /// Give up on a delivery after this many attempts (default: never)
    #[arg(long, env = "TREECAST_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Lower bound of the anti-entropy interval (ms)
    #[arg(long, env = "TREECAST_POLL_MIN_MS")]
    poll_min_ms: Option<u64>,

    /// Upper bound (exclusive) of the anti-entropy interval (ms)
    #[arg(long, env = "TREECAST_POLL_MAX_MS")]
    poll_max_ms: Option<u64>,

    /// Node that builds and distributes the tree (default: first node id)
    #[arg(long, env = "TREECAST_COORDINATOR")]
    coordinator: Option<String>,

    /// Seed for the synthetic edge weights
    #[arg(long, env = "TREECAST_TOPOLOGY_SEED")]
    topology_seed: Option<u64>,

    /// Seed for the anti-entropy jitter
    #[arg(long, env = "TREECAST_JITTER_SEED")]
    jitter_seed: Option<u64>,

    /// Install topologies sent by Maelstrom clients instead of ignoring them
    #[arg(long, env = "TREECAST_ACCEPT_CLIENT_TOPOLOGY")]
    accept_client_topology: bool,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => NodeConfig::default(),
        };

        let ms = Duration::from_millis;
        if let Some(v) = self.rpc_timeout_ms {
            config.rpc_timeout = ms(v);
        }
        if let Some(v) = self.retry_base_ms {
            config.retry_base = ms(v);
        }
        if let Some(v) = self.retry_max_ms {
            config.retry_max = ms(v);
        }
        if let Some(v) = self.poll_min_ms {
            config.poll_min = ms(v);
        }
        if let Some(v) = self.poll_max_ms {
            config.poll_max = ms(v);
        }
        if self.max_attempts.is_some() {
            config.max_attempts = self.max_attempts;
        }
        if let Some(c) = &self.coordinator {
            config.coordinator = Some(NodeId::new(c.clone()));
        }
        if self.topology_seed.is_some() {
            config.topology_seed = self.topology_seed;
        }
        if self.jitter_seed.is_some() {
            config.jitter_seed = self.jitter_seed;
        }
        config.accept_client_topology |= self.accept_client_topology;

        config.validate().context("Invalid node configuration")?;
        Ok(config)
    }
}

/// Console logging on stderr, plus the JSONL layer when a logs dir is given.
///
/// Returns the tag to name the JSONL file once the node id is known.
fn setup_logging(verbosity: u8, logs_dir: Option<&Path>) -> Option<NodeTag> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let jsonl = logs_dir.map(|dir| (dir, JsonlLayer::new(dir)));
    match jsonl {
        Some((_, Ok(layer))) => {
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
            Some(tag)
        }
        Some((dir, Err(e))) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                )
                .with(filter)
                .init();
            warn!(dir = %dir.display(), error = %e, "Failed to initialize JSONL logging");
            None
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
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let tag = setup_logging(cli.verbose, cli.logs_dir.as_deref());
    let config = cli.node_config()?;

    let runtime = MaelstromRuntime::init()
        .await
        .context("Maelstrom init handshake failed")?;
    let transport = runtime.transport();

    if let Some(tag) = tag {
        match tag.set(transport.node_id().as_str()) {
            Ok(path) => info!(path = %path.display(), "JSONL logging enabled"),
            Err(e) => warn!(error = %e, "Failed to open JSONL log file"),
        }
    }
    info!(
        config = %serde_json::to_string(&config).unwrap_or_default(),
        "Starting broadcast node"
    );

    let node = Arc::new(BroadcastNode::new(transport, config)?);
    node.start().context("Failed to start broadcast node")?;
    runtime.serve(node).await?;
    Ok(())
}
