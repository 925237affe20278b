//! Periodic pull reconciliation with tree neighbors.
//!
//! Push delivery can stall behind a partition or a crashed peer. The puller
//! closes that gap: every few hundred milliseconds it asks each neighbor for
//! its values and merges whatever comes back. Merging only ever adds, so a
//! pull can never undo a push.
//!
//! Each pull carries the local [`SetDigest`]. A neighbor whose set matches
//! answers with an empty list; any mismatch, including equal sizes with
//! different members, gets the full snapshot.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::protocol::Body;
use crate::store::{SetDigest, ValueStore};
use crate::topology::NeighborRow;
use crate::transport::Transport;
use crate::types::NodeId;

/// Outcome of one reconciliation round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// Neighbors that answered
    pub answered: usize,
    /// Neighbors that failed (timeout, rejection, bad reply)
    pub failed: usize,
    /// Values that were new to the local store
    pub merged: usize,
}

/// Background repair loop for one node.
pub struct AntiEntropyPuller<T> {
    transport: Arc<T>,
    store: Arc<ValueStore>,
    row: Arc<NeighborRow>,
    config: NodeConfig,
}

impl<T: Transport> AntiEntropyPuller<T> {
    /// Create a puller over shared node state.
    pub fn new(
        transport: Arc<T>,
        store: Arc<ValueStore>,
        row: Arc<NeighborRow>,
        config: NodeConfig,
    ) -> Self {
        Self {
            transport,
            store,
            row,
            config,
        }
    }

    /// Pull every neighbor once, concurrently, and merge the replies.
    pub async fn pull_once(&self) -> PullReport {
        let neighbors = self.row.neighbors();
        if neighbors.is_empty() {
            return PullReport::default();
        }

        let hint = self.store.digest();
        let results = join_all(neighbors.iter().map(|n| self.pull_from(n, hint))).await;

        let mut report = PullReport::default();
        for (neighbor, result) in neighbors.iter().zip(results) {
            match result {
                Ok(merged) => {
                    report.answered += 1;
                    report.merged += merged;
                }
                Err(e) => {
                    report.failed += 1;
                    debug!(%neighbor, error = %e, "Pull failed, skipping until next round");
                }
            }
        }
        if report.merged > 0 {
            info!(merged = report.merged, total = self.store.len(), "Anti-entropy merged values");
        }
        report
    }

    async fn pull_from(&self, neighbor: &NodeId, hint: SetDigest) -> Result<usize, TransportError> {
        let reply = self
            .transport
            .rpc(
                neighbor,
                Body::Read {
                    msg_count: Some(hint.len),
                    digest: Some(hint.hash),
                },
                self.config.rpc_timeout,
            )
            .await?;

        match reply {
            Body::ReadOk { messages, .. } => {
                trace!(%neighbor, returned = messages.len(), "Pull answered");
                Ok(self.store.observe_all(messages))
            }
            other => Err(TransportError::UnexpectedReply(other.type_name())),
        }
    }

    /// Run the repair loop for the lifetime of the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        let seed = self
            .config
            .jitter_seed
            .unwrap_or_else(|| jitter_seed_for(self.transport.node_id()));
        let mut rng = StdRng::seed_from_u64(seed);

        tokio::spawn(async move {
            debug!(seed, "Anti-entropy puller started");
            loop {
                let delay = poll_interval(&self.config, &mut rng);
                tokio::time::sleep(delay).await;
                let report = self.pull_once().await;
                if report.failed > 0 {
                    warn!(
                        failed = report.failed,
                        answered = report.answered,
                        "Some neighbors did not answer the pull"
                    );
                }
            }
        })
    }
}

/// Seed derived from the node id and the start time, so nodes drift apart.
fn jitter_seed_for(node: &NodeId) -> u64 {
    let mut hasher = DefaultHasher::new();
    node.hash(&mut hasher);
    Utc::now().timestamp_nanos_opt().unwrap_or_default().hash(&mut hasher);
    hasher.finish()
}

/// Uniform draw from `[poll_min, poll_max)`.
pub fn poll_interval<R: Rng + ?Sized>(config: &NodeConfig, rng: &mut R) -> Duration {
    let span = config.poll_max.saturating_sub(config.poll_min).as_nanos() as u64;
    if span == 0 {
        return config.poll_min;
    }
    config.poll_min + Duration::from_nanos(rng.random_range(0..span))
}
