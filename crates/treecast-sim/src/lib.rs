//! Whole-cluster simulation on the in-memory network.
//!
//! Runs N broadcast nodes in one process, injects message loss and an
//! optional partition, broadcasts a batch of values and reports whether (and
//! when) every node converged. Meant to run on a paused tokio clock, so
//! minutes of simulated time pass in milliseconds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use treecast_core::{
    Body, BroadcastNode, DeliveryStats, MemoryNetwork, MemoryTransport, NetworkStats, NodeConfig,
    NodeError, NodeId, NodeResult, Topology, Value,
};

/// Cut one node off from every other node for a while.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionPlan {
    /// Index of the isolated node
    pub isolate: usize,
    /// Offset from the first broadcast
    pub from: Duration,
    /// Offset from the first broadcast
    pub until: Duration,
}

/// Parameters of one simulation run.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub nodes: usize,
    pub values: usize,
    /// Probability that any single message is lost
    pub loss: f64,
    /// Seeds the network, the broadcast targets and (unless set) the node config
    pub seed: u64,
    /// Gap between consecutive client broadcasts
    pub broadcast_interval: Duration,
    pub partition: Option<PartitionPlan>,
    /// Give up waiting for convergence after this long
    pub time_limit: Duration,
    pub config: NodeConfig,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            nodes: 5,
            values: 50,
            loss: 0.0,
            seed: 0,
            broadcast_interval: Duration::from_millis(10),
            partition: None,
            time_limit: Duration::from_secs(120),
            config: NodeConfig::default(),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub nodes: usize,
    pub values: usize,
    pub converged: bool,
    /// Simulated time from the first broadcast to full convergence
    pub converged_after_ms: Option<u64>,
    /// Edges of the distributed tree
    pub tree_edges: usize,
    pub tree_max_degree: usize,
    /// Values each node is still missing (only nodes missing some)
    pub missing: BTreeMap<NodeId, usize>,
    pub network: NetworkStats,
    /// Delivery counters summed over all nodes
    pub delivery: DeliveryStats,
    /// Messages sent per broadcast value
    pub messages_per_value: f64,
}

type Node = Arc<BroadcastNode<MemoryTransport>>;

/// Run a scenario to completion or to its time limit.
///
/// Fails before starting anything if the scenario has no nodes.
pub async fn run(scenario: &Scenario) -> NodeResult<SimReport> {
    if scenario.nodes == 0 {
        return Err(NodeError::Config("scenario needs at least one node".into()));
    }
    let ids: Vec<NodeId> = (0..scenario.nodes)
        .map(|i| NodeId::new(format!("n{i}")))
        .collect();
    let net = MemoryNetwork::new(ids.clone(), scenario.seed);

    let mut config = scenario.config.clone();
    config.topology_seed = config.topology_seed.or(Some(scenario.seed));
    config.jitter_seed = config.jitter_seed.or(Some(scenario.seed));

    let mut nodes: Vec<Node> = Vec::with_capacity(ids.len());
    for id in &ids {
        let node = Arc::new(BroadcastNode::new(Arc::new(net.transport(id)), config.clone())?);
        net.register(id, node.clone());
        nodes.push(node);
    }

    net.set_loss(scenario.loss);
    for node in &nodes {
        node.start()?;
    }

    let deadline = Instant::now() + scenario.time_limit;
    if !wait_until(deadline, || nodes.iter().all(|n| n.row().is_assigned())).await {
        warn!("Topology did not reach every node before the time limit");
    }
    let tree = Topology::from_rows(
        nodes
            .iter()
            .map(|n| (n.node_id().clone(), n.row().neighbors()))
            .collect(),
    );
    info!(
        edges = tree.edges().len(),
        max_degree = tree.max_degree(),
        spanning = tree.is_spanning_tree(&ids),
        "Topology installed"
    );

    let started = Instant::now();
    if let Some(plan) = scenario.partition.clone() {
        tokio::spawn(run_partition(net.clone(), ids.clone(), plan));
    }

    let mut rng = StdRng::seed_from_u64(scenario.seed);
    for v in 0..scenario.values {
        let target = &ids[rng.random_range(0..ids.len())];
        let reply = net
            .client_request(target, Body::Broadcast { message: Value(v as i64) })
            .await;
        if reply != Some(Body::BroadcastOk) {
            warn!(%target, value = v, ?reply, "Broadcast not acknowledged");
        }
        tokio::time::sleep(scenario.broadcast_interval).await;
    }

    let deadline = started + scenario.time_limit;
    let converged = wait_until(deadline, || {
        nodes.iter().all(|n| n.store().len() == scenario.values)
    })
    .await;
    let converged_after_ms = converged.then(|| started.elapsed().as_millis() as u64);

    let missing = nodes
        .iter()
        .filter_map(|n| {
            let gap = scenario.values.saturating_sub(n.store().len());
            (gap > 0).then(|| (n.node_id().clone(), gap))
        })
        .collect();

    let delivery = nodes
        .iter()
        .map(|n| n.queue().stats())
        .fold(DeliveryStats::default(), |acc, s| DeliveryStats {
            submitted: acc.submitted + s.submitted,
            skipped: acc.skipped + s.skipped,
            attempts: acc.attempts + s.attempts,
            retries: acc.retries + s.retries,
            acknowledged: acc.acknowledged + s.acknowledged,
            dead_lettered: acc.dead_lettered + s.dead_lettered,
        });

    let network = net.stats();
    Ok(SimReport {
        nodes: scenario.nodes,
        values: scenario.values,
        converged,
        converged_after_ms,
        tree_edges: tree.edges().len(),
        tree_max_degree: tree.max_degree(),
        missing,
        network,
        delivery,
        messages_per_value: if scenario.values == 0 {
            0.0
        } else {
            network.sent as f64 / scenario.values as f64
        },
    })
}

async fn run_partition(net: MemoryNetwork, ids: Vec<NodeId>, plan: PartitionPlan) {
    let Some(isolated) = ids.get(plan.isolate) else {
        warn!(index = plan.isolate, "Partition target out of range, skipping");
        return;
    };
    tokio::time::sleep(plan.from).await;
    info!(node = %isolated, "Isolating node");
    for other in ids.iter().filter(|id| *id != isolated) {
        net.partition(isolated, other);
    }
    tokio::time::sleep(plan.until.saturating_sub(plan.from)).await;
    info!(node = %isolated, "Healing partition");
    net.heal_all();
}

/// Poll every 100ms until `cond` holds or the deadline passes.
async fn wait_until(deadline: Instant, cond: impl Fn() -> bool) -> bool {
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cond()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lossless_cluster_converges() {
        let report = run(&Scenario {
            nodes: 4,
            values: 10,
            ..Scenario::default()
        })
        .await
        .unwrap();

        assert!(report.converged, "{report:?}");
        assert!(report.missing.is_empty());
        assert_eq!(report.tree_edges, 3);
        assert_eq!(report.network.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_node_catches_up_after_heal() {
        let report = run(&Scenario {
            nodes: 5,
            values: 20,
            loss: 0.1,
            seed: 4,
            partition: Some(PartitionPlan {
                isolate: 2,
                from: Duration::ZERO,
                until: Duration::from_secs(5),
            }),
            ..Scenario::default()
        })
        .await
        .unwrap();

        assert!(report.converged, "{report:?}");
        assert!(report.converged_after_ms.unwrap() >= 5000);
        assert!(report.delivery.retries > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_cluster_is_rejected() {
        let err = run(&Scenario {
            nodes: 0,
            ..Scenario::default()
        })
        .await
        .unwrap_err();

        assert!(matches!(err, NodeError::Config(_)), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_reports_missing_values() {
        let report = run(&Scenario {
            nodes: 3,
            values: 5,
            partition: Some(PartitionPlan {
                isolate: 1,
                from: Duration::ZERO,
                until: Duration::from_secs(600),
            }),
            time_limit: Duration::from_secs(10),
            ..Scenario::default()
        })
        .await
        .unwrap();

        assert!(!report.converged);
        assert!(!report.missing.is_empty());
    }
}
