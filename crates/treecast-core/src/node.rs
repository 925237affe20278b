//! Broadcast node: wires store, delivery queue, puller and topology together.
//!
//! ```text
//!  broadcast ──► ValueStore::observe ──new──► DeliveryQueue::submit (per tree edge)
//!  read      ──► ValueStore::snapshot
//!  topology  ──► NeighborRow::install
//!
//!  start() ──coordinator──► build tree ──► push topology to every peer
//!          └──────────────► AntiEntropyPuller::spawn
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::anti_entropy::AntiEntropyPuller;
use crate::config::NodeConfig;
use crate::delivery::{DeliveryJob, DeliveryQueue};
use crate::error::{NodeResult, TopologyError};
use crate::protocol::{Body, ErrorCode};
use crate::store::ValueStore;
use crate::topology::{build_spanning_tree, NeighborRow, Topology};
use crate::transport::{Handler, Transport};
use crate::types::{NodeId, Value};

/// One cluster member running the tree broadcast protocol.
pub struct BroadcastNode<T> {
    transport: Arc<T>,
    config: NodeConfig,
    store: Arc<ValueStore>,
    row: Arc<NeighborRow>,
    queue: DeliveryQueue<T>,
    puller: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> BroadcastNode<T> {
    /// Create a node; must be called inside a tokio runtime.
    pub fn new(transport: Arc<T>, config: NodeConfig) -> NodeResult<Self> {
        config.validate()?;
        let queue = DeliveryQueue::start(transport.clone(), config.clone());
        Ok(Self {
            transport,
            config,
            store: Arc::new(ValueStore::new()),
            row: Arc::new(NeighborRow::new()),
            queue,
            puller: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        self.transport.node_id()
    }

    pub fn store(&self) -> &Arc<ValueStore> {
        &self.store
    }

    pub fn row(&self) -> &Arc<NeighborRow> {
        &self.row
    }

    pub fn queue(&self) -> &DeliveryQueue<T> {
        &self.queue
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Node responsible for building and distributing the tree.
    ///
    /// The configured coordinator if any, otherwise the first cluster member.
    pub fn coordinator(&self) -> Result<NodeId, TopologyError> {
        let members = self.transport.node_ids();
        match &self.config.coordinator {
            Some(c) if members.contains(c) => Ok(c.clone()),
            Some(c) => Err(TopologyError::UnknownCoordinator(c.clone())),
            None => members.first().cloned().ok_or(TopologyError::NoNodes),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator().is_ok_and(|c| &c == self.node_id())
    }

    /// Distribute the topology (coordinator only) and start the puller.
    ///
    /// Calling it twice does nothing the second time.
    pub fn start(&self) -> NodeResult<()> {
        let mut puller = self.puller.lock();
        if puller.is_some() {
            return Ok(());
        }

        if self.coordinator()? == *self.node_id() {
            self.distribute_topology()?;
        }

        *puller = Some(
            AntiEntropyPuller::new(
                self.transport.clone(),
                self.store.clone(),
                self.row.clone(),
                self.config.clone(),
            )
            .spawn(),
        );
        info!(node = %self.node_id(), "Broadcast node started");
        Ok(())
    }

    fn distribute_topology(&self) -> Result<(), TopologyError> {
        let members = self.transport.node_ids();
        let mut rng = match self.config.topology_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let tree = build_spanning_tree(members, &mut rng)?;
        let own = tree.row_for(self.node_id(), members)?;
        info!(
            edges = tree.edges().len(),
            max_degree = tree.max_degree(),
            neighbors = ?own,
            "Built spanning tree"
        );
        self.row.install(own);

        let rows = tree.into_rows();
        for peer in members.iter().filter(|m| *m != self.node_id()) {
            tokio::spawn(push_topology(
                self.transport.clone(),
                self.config.clone(),
                peer.clone(),
                rows.clone(),
            ));
        }
        Ok(())
    }

    fn on_broadcast(&self, src: &NodeId, value: Value) -> Body {
        if self.store.observe(value) {
            let me = self.node_id();
            let targets: Vec<NodeId> = self
                .row
                .neighbors()
                .into_iter()
                .filter(|n| n != src)
                .collect();
            debug!(%value, %src, from_client = src.is_client(), fanout = targets.len(), "New value");
            for dest in targets {
                self.queue.submit(DeliveryJob::new(me.clone(), dest, value));
            }
        } else {
            debug!(%value, %src, "Duplicate value");
        }
        Body::BroadcastOk
    }

    /// Answer a read; a peer whose size and digest match ours gets no values.
    fn on_read(&self, msg_count: Option<usize>, digest: Option<u64>) -> Body {
        let Some(count) = msg_count else {
            return Body::ReadOk {
                messages: self.store.snapshot(),
                msg_count: None,
            };
        };

        let local = self.store.digest();
        if count == local.len && digest == Some(local.hash) {
            return Body::ReadOk {
                messages: Vec::new(),
                msg_count: Some(local.len),
            };
        }
        let messages = self.store.snapshot();
        let count = messages.len();
        Body::ReadOk {
            messages,
            msg_count: Some(count),
        }
    }

    fn on_topology(
        &self,
        src: &NodeId,
        rows: BTreeMap<NodeId, Vec<NodeId>>,
        source: Option<NodeId>,
    ) -> Body {
        if source.is_none() && !self.config.accept_client_topology {
            debug!(%src, "Ignoring client-supplied topology");
            return Body::TopologyOk;
        }

        match Topology::from_rows(rows).row_for(self.node_id(), self.transport.node_ids()) {
            Ok(row) => {
                info!(%src, neighbors = ?row, "Installed neighbor row");
                self.row.install(row);
                Body::TopologyOk
            }
            Err(e) => {
                error!(%src, error = %e, "Rejected topology assignment, row stays unassigned");
                Body::error(ErrorCode::MalformedRequest, e.to_string())
            }
        }
    }
}

impl<T: Transport> Handler for BroadcastNode<T> {
    async fn handle(&self, src: NodeId, body: Body) -> Option<Body> {
        let reply = match body {
            Body::Broadcast { message } => self.on_broadcast(&src, message),
            Body::Read { msg_count, digest } => self.on_read(msg_count, digest),
            Body::Topology { topology, source } => self.on_topology(&src, topology, source),
            Body::Init { .. } => {
                warn!(%src, "Duplicate init");
                Body::error(ErrorCode::MalformedRequest, "node is already initialised")
            }
            stray @ (Body::InitOk
            | Body::BroadcastOk
            | Body::ReadOk { .. }
            | Body::TopologyOk
            | Body::Error { .. }) => {
                debug!(%src, kind = stray.type_name(), "Dropping uncorrelated reply");
                return None;
            }
        };
        Some(reply)
    }
}

/// Push the tree to one peer until it accepts or refuses for good.
async fn push_topology<T: Transport>(
    transport: Arc<T>,
    config: NodeConfig,
    peer: NodeId,
    rows: BTreeMap<NodeId, Vec<NodeId>>,
) {
    let source = transport.node_id().clone();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let body = Body::Topology {
            topology: rows.clone(),
            source: Some(source.clone()),
        };
        match transport.rpc(&peer, body, config.rpc_timeout).await {
            Ok(Body::TopologyOk) => {
                debug!(%peer, attempt, "Topology acknowledged");
                return;
            }
            Ok(other) => {
                warn!(%peer, attempt, reply = other.type_name(), "Unexpected reply to topology push");
            }
            Err(e) if e.is_permanent() => {
                error!(%peer, error = %e, "Peer refused topology, giving up");
                return;
            }
            Err(e) => {
                warn!(%peer, attempt, error = %e, "Topology push failed, retrying");
            }
        }
        tokio::time::sleep(config.backoff(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport};

    type Node = Arc<BroadcastNode<MemoryTransport>>;

    fn ids(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("n{i}"))).collect()
    }

    fn cluster(n: usize, config: NodeConfig) -> (MemoryNetwork, Vec<Node>) {
        let net = MemoryNetwork::new(ids(n), 42);
        let nodes = ids(n)
            .iter()
            .map(|id| {
                let node = Arc::new(
                    BroadcastNode::new(Arc::new(net.transport(id)), config.clone()).unwrap(),
                );
                net.register(id, node.clone());
                node
            })
            .collect();
        (net, nodes)
    }

    fn row(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|s| NodeId::from(*s)).collect()
    }

    /// Install the tree n0 - n1 - n2 on every node.
    fn line(nodes: &[Node]) {
        let mut tree = BTreeMap::new();
        tree.insert(NodeId::from("n0"), row(&["n1"]));
        tree.insert(NodeId::from("n1"), row(&["n0", "n2"]));
        tree.insert(NodeId::from("n2"), row(&["n1"]));
        for node in nodes {
            let reply = node.on_topology(&NodeId::from("n0"), tree.clone(), Some(NodeId::from("n0")));
            assert_eq!(reply, Body::TopologyOk);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_skips_sender_and_dedups() {
        let (_net, nodes) = cluster(3, NodeConfig::default());
        line(&nodes);
        let n1 = &nodes[1];

        let reply = n1.handle(NodeId::from("n0"), Body::Broadcast { message: Value(42) }).await;
        assert_eq!(reply, Some(Body::BroadcastOk));
        let reply = n1.handle(NodeId::from("n2"), Body::Broadcast { message: Value(42) }).await;
        assert_eq!(reply, Some(Body::BroadcastOk));

        // one job, towards n2 only
        assert_eq!(n1.queue().stats().submitted, 1);
        let job = DeliveryJob::new(NodeId::from("n1"), NodeId::from("n2"), Value(42));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(n1.queue().is_acked(&job));
        assert!(nodes[2].store().contains(&Value(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_hint_semantics() {
        let (_net, nodes) = cluster(1, NodeConfig::default());
        let node = &nodes[0];
        node.store().observe_all([Value(1), Value(2)]);
        let all = vec![Value(1), Value(2)];
        let read = |msg_count, digest| Body::Read { msg_count, digest };

        let client = node.handle(NodeId::from("c1"), read(None, None)).await;
        assert_eq!(client, Some(Body::ReadOk { messages: all.clone(), msg_count: None }));

        let same = node.store().digest();
        let satisfied = node.handle(NodeId::from("n1"), read(Some(2), Some(same.hash))).await;
        assert_eq!(satisfied, Some(Body::ReadOk { messages: vec![], msg_count: Some(2) }));

        // same size, different members
        let other = ValueStore::new();
        other.observe_all([Value(1), Value(3)]);
        let differs = node
            .handle(NodeId::from("n1"), read(Some(2), Some(other.digest().hash)))
            .await;
        assert_eq!(differs, Some(Body::ReadOk { messages: all.clone(), msg_count: Some(2) }));

        // size alone never satisfies the hint
        let sized = node.handle(NodeId::from("n1"), read(Some(2), None)).await;
        assert_eq!(sized, Some(Body::ReadOk { messages: all.clone(), msg_count: Some(2) }));

        let ahead = node.handle(NodeId::from("n1"), read(Some(5), Some(same.hash))).await;
        assert_eq!(ahead, Some(Body::ReadOk { messages: all, msg_count: Some(2) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_topology_ignored_unless_enabled() {
        let mut grid = BTreeMap::new();
        grid.insert(NodeId::from("n0"), vec![NodeId::from("n1")]);
        grid.insert(NodeId::from("n1"), vec![NodeId::from("n0")]);

        let (_net, nodes) = cluster(2, NodeConfig::default());
        let reply = nodes[0]
            .handle(NodeId::from("c1"), Body::Topology { topology: grid.clone(), source: None })
            .await;
        assert_eq!(reply, Some(Body::TopologyOk));
        assert!(!nodes[0].row().is_assigned());

        let config = NodeConfig { accept_client_topology: true, ..NodeConfig::default() };
        let (_net, nodes) = cluster(2, config);
        nodes[0]
            .handle(NodeId::from("c1"), Body::Topology { topology: grid, source: None })
            .await;
        assert_eq!(nodes[0].row().neighbors(), vec![NodeId::from("n1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_assignment_is_rejected() {
        let (_net, nodes) = cluster(2, NodeConfig::default());
        let mut bad = BTreeMap::new();
        bad.insert(NodeId::from("n0"), vec![NodeId::from("n7")]);

        let reply = nodes[0]
            .handle(NodeId::from("n1"), Body::Topology { topology: bad, source: Some(NodeId::from("n1")) })
            .await;

        assert!(matches!(
            reply,
            Some(Body::Error { code: ErrorCode::MalformedRequest, .. })
        ));
        assert!(!nodes[0].row().is_assigned());

        // still serves clients, but forwards nothing until a valid row arrives
        let reply = nodes[0].handle(NodeId::from("c1"), Body::Broadcast { message: Value(4) }).await;
        assert_eq!(reply, Some(Body::BroadcastOk));
        assert!(nodes[0].store().contains(&Value(4)));
        assert_eq!(nodes[0].queue().stats().submitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_distributes_a_spanning_tree() {
        let config = NodeConfig { topology_seed: Some(9), ..NodeConfig::default() };
        let (_net, nodes) = cluster(5, config);
        for node in &nodes {
            node.start().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let rows: BTreeMap<NodeId, Vec<NodeId>> = nodes
            .iter()
            .map(|n| (n.node_id().clone(), n.row().neighbors()))
            .collect();
        assert!(nodes.iter().all(|n| n.row().is_assigned()));
        assert!(Topology::from_rows(rows).is_spanning_tree(&ids(5)));
        assert!(nodes[0].is_coordinator());
        assert!(!nodes[1].is_coordinator());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_coordinator_fails_start() {
        let config = NodeConfig { coordinator: Some(NodeId::from("n9")), ..NodeConfig::default() };
        let (_net, nodes) = cluster(2, config);
        let err = nodes[0].start().unwrap_err();
        assert!(err.to_string().contains("n9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncorrelated_replies_get_no_answer() {
        let (_net, nodes) = cluster(1, NodeConfig::default());
        assert_eq!(nodes[0].handle(NodeId::from("n1"), Body::BroadcastOk).await, None);
        let init = Body::Init { node_id: NodeId::from("n0"), node_ids: ids(1) };
        assert!(matches!(
            nodes[0].handle(NodeId::from("c0"), init).await,
            Some(Body::Error { .. })
        ));
    }
}
