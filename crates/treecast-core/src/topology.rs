//! Spanning-tree topology builder.
//!
//! The coordinator turns the all-to-all link graph into a tree so that each
//! node only forwards a new value to its tree neighbors, instead of to every
//! other member.
//!
//! Edge weights are synthetic: every unordered pair gets an independent
//! uniform weight in `MIN_WEIGHT..=MAX_WEIGHT`, and Prim's algorithm picks
//! the minimum spanning tree over them. The result is effectively a random
//! spanning tree. It bounds fan-out but does not reflect link latency;
//! measured weights can be passed to [`prim`] unchanged.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::types::NodeId;

/// Smallest synthetic edge weight.
pub const MIN_WEIGHT: u32 = 1;
/// Largest synthetic edge weight.
pub const MAX_WEIGHT: u32 = 100;

/// Neighbor rows for every node of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology {
    rows: BTreeMap<NodeId, Vec<NodeId>>,
}

impl Topology {
    /// Wrap existing rows (e.g. received from the wire).
    pub fn from_rows(rows: BTreeMap<NodeId, Vec<NodeId>>) -> Self {
        Self { rows }
    }

    /// Consume into the raw rows.
    pub fn into_rows(self) -> BTreeMap<NodeId, Vec<NodeId>> {
        self.rows
    }

    /// Neighbors of one node; empty if the node has no row.
    pub fn neighbors(&self, node: &NodeId) -> &[NodeId] {
        self.rows.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Undirected edges, each normalised as `(smaller, larger)`.
    pub fn edges(&self) -> BTreeSet<(NodeId, NodeId)> {
        self.rows
            .iter()
            .flat_map(|(node, row)| {
                row.iter().map(move |peer| {
                    if node <= peer {
                        (node.clone(), peer.clone())
                    } else {
                        (peer.clone(), node.clone())
                    }
                })
            })
            .collect()
    }

    /// Largest row length.
    pub fn max_degree(&self) -> usize {
        self.rows.values().map(Vec::len).max().unwrap_or(0)
    }

    /// Whether the rows form an undirected spanning tree over `nodes`.
    ///
    /// Checks symmetry, absence of self loops and unknown members, exactly
    /// `N-1` edges, and connectivity (which together imply acyclicity).
    pub fn is_spanning_tree(&self, nodes: &[NodeId]) -> bool {
        let members: HashSet<&NodeId> = nodes.iter().collect();
        if members.is_empty() || members.len() != nodes.len() {
            return false;
        }

        for (node, row) in &self.rows {
            if !members.contains(node) {
                return false;
            }
            let mut seen = HashSet::new();
            for peer in row {
                if peer == node || !members.contains(peer) || !seen.insert(peer) {
                    return false;
                }
                if !self.neighbors(peer).contains(node) {
                    return false;
                }
            }
        }

        if self.edges().len() != nodes.len() - 1 {
            return false;
        }

        let mut visited: HashSet<&NodeId> = HashSet::new();
        let mut queue = VecDeque::from([&nodes[0]]);
        visited.insert(&nodes[0]);
        while let Some(node) = queue.pop_front() {
            for peer in self.neighbors(node) {
                if visited.insert(peer) {
                    queue.push_back(peer);
                }
            }
        }
        visited.len() == nodes.len()
    }

    /// Extract and check the row assigned to `node`.
    ///
    /// Every neighbor must be a member and differ from `node`. Duplicates are
    /// dropped, order is preserved.
    pub fn row_for(&self, node: &NodeId, members: &[NodeId]) -> Result<Vec<NodeId>, TopologyError> {
        let row = self
            .rows
            .get(node)
            .ok_or_else(|| TopologyError::MissingRow(node.clone()))?;

        let mut out: Vec<NodeId> = Vec::with_capacity(row.len());
        for peer in row {
            if peer == node {
                return Err(TopologyError::SelfLoop(node.clone()));
            }
            if !members.contains(peer) {
                return Err(TopologyError::UnknownNeighbor {
                    node: node.clone(),
                    neighbor: peer.clone(),
                });
            }
            if !out.contains(peer) {
                out.push(peer.clone());
            }
        }
        Ok(out)
    }
}

/// Draw a symmetric weight matrix for the complete graph over `n` nodes.
///
/// The diagonal is zero (no self loops).
pub fn random_weights<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<Vec<u32>> {
    let mut weights = vec![vec![0u32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let w = rng.random_range(MIN_WEIGHT..=MAX_WEIGHT);
            weights[i][j] = w;
            weights[j][i] = w;
        }
    }
    weights
}

/// Prim's algorithm over a dense weight matrix, starting from node 0.
///
/// A zero off-diagonal weight means "no edge". Ties are broken by the lowest
/// node index, so the result is a pure function of `weights`. Nodes that
/// cannot be reached stay out of the tree.
pub fn prim(nodes: &[NodeId], weights: &[Vec<u32>]) -> Topology {
    let n = nodes.len();
    let mut rows: BTreeMap<NodeId, Vec<NodeId>> =
        nodes.iter().map(|node| (node.clone(), Vec::new())).collect();
    if n == 0 {
        return Topology { rows };
    }

    let mut in_tree = vec![false; n];
    let mut key = vec![u32::MAX; n];
    let mut parent: Vec<Option<usize>> = vec![None; n];
    key[0] = 0;

    for _ in 0..n {
        let mut u = None;
        for v in 0..n {
            if !in_tree[v] && key[v] != u32::MAX && u.map_or(true, |best: usize| key[v] < key[best]) {
                u = Some(v);
            }
        }
        let Some(u) = u else { break };
        in_tree[u] = true;

        for v in 0..n {
            let w = weights[u][v];
            if w != 0 && !in_tree[v] && w < key[v] {
                key[v] = w;
                parent[v] = Some(u);
            }
        }
    }

    for (child, p) in parent.iter().enumerate() {
        if let Some(p) = *p {
            if let Some(row) = rows.get_mut(&nodes[p]) {
                row.push(nodes[child].clone());
            }
            if let Some(row) = rows.get_mut(&nodes[child]) {
                row.push(nodes[p].clone());
            }
        }
    }

    Topology { rows }
}

/// Build a spanning tree over `nodes` with synthetic random weights.
pub fn build_spanning_tree<R: Rng + ?Sized>(
    nodes: &[NodeId],
    rng: &mut R,
) -> Result<Topology, TopologyError> {
    if nodes.is_empty() {
        return Err(TopologyError::NoNodes);
    }
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node) {
            return Err(TopologyError::DuplicateNode(node.clone()));
        }
    }

    let weights = random_weights(nodes.len(), rng);
    Ok(prim(nodes, &weights))
}

/// The local node's neighbor row, shared between handlers and background tasks.
///
/// Written when an assignment arrives, read on every fan-out and pull.
#[derive(Debug, Default)]
pub struct NeighborRow {
    row: RwLock<Option<Vec<NodeId>>>,
}

impl NeighborRow {
    /// An unassigned row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the row.
    pub fn install(&self, row: Vec<NodeId>) {
        *self.row.write() = Some(row);
    }

    /// Current neighbors; empty until an assignment arrives.
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.row.read().clone().unwrap_or_default()
    }

    /// Whether an assignment has been installed.
    pub fn is_assigned(&self) -> bool {
        self.row.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ids(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("n{}", i))).collect()
    }

    #[test]
    fn test_prim_picks_cheapest_edges() {
        let nodes = ids(3);
        // n0-n1: 5, n0-n2: 1, n1-n2: 2  =>  tree n0-n2, n2-n1
        let weights = vec![vec![0, 5, 1], vec![5, 0, 2], vec![1, 2, 0]];
        let tree = prim(&nodes, &weights);

        assert_eq!(tree.neighbors(&nodes[0]), &[nodes[2].clone()]);
        assert_eq!(tree.neighbors(&nodes[1]), &[nodes[2].clone()]);
        assert_eq!(tree.neighbors(&nodes[2]), &[nodes[1].clone(), nodes[0].clone()]);
        assert!(tree.is_spanning_tree(&nodes));
    }

    #[test]
    fn test_prim_breaks_ties_by_lowest_index() {
        let nodes = ids(3);
        let weights = vec![vec![0, 7, 7], vec![7, 0, 7], vec![7, 7, 0]];
        let tree = prim(&nodes, &weights);

        // Equal keys: n1 joins first and claims nothing cheaper, so both hang off n0
        assert_eq!(tree.neighbors(&nodes[0]), &[nodes[1].clone(), nodes[2].clone()]);
        assert_eq!(tree.edges().len(), 2);
    }

    #[test]
    fn test_single_node_tree_has_empty_row() {
        let nodes = ids(1);
        let tree = build_spanning_tree(&nodes, &mut StdRng::seed_from_u64(1)).unwrap();
        assert!(tree.neighbors(&nodes[0]).is_empty());
        assert!(tree.is_spanning_tree(&nodes));
    }

    #[test]
    fn test_same_seed_same_tree() {
        let nodes = ids(25);
        let a = build_spanning_tree(&nodes, &mut StdRng::seed_from_u64(99)).unwrap();
        let b = build_spanning_tree(&nodes, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a, b);
        assert!(a.is_spanning_tree(&nodes));
    }

    #[test]
    fn test_weights_are_symmetric_and_in_range() {
        let weights = random_weights(6, &mut StdRng::seed_from_u64(3));
        for i in 0..6 {
            assert_eq!(weights[i][i], 0);
            for j in 0..6 {
                assert_eq!(weights[i][j], weights[j][i]);
                if i != j {
                    assert!((MIN_WEIGHT..=MAX_WEIGHT).contains(&weights[i][j]));
                }
            }
        }
    }

    #[test]
    fn test_builder_rejects_bad_node_lists() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(build_spanning_tree(&[], &mut rng), Err(TopologyError::NoNodes));

        let dup = vec![NodeId::from("n0"), NodeId::from("n0")];
        assert_eq!(
            build_spanning_tree(&dup, &mut rng),
            Err(TopologyError::DuplicateNode(NodeId::from("n0")))
        );
    }

    #[test]
    fn test_cycle_is_not_a_spanning_tree() {
        let nodes = ids(3);
        let rows = BTreeMap::from([
            (nodes[0].clone(), vec![nodes[1].clone(), nodes[2].clone()]),
            (nodes[1].clone(), vec![nodes[0].clone(), nodes[2].clone()]),
            (nodes[2].clone(), vec![nodes[0].clone(), nodes[1].clone()]),
        ]);
        assert!(!Topology::from_rows(rows).is_spanning_tree(&nodes));
    }

    #[test]
    fn test_one_sided_edge_is_not_a_spanning_tree() {
        let nodes = ids(2);
        let rows = BTreeMap::from([
            (nodes[0].clone(), vec![nodes[1].clone()]),
            (nodes[1].clone(), vec![]),
        ]);
        assert!(!Topology::from_rows(rows).is_spanning_tree(&nodes));
    }

    #[test]
    fn test_row_for_validates_assignment() {
        let nodes = ids(3);
        let rows = BTreeMap::from([
            (nodes[0].clone(), vec![nodes[1].clone(), nodes[1].clone()]),
            (nodes[1].clone(), vec![NodeId::from("n9")]),
            (nodes[2].clone(), vec![nodes[2].clone()]),
        ]);
        let topo = Topology::from_rows(rows);

        assert_eq!(topo.row_for(&nodes[0], &nodes).unwrap(), vec![nodes[1].clone()]);
        assert!(matches!(
            topo.row_for(&nodes[1], &nodes),
            Err(TopologyError::UnknownNeighbor { .. })
        ));
        assert_eq!(
            topo.row_for(&nodes[2], &nodes),
            Err(TopologyError::SelfLoop(nodes[2].clone()))
        );
        assert_eq!(
            topo.row_for(&NodeId::from("n7"), &nodes),
            Err(TopologyError::MissingRow(NodeId::from("n7")))
        );
    }

    #[test]
    fn test_neighbor_row_starts_unassigned() {
        let row = NeighborRow::new();
        assert!(!row.is_assigned());
        assert!(row.neighbors().is_empty());

        row.install(vec![NodeId::from("n1")]);
        assert!(row.is_assigned());
        assert_eq!(row.neighbors(), vec![NodeId::from("n1")]);
    }
}
