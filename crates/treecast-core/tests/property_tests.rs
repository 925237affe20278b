//! Property-based tests for topology, store and convergence.
//!
//! Uses proptest to check the invariants the broadcast layer relies on.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use treecast_core::{
    build_spanning_tree, Body, BroadcastNode, MemoryNetwork, NodeConfig, NodeId, Value, ValueStore,
};

// ============================================================================
// Strategy Generators
// ============================================================================

fn node_ids(n: usize) -> Vec<NodeId> {
    (0..n).map(|i| NodeId::new(format!("n{i}"))).collect()
}

/// Batches of values with plenty of repeats.
fn value_batches() -> impl Strategy<Value = Vec<Vec<i64>>> {
    prop::collection::vec(prop::collection::vec(-20i64..20, 0..30), 0..10)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Any node count and seed yields a symmetric spanning tree.
    #[test]
    fn spanning_tree_is_valid(n in 2usize..40, seed in any::<u64>()) {
        let nodes = node_ids(n);
        let tree = build_spanning_tree(&nodes, &mut StdRng::seed_from_u64(seed)).unwrap();

        prop_assert!(tree.is_spanning_tree(&nodes));
        prop_assert_eq!(tree.edges().len(), n - 1);
        for node in &nodes {
            prop_assert!(!tree.neighbors(node).is_empty());
            for peer in tree.neighbors(node) {
                prop_assert!(tree.neighbors(peer).contains(node));
            }
        }
    }

    /// Same seed, same tree.
    #[test]
    fn spanning_tree_is_reproducible(n in 1usize..20, seed in any::<u64>()) {
        let nodes = node_ids(n);
        let a = build_spanning_tree(&nodes, &mut StdRng::seed_from_u64(seed)).unwrap();
        let b = build_spanning_tree(&nodes, &mut StdRng::seed_from_u64(seed)).unwrap();
        prop_assert_eq!(a, b);
    }

    /// observe reports each distinct value exactly once.
    #[test]
    fn observe_is_idempotent(values in prop::collection::vec(any::<i64>(), 0..200)) {
        let store = ValueStore::new();
        let firsts = values.iter().filter(|v| store.observe(Value(**v))).count();
        let distinct: BTreeSet<i64> = values.iter().copied().collect();

        prop_assert_eq!(firsts, distinct.len());
        prop_assert_eq!(
            store.snapshot(),
            distinct.into_iter().map(Value).collect::<Vec<_>>()
        );
    }

    /// Merging never removes a value nor shrinks the store.
    #[test]
    fn merge_is_monotonic(batches in value_batches()) {
        let store = ValueStore::new();
        let mut seen = HashSet::new();
        for batch in batches {
            let before = store.len();
            let added = store.observe_all(batch.iter().copied().map(Value));
            seen.extend(batch);

            prop_assert_eq!(store.len(), before + added);
            prop_assert!(seen.iter().all(|v| store.contains(&Value(*v))));
        }
    }

    /// Back-off never decreases and never exceeds the cap.
    #[test]
    fn backoff_is_bounded(base_ms in 1u64..500, extra_ms in 0u64..5000) {
        let config = NodeConfig {
            retry_base: Duration::from_millis(base_ms),
            retry_max: Duration::from_millis(base_ms + extra_ms),
            ..NodeConfig::default()
        };
        let mut prev = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = config.backoff(attempt);
            prop_assert!(delay >= prev);
            prop_assert!(delay <= config.retry_max);
            prev = delay;
        }
        prop_assert_eq!(config.backoff(1), config.retry_base);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Every node ends up with every value despite random loss.
    #[test]
    fn cluster_converges_under_loss(
        n in 2usize..7,
        seed in any::<u64>(),
        loss in 0.0f64..0.4,
        values in prop::collection::btree_set(0i64..1000, 1..12),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let stores = runtime.block_on(async {
            let nodes = node_ids(n);
            let net = MemoryNetwork::new(nodes.clone(), seed);
            let config = NodeConfig {
                topology_seed: Some(seed),
                jitter_seed: Some(seed),
                ..NodeConfig::default()
            };
            let members: Vec<_> = nodes
                .iter()
                .map(|id| {
                    let node = Arc::new(
                        BroadcastNode::new(Arc::new(net.transport(id)), config.clone()).unwrap(),
                    );
                    net.register(id, node.clone());
                    node
                })
                .collect();
            net.set_loss(loss);
            for node in &members {
                node.start().unwrap();
            }
            while !members.iter().all(|m| m.row().is_assigned()) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            for (i, v) in values.iter().enumerate() {
                net.client_request(&nodes[i % n], Body::Broadcast { message: Value(*v) })
                    .await;
            }
            for _ in 0..6000 {
                if members.iter().all(|m| m.store().len() == values.len()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            members.iter().map(|m| m.store().snapshot()).collect::<Vec<_>>()
        });

        let expected: Vec<Value> = values.iter().copied().map(Value).collect();
        for store in stores {
            prop_assert_eq!(&store, &expected);
        }
    }
}
