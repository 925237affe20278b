//! Treecast Core Library.
//!
//! Fault-tolerant broadcast over a spanning tree, for Maelstrom clusters.
//!
//! ## Overview
//!
//! Every node runs the same logic. A coordinator builds a minimum spanning
//! tree over synthetic link weights and pushes it to its peers; values then
//! travel only along tree edges, which keeps fan-out low. Two mechanisms make
//! delivery survive lost messages and partitions:
//!
//! - **Reliable push**: each (value, edge) pair is a delivery job retried with
//!   exponential back-off until the neighbor acknowledges it
//! - **Anti-entropy pull**: every node periodically asks its neighbors for
//!   their values and merges anything it missed
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use treecast_core::{BroadcastNode, MaelstromRuntime, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = MaelstromRuntime::init().await?;
//!     let node = Arc::new(BroadcastNode::new(runtime.transport(), NodeConfig::default())?);
//!     node.start()?;
//!     runtime.serve(node).await?;
//!     Ok(())
//! }
//! ```

pub mod anti_entropy;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod node;
pub mod protocol;
pub mod store;
pub mod topology;
pub mod transport;
pub mod types;

// Re-exports
pub use anti_entropy::{AntiEntropyPuller, PullReport};
pub use config::NodeConfig;
pub use delivery::{AckRecord, DeliveryJob, DeliveryQueue, DeliveryStats};
pub use error::{NodeError, NodeResult, TopologyError, TransportError};
pub use node::BroadcastNode;
pub use protocol::{Body, Envelope, ErrorCode};
pub use store::{SetDigest, ValueStore};
pub use topology::{build_spanning_tree, NeighborRow, Topology};
pub use transport::{
    Handler, MaelstromRuntime, MaelstromTransport, MemoryNetwork, MemoryTransport, NetworkStats,
    Transport,
};
pub use types::*;
