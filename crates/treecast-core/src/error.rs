//! Error types for Treecast.

use thiserror::Error;

use crate::protocol::ErrorCode;
use crate::types::NodeId;

/// Failure of a single point-to-point exchange.
///
/// Every variant is recoverable by retrying; the delivery queue treats them
/// all the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No reply arrived within the RPC timeout
    #[error("RPC to {0} timed out")]
    Timeout(NodeId),

    /// The destination is not reachable (unknown node, link down)
    #[error("Node unreachable: {0}")]
    Unreachable(NodeId),

    /// The peer answered with a Maelstrom error body
    #[error("Rejected by peer: {text} (code {code})")]
    Rejected {
        /// Maelstrom error code
        code: ErrorCode,
        /// Human-readable reason
        text: String,
    },

    /// The peer answered with a body that is neither the expected reply nor an error
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(&'static str),

    /// The outbound channel or the runtime has shut down
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the peer refused the request in a way no retry will change.
    pub fn is_permanent(&self) -> bool {
        match self {
            TransportError::Rejected { code, .. } => code.is_permanent(),
            _ => false,
        }
    }
}

/// Errors building, validating, or installing a spanning tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The node list was empty
    #[error("Cannot build a topology over zero nodes")]
    NoNodes,

    /// The same node id appeared twice in the node list
    #[error("Duplicate node in node list: {0}")]
    DuplicateNode(NodeId),

    /// An assignment names a neighbor that is not a cluster member
    #[error("Unknown neighbor {neighbor} in row for {node}")]
    UnknownNeighbor {
        /// Row owner
        node: NodeId,
        /// Offending neighbor
        neighbor: NodeId,
    },

    /// A node lists itself as a neighbor
    #[error("Node {0} lists itself as a neighbor")]
    SelfLoop(NodeId),

    /// An assignment carries no row for this node
    #[error("Assignment has no row for node {0}")]
    MissingRow(NodeId),

    /// The configured coordinator is not a cluster member
    #[error("Coordinator {0} is not a cluster member")]
    UnknownCoordinator(NodeId),
}

/// Main error type for node operations.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Messaging substrate failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Topology could not be built or installed
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Protocol violation (unexpected message during handshake, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON encoding/decoding error
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using NodeError.
pub type NodeResult<T> = Result<T, NodeError>;
