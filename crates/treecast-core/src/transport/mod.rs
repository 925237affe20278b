//! Messaging substrate consumed by the broadcast layer.
//!
//! The core never touches sockets or stdio itself. It talks to peers through
//! [`Transport`] and receives requests through [`Handler`]. Two substrates
//! implement both sides:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │  maelstrom                   │   │  memory                      │
//! │  ├── stdin reader task       │   │  ├── handler per node        │
//! │  ├── stdout writer task      │   │  ├── link up/down per pair   │
//! │  └── msg_id correlation      │   │  └── seeded random loss      │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```

pub mod maelstrom;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;
use crate::protocol::Body;
use crate::types::NodeId;

pub use maelstrom::{MaelstromRuntime, MaelstromTransport};
pub use memory::{MemoryNetwork, MemoryTransport, NetworkStats};

/// Outbound side of the messaging substrate.
pub trait Transport: Send + Sync + 'static {
    /// Our own node id.
    fn node_id(&self) -> &NodeId;

    /// Every cluster member, ourselves included, in substrate order.
    fn node_ids(&self) -> &[NodeId];

    /// Fire-and-forget message; any reply is discarded.
    fn send(&self, dest: &NodeId, body: Body) -> Result<(), TransportError>;

    /// Send a request and wait for its reply.
    ///
    /// An `error` reply is returned as [`TransportError::Rejected`]; every
    /// other reply body is returned as-is for the caller to inspect.
    fn rpc(
        &self,
        dest: &NodeId,
        body: Body,
        timeout: Duration,
    ) -> impl Future<Output = Result<Body, TransportError>> + Send;
}

/// Inbound side: turns a request into an optional reply.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request from `src`; `Some` bodies are sent back as replies.
    fn handle(&self, src: NodeId, body: Body) -> impl Future<Output = Option<Body>> + Send;
}

/// Map an `error` reply body to [`TransportError::Rejected`].
pub(crate) fn reply_result(body: Body) -> Result<Body, TransportError> {
    match body {
        Body::Error { code, text } => Err(TransportError::Rejected { code, text }),
        other => Ok(other),
    }
}
