//! In-process network for tests and simulation.
//!
//! Every node registers a [`Handler`]; an RPC calls the destination handler
//! directly. Faults are injected per directed link:
//!
//! - a link can be taken down (every message on it is lost),
//! - a global loss probability drops messages at random, drawn from a seeded
//!   RNG so runs are reproducible.
//!
//! A lost request never reaches the destination. A lost reply is produced by
//! the destination (its state changes) but never reaches the caller, which is
//! the case retry deduplication has to absorb. Either way the caller waits
//! out its timeout and gets [`TransportError::Timeout`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::trace;

use super::{reply_result, Handler, Transport};
use crate::error::TransportError;
use crate::protocol::Body;
use crate::types::NodeId;

type HandlerFn = Arc<dyn Fn(NodeId, Body) -> BoxFuture<'static, Option<Body>> + Send + Sync>;

/// Message counters for a simulated network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    /// Messages handed to the network (requests, replies, one-way sends)
    pub sent: u64,
    /// Messages lost to a down link or random loss
    pub dropped: u64,
}

struct Faults {
    down: HashSet<(NodeId, NodeId)>,
    loss: f64,
    rng: StdRng,
}

struct NetworkInner {
    nodes: Vec<NodeId>,
    handlers: RwLock<HashMap<NodeId, HandlerFn>>,
    faults: Mutex<Faults>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl NetworkInner {
    /// Count one message on `from → to` and decide whether it arrives.
    fn deliverable(&self, from: &NodeId, to: &NodeId) -> bool {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let arrives = {
            let mut faults = self.faults.lock();
            let link_up = !faults.down.contains(&(from.clone(), to.clone()));
            let loss = faults.loss;
            link_up && (loss <= 0.0 || faults.rng.random::<f64>() >= loss)
        };
        if !arrives {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%from, %to, "Message dropped");
        }
        arrives
    }

    fn handler(&self, id: &NodeId) -> Option<HandlerFn> {
        self.handlers.read().get(id).cloned()
    }
}

/// A simulated cluster network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create a network over `nodes` with a seed for random loss.
    pub fn new(nodes: Vec<NodeId>, seed: u64) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes,
                handlers: RwLock::new(HashMap::new()),
                faults: Mutex::new(Faults {
                    down: HashSet::new(),
                    loss: 0.0,
                    rng: StdRng::seed_from_u64(seed),
                }),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Members of the network.
    pub fn nodes(&self) -> &[NodeId] {
        &self.inner.nodes
    }

    /// Transport endpoint for one member.
    pub fn transport(&self, id: &NodeId) -> MemoryTransport {
        MemoryTransport {
            me: id.clone(),
            net: self.inner.clone(),
        }
    }

    /// Route requests addressed to `id` into `handler`.
    pub fn register<H: Handler>(&self, id: &NodeId, handler: Arc<H>) {
        let f: HandlerFn = Arc::new(move |src, body| {
            let handler = handler.clone();
            Box::pin(async move { handler.handle(src, body).await })
        });
        self.inner.handlers.write().insert(id.clone(), f);
    }

    /// Take the directed link `from → to` down or bring it back up.
    pub fn set_link(&self, from: &NodeId, to: &NodeId, up: bool) {
        let mut faults = self.inner.faults.lock();
        if up {
            faults.down.remove(&(from.clone(), to.clone()));
        } else {
            faults.down.insert((from.clone(), to.clone()));
        }
    }

    /// Cut both directions between two nodes.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        self.set_link(a, b, false);
        self.set_link(b, a, false);
    }

    /// Restore both directions between two nodes.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.set_link(a, b, true);
        self.set_link(b, a, true);
    }

    /// Restore every link.
    pub fn heal_all(&self) {
        self.inner.faults.lock().down.clear();
    }

    /// Probability in `[0, 1]` that any single message is lost.
    pub fn set_loss(&self, probability: f64) {
        self.inner.faults.lock().loss = probability.clamp(0.0, 1.0);
    }

    /// Counters so far.
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Issue a client request to a node, bypassing fault injection.
    pub async fn client_request(&self, dest: &NodeId, body: Body) -> Option<Body> {
        let handler = self.inner.handler(dest)?;
        handler(NodeId::from("c0"), body).await
    }
}

/// One node's endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    me: NodeId,
    net: Arc<NetworkInner>,
}

impl Transport for MemoryTransport {
    fn node_id(&self) -> &NodeId {
        &self.me
    }

    fn node_ids(&self) -> &[NodeId] {
        &self.net.nodes
    }

    fn send(&self, dest: &NodeId, body: Body) -> Result<(), TransportError> {
        let handler = self
            .net
            .handler(dest)
            .ok_or_else(|| TransportError::Unreachable(dest.clone()))?;
        if self.net.deliverable(&self.me, dest) {
            let src = self.me.clone();
            tokio::spawn(async move {
                let _ = handler(src, body).await;
            });
        }
        Ok(())
    }

    async fn rpc(
        &self,
        dest: &NodeId,
        body: Body,
        timeout: Duration,
    ) -> Result<Body, TransportError> {
        let handler = self
            .net
            .handler(dest)
            .ok_or_else(|| TransportError::Unreachable(dest.clone()))?;

        if !self.net.deliverable(&self.me, dest) {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout(dest.clone()));
        }

        let reply = match tokio::time::timeout(timeout, handler(self.me.clone(), body)).await {
            Ok(Some(reply)) => reply,
            Ok(None) | Err(_) => return Err(TransportError::Timeout(dest.clone())),
        };

        if !self.net.deliverable(dest, &self.me) {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout(dest.clone()));
        }

        reply_result(reply)
    }
}
