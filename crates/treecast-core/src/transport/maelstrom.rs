//! Maelstrom stdio runtime.
//!
//! Maelstrom drives each node as a process speaking newline-delimited JSON:
//! requests arrive on stdin, every outbound message goes to stdout, and logs
//! must stay on stderr.
//!
//! ## Lifecycle
//!
//! 1. [`MaelstromRuntime::init`] blocks on the `init` message, replies
//!    `init_ok` and learns the node id and membership.
//! 2. A reader task demultiplexes stdin: replies (`in_reply_to`) complete
//!    pending RPCs, everything else is queued for [`MaelstromRuntime::serve`].
//! 3. A writer task serialises all outbound envelopes onto stdout.
//! 4. `serve` spawns one task per request and routes the handler's reply
//!    back with `in_reply_to` set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{reply_result, Handler, Transport};
use crate::error::{NodeError, NodeResult, TransportError};
use crate::protocol::{Body, DecodeFailure, Envelope, WireBody};
use crate::types::NodeId;

/// Outbound side of a Maelstrom node.
pub struct MaelstromTransport {
    node_id: NodeId,
    node_ids: Vec<NodeId>,
    next_msg_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Body>>>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl MaelstromTransport {
    fn next_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, dest: &NodeId, body: WireBody) -> Result<(), TransportError> {
        self.outbound
            .send(Envelope {
                src: self.node_id.clone(),
                dest: dest.clone(),
                body,
            })
            .map_err(|_| TransportError::Closed)
    }

    /// Answer request `msg_id` from `dest`.
    pub fn reply(&self, dest: &NodeId, msg_id: u64, body: Body) -> Result<(), TransportError> {
        self.emit(
            dest,
            WireBody {
                msg_id: Some(self.next_id()),
                in_reply_to: Some(msg_id),
                payload: body,
            },
        )
    }

    /// Complete a pending RPC; returns `false` for unknown or expired ids.
    fn complete(&self, in_reply_to: u64, body: Body) -> bool {
        match self.pending.lock().remove(&in_reply_to) {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }

    /// Number of RPCs waiting for a reply.
    pub fn pending_rpcs(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Transport for MaelstromTransport {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    fn send(&self, dest: &NodeId, body: Body) -> Result<(), TransportError> {
        self.emit(
            dest,
            WireBody {
                msg_id: None,
                in_reply_to: None,
                payload: body,
            },
        )
    }

    async fn rpc(
        &self,
        dest: &NodeId,
        body: Body,
        timeout: Duration,
    ) -> Result<Body, TransportError> {
        let msg_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg_id, tx);

        if let Err(e) = self.emit(
            dest,
            WireBody {
                msg_id: Some(msg_id),
                in_reply_to: None,
                payload: body,
            },
        ) {
            self.pending.lock().remove(&msg_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply_result(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&msg_id);
                Err(TransportError::Timeout(dest.clone()))
            }
        }
    }
}

/// A running Maelstrom node: transport plus the inbound request queue.
pub struct MaelstromRuntime {
    transport: Arc<MaelstromTransport>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    reader: JoinHandle<()>,
}

impl MaelstromRuntime {
    /// Perform the `init` handshake on the process's stdin/stdout.
    pub async fn init() -> NodeResult<Self> {
        Self::init_with(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
    }

    /// Perform the `init` handshake on arbitrary streams.
    pub async fn init_with<R, W>(mut input: R, mut output: W) -> NodeResult<Self>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut line = String::new();
        let (init, node_id, node_ids) = loop {
            line.clear();
            if input.read_line(&mut line).await? == 0 {
                return Err(NodeError::Protocol(
                    "input closed before init message".into(),
                ));
            }
            if line.trim().is_empty() {
                continue;
            }
            let env = Envelope::decode(line.trim()).map_err(|f| {
                NodeError::Protocol(format!("undecodable message before init: {}", f.reason))
            })?;
            match env.body.payload.clone() {
                Body::Init { node_id, node_ids } => break (env, node_id, node_ids),
                other => {
                    warn!(msg_type = other.type_name(), "Ignoring message received before init");
                }
            }
        };

        let init_ok = Envelope {
            src: node_id.clone(),
            dest: init.src.clone(),
            body: WireBody {
                msg_id: Some(0),
                in_reply_to: init.body.msg_id,
                payload: Body::InitOk,
            },
        };
        write_line(&mut output, &init_ok).await?;
        info!(node = %node_id, members = node_ids.len(), "Maelstrom node initialised");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(MaelstromTransport {
            node_id,
            node_ids,
            next_msg_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: out_tx,
        });

        tokio::spawn(writer_task(output, out_rx));
        let reader = tokio::spawn(reader_task(input, transport.clone(), in_tx));

        Ok(Self {
            transport,
            inbound: in_rx,
            reader,
        })
    }

    /// Shared handle to the transport.
    pub fn transport(&self) -> Arc<MaelstromTransport> {
        self.transport.clone()
    }

    /// Dispatch requests to `handler` until stdin closes.
    pub async fn serve<H: Handler>(mut self, handler: Arc<H>) -> NodeResult<()> {
        while let Some(env) = self.inbound.recv().await {
            let handler = handler.clone();
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let Envelope { src, body, .. } = env;
                let msg_type = body.payload.type_name();
                let reply = handler.handle(src.clone(), body.payload).await;
                match (reply, body.msg_id) {
                    (Some(reply), Some(msg_id)) => {
                        if let Err(e) = transport.reply(&src, msg_id, reply) {
                            warn!(%src, msg_type, error = %e, "Failed to send reply");
                        }
                    }
                    (Some(reply), None) => {
                        trace!(%src, msg_type, reply = reply.type_name(), "No msg_id, reply dropped");
                    }
                    (None, _) => {}
                }
            });
        }

        info!("Input closed, shutting down");
        self.reader.abort();
        Ok(())
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, env: &Envelope) -> NodeResult<()> {
    let mut line = env.encode()?;
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

async fn writer_task<W: AsyncWrite + Unpin>(mut output: W, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(env) = rx.recv().await {
        if let Err(e) = write_line(&mut output, &env).await {
            warn!(dest = %env.dest, error = %e, "Failed to write message, stopping writer");
            break;
        }
    }
    debug!("Writer task ended");
}

async fn reader_task<R: AsyncBufRead + Unpin>(
    input: R,
    transport: Arc<MaelstromTransport>,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match Envelope::decode(&line) {
            Ok(env) => {
                if let Some(in_reply_to) = env.body.in_reply_to {
                    if !transport.complete(in_reply_to, env.body.payload) {
                        debug!(src = %env.src, in_reply_to, "Reply for expired or unknown request");
                    }
                } else if inbound.send(env).is_err() {
                    break;
                }
            }
            Err(failure) => reject(&transport, failure),
        }
    }
    debug!("Reader task ended");
}

fn reject(transport: &MaelstromTransport, failure: DecodeFailure) {
    warn!(
        src = ?failure.src,
        code = %failure.code,
        reason = %failure.reason,
        "Undecodable message"
    );
    if let (Some(src), Some(msg_id)) = (failure.src, failure.msg_id) {
        let _ = transport.reply(&src, msg_id, Body::error(failure.code, failure.reason));
    }
}
