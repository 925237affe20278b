//! Reliable delivery queue.
//!
//! Every new value produces one [`DeliveryJob`] per outgoing tree edge. The
//! queue keeps resending a job until its destination answers
//! `broadcast_ok`, so a value survives dropped messages, timeouts and
//! crashed peers.
//!
//! ## Architecture
//!
//! ```text
//! submit(job) ──► backlog (unbounded mpsc) ──► dispatcher task
//!                                                 │ one task per job
//!                                                 ▼
//!                      ┌──────────── deliver(job) ─────────────┐
//!                      │ acked? ──yes──► done                  │
//!                      │ spawn attempt (rpc + mark ack)        │
//!                      │ wait ≤ rpc_timeout                    │
//!                      │ failed ─► acked? ─► backoff ─► again  │
//!                      └───────────────────────────────────────┘
//! ```
//!
//! Each attempt runs in its own task and records the acknowledgement itself.
//! If the retry loop stops waiting (timeout) and the reply shows up later,
//! the ack still lands in the [`AckRecord`], and the loop's check before the
//! next resend sees it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::protocol::Body;
use crate::transport::Transport;
use crate::types::{NodeId, Value};

/// How much longer than `rpc_timeout` an attempt keeps listening for a late reply.
pub const LATE_REPLY_FACTOR: u32 = 4;

/// One obligation: deliver `value` from `origin` to `destination`.
///
/// The whole tuple is the identity; the same value pushed to the same peer
/// twice is one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeliveryJob {
    /// Node that owes the delivery
    pub origin: NodeId,
    /// Node that must receive the value
    pub destination: NodeId,
    /// The value
    pub value: Value,
}

impl DeliveryJob {
    /// Create a job.
    pub fn new(origin: NodeId, destination: NodeId, value: Value) -> Self {
        Self {
            origin,
            destination,
            value,
        }
    }
}

impl std::fmt::Display for DeliveryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}→{}:{}", self.origin, self.destination, self.value)
    }
}

/// Jobs whose destination has acknowledged them.
///
/// Marks are never removed.
#[derive(Debug, Default)]
pub struct AckRecord {
    acked: Mutex<HashSet<DeliveryJob>>,
}

impl AckRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a job acknowledged; returns `true` if it was not marked before.
    pub fn mark(&self, job: &DeliveryJob) -> bool {
        self.acked.lock().insert(job.clone())
    }

    /// Whether the job has been acknowledged.
    pub fn is_acked(&self, job: &DeliveryJob) -> bool {
        self.acked.lock().contains(job)
    }

    /// Number of acknowledged jobs.
    pub fn len(&self) -> usize {
        self.acked.lock().len()
    }

    /// Whether nothing has been acknowledged yet.
    pub fn is_empty(&self) -> bool {
        self.acked.lock().is_empty()
    }
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Jobs accepted by `submit`
    pub submitted: u64,
    /// Jobs skipped by `submit` (already acked or in flight)
    pub skipped: u64,
    /// Broadcast requests sent
    pub attempts: u64,
    /// Attempts that failed and were followed by a back-off
    pub retries: u64,
    /// Jobs completed with an acknowledgement
    pub acknowledged: u64,
    /// Jobs abandoned after `max_attempts`
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    skipped: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    acknowledged: AtomicU64,
    dead_lettered: AtomicU64,
}

struct Shared<T> {
    transport: Arc<T>,
    config: NodeConfig,
    acks: AckRecord,
    in_flight: Mutex<HashSet<DeliveryJob>>,
    dead_letters: Mutex<Vec<DeliveryJob>>,
    counters: Counters,
}

/// Retry-until-acknowledged dispatcher.
pub struct DeliveryQueue<T> {
    shared: Arc<Shared<T>>,
    backlog: mpsc::UnboundedSender<DeliveryJob>,
}

impl<T> Clone for DeliveryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            backlog: self.backlog.clone(),
        }
    }
}

impl<T: Transport> DeliveryQueue<T> {
    /// Create the queue and spawn its dispatcher on the current tokio runtime.
    pub fn start(transport: Arc<T>, config: NodeConfig) -> Self {
        let shared = Arc::new(Shared {
            transport,
            config,
            acks: AckRecord::new(),
            in_flight: Mutex::new(HashSet::new()),
            dead_letters: Mutex::new(Vec::new()),
            counters: Counters::default(),
        });
        let (backlog, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch(shared.clone(), rx));
        Self { shared, backlog }
    }

    /// Enqueue a delivery obligation; never blocks.
    ///
    /// Jobs already acknowledged or already being delivered are dropped.
    pub fn submit(&self, job: DeliveryJob) {
        if self.shared.acks.is_acked(&job) || !self.shared.in_flight.lock().insert(job.clone()) {
            trace!(%job, "Job already acknowledged or in flight");
            self.shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(job)) = self.backlog.send(job) {
            warn!(%job, "Delivery dispatcher stopped, job not queued");
            self.shared.in_flight.lock().remove(&job);
        }
    }

    /// Whether the destination has acknowledged the job.
    pub fn is_acked(&self, job: &DeliveryJob) -> bool {
        self.shared.acks.is_acked(job)
    }

    /// Acknowledgement record.
    pub fn acks(&self) -> &AckRecord {
        &self.shared.acks
    }

    /// Jobs queued or being delivered.
    pub fn pending(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Jobs abandoned after exhausting `max_attempts`.
    pub fn dead_letters(&self) -> Vec<DeliveryJob> {
        self.shared.dead_letters.lock().clone()
    }

    /// Counters so far.
    pub fn stats(&self) -> DeliveryStats {
        let c = &self.shared.counters;
        DeliveryStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
        }
    }

    async fn dispatch(shared: Arc<Shared<T>>, mut rx: mpsc::UnboundedReceiver<DeliveryJob>) {
        debug!("Delivery dispatcher started");
        while let Some(job) = rx.recv().await {
            tokio::spawn(Self::deliver(shared.clone(), job));
        }
        debug!("Delivery dispatcher stopped");
    }

    async fn deliver(shared: Arc<Shared<T>>, job: DeliveryJob) {
        let mut attempt: u32 = 0;
        loop {
            if shared.acks.is_acked(&job) {
                debug!(%job, attempt, "Job acknowledged");
                shared.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                break;
            }

            attempt += 1;
            shared.counters.attempts.fetch_add(1, Ordering::Relaxed);
            let handle = tokio::spawn(Self::attempt(shared.clone(), job.clone()));

            let err = match tokio::time::timeout(shared.config.rpc_timeout, handle).await {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => e,
                Ok(Err(_)) => TransportError::Closed,
                Err(_) => TransportError::Timeout(job.destination.clone()),
            };

            if shared.acks.is_acked(&job) {
                continue;
            }

            if shared.config.max_attempts.is_some_and(|max| attempt >= max) {
                error!(%job, attempt, error = %err, "Giving up on job, moved to dead letters");
                shared.dead_letters.lock().push(job.clone());
                shared.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                break;
            }

            let delay = shared.config.backoff(attempt);
            warn!(
                %job,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Delivery failed, retrying"
            );
            shared.counters.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }

        shared.in_flight.lock().remove(&job);
    }

    /// One send; marks the job acknowledged on `broadcast_ok`, even if the
    /// retry loop has stopped waiting for this attempt.
    async fn attempt(shared: Arc<Shared<T>>, job: DeliveryJob) -> Result<(), TransportError> {
        let timeout = shared.config.rpc_timeout * LATE_REPLY_FACTOR;
        let reply = shared
            .transport
            .rpc(
                &job.destination,
                Body::Broadcast { message: job.value },
                timeout,
            )
            .await?;

        match reply {
            Body::BroadcastOk => {
                shared.acks.mark(&job);
                Ok(())
            }
            other => Err(TransportError::UnexpectedReply(other.type_name())),
        }
    }
}
