//! Bounded pool of codec workers
//!
//! Each worker is a tokio task that owns a job queue and runs the CPU-bound
//! codec call on the blocking thread pool. The pool tracks every worker
//! slot as [`SlotState::Idle`] or [`SlotState::Busy`]; a request claims an
//! idle slot, or grows the pool when a growth credit allows, or waits
//! [`SATURATED_RETRY_DELAY`] and tries again.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::WireCodec;
use crate::channels::Envelope;
use crate::{Error, Result};

/// Wait before a request retries against a saturated pool
pub const SATURATED_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Which side of the session owns the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Encodes and decodes on pooled workers
    Host,
    /// Encodes inline on the calling task
    Joiner,
}

/// Occupancy of one worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    /// Processing the request with this ID
    Busy(u64),
}

enum Job {
    Encode {
        envelope: Envelope,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Decode {
        bytes: Bytes,
        reply: oneshot::Sender<Result<Envelope>>,
    },
    Terminate {
        ack: oneshot::Sender<()>,
    },
}

struct Slot {
    state: SlotState,
    jobs: mpsc::UnboundedSender<Job>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    growth_credits: usize,
    clients: usize,
    next_request: u64,
    shut_down: bool,
}

/// Default worker cap: available parallelism minus two, at least one
pub fn default_worker_cap() -> usize {
    num_cpus::get().saturating_sub(2).max(1)
}

/// Lazily grown set of codec workers shared by every channel
pub struct CodecPool {
    codec: Arc<dyn WireCodec>,
    role: Role,
    cap: usize,
    state: Arc<Mutex<PoolState>>,
}

impl CodecPool {
    /// Create an empty pool that may grow to `cap` workers
    pub fn new(codec: Arc<dyn WireCodec>, role: Role, cap: usize) -> Self {
        Self {
            codec,
            role,
            cap: cap.max(1),
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    /// Encode an envelope into a data channel payload
    pub async fn encode(&self, envelope: Envelope) -> Result<Vec<u8>> {
        if self.role == Role::Joiner {
            return self.codec.encode(&envelope).map_err(codec_failure);
        }

        let (reply, result) = oneshot::channel();
        self.dispatch(Job::Encode { envelope, reply }).await?;
        result
            .await
            .map_err(|_| Error::CodecFailure("codec worker dropped the request".to_string()))?
    }

    /// Decode a data channel payload into an envelope
    pub async fn decode(&self, bytes: Bytes) -> Result<Envelope> {
        if self.role == Role::Joiner {
            return self.codec.decode(&bytes).map_err(codec_failure);
        }

        let (reply, result) = oneshot::channel();
        self.dispatch(Job::Decode { bytes, reply }).await?;
        result
            .await
            .map_err(|_| Error::CodecFailure("codec worker dropped the request".to_string()))?
    }

    /// A joiner was admitted; every other admission grants one growth credit
    pub fn notify_client_connect(&self) {
        let mut state = self.state.lock();
        state.clients += 1;
        if state.clients % 2 == 1 && state.slots.len() + state.growth_credits < self.cap {
            state.growth_credits += 1;
        }
    }

    /// A joiner went away
    pub fn notify_client_disconnect(&self) {
        let mut state = self.state.lock();
        state.clients = state.clients.saturating_sub(1);
    }

    /// Terminate every worker and wait for all of them to acknowledge
    ///
    /// Jobs already queued on a worker finish first. Afterwards every request
    /// fails with [`Error::PoolShutDown`].
    pub async fn shutdown(&self) {
        let workers: Vec<_> = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.slots.iter().map(|slot| slot.jobs.clone()).collect()
        };

        let acks = workers.into_iter().filter_map(|jobs| {
            let (ack, done) = oneshot::channel();
            jobs.send(Job::Terminate { ack }).ok().map(|_| done)
        });
        let acknowledged = join_all(acks).await.into_iter().filter(|r| r.is_ok()).count();

        info!(workers = acknowledged, "Codec pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Maximum number of workers
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Workers spawned so far
    pub fn worker_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Snapshot of every slot's occupancy
    pub fn slots(&self) -> Vec<SlotState> {
        self.state.lock().slots.iter().map(|slot| slot.state).collect()
    }

    async fn dispatch(&self, job: Job) -> Result<()> {
        let request_id = {
            let mut state = self.state.lock();
            state.next_request += 1;
            state.next_request
        };

        loop {
            if let Some(jobs) = self.claim(request_id)? {
                return jobs.send(job).map_err(|_| {
                    Error::CodecFailure("codec worker is no longer running".to_string())
                });
            }
            debug!(request_id, "All codec workers are busy; retrying");
            tokio::time::sleep(SATURATED_RETRY_DELAY).await;
        }
    }

    fn claim(&self, request_id: u64) -> Result<Option<mpsc::UnboundedSender<Job>>> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(Error::PoolShutDown);
        }

        if let Some(slot) = state.slots.iter_mut().find(|s| s.state == SlotState::Idle) {
            slot.state = SlotState::Busy(request_id);
            return Ok(Some(slot.jobs.clone()));
        }

        let can_grow = state.slots.is_empty()
            || (state.slots.len() < self.cap && state.growth_credits > 0);
        if !can_grow {
            return Ok(None);
        }

        state.growth_credits = state.growth_credits.saturating_sub(1);
        let index = state.slots.len();
        let jobs = self.spawn_worker(index);
        state.slots.push(Slot {
            state: SlotState::Busy(request_id),
            jobs: jobs.clone(),
        });
        debug!(worker = index, cap = self.cap, "Spawned codec worker");
        Ok(Some(jobs))
    }

    fn spawn_worker(&self, index: usize) -> mpsc::UnboundedSender<Job> {
        let (jobs, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(
            index,
            Arc::clone(&self.codec),
            Arc::clone(&self.state),
            queue,
        ));
        jobs
    }
}

impl Drop for CodecPool {
    fn drop(&mut self) {
        // Workers exit once their queue closes
        self.state.lock().slots.clear();
    }
}

async fn run_worker(
    index: usize,
    codec: Arc<dyn WireCodec>,
    state: Arc<Mutex<PoolState>>,
    mut queue: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = queue.recv().await {
        match job {
            Job::Encode { envelope, reply } => {
                let codec = Arc::clone(&codec);
                let result = run_blocking(move || codec.encode(&envelope)).await;
                release(&state, index);
                let _ = reply.send(result);
            }
            Job::Decode { bytes, reply } => {
                let codec = Arc::clone(&codec);
                let result = run_blocking(move || codec.decode(&bytes)).await;
                release(&state, index);
                let _ = reply.send(result);
            }
            Job::Terminate { ack } => {
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!(worker = index, "Codec worker stopped");
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(codec_failure),
        Err(join_err) => {
            warn!(error = %join_err, "Codec worker task failed");
            Err(Error::CodecFailure(format!("codec task failed: {}", join_err)))
        }
    }
}

fn release(state: &Mutex<PoolState>, index: usize) {
    if let Some(slot) = state.lock().slots.get_mut(index) {
        slot.state = SlotState::Idle;
    }
}

fn codec_failure(err: Error) -> Error {
    match err {
        Error::CodecFailure(_) => err,
        other => Error::CodecFailure(other.to_string()),
    }
}
