//! Job queue: FIFO hand-off from producers to the single worker.
//!
//! `JobQueue` is the capability the worker consumes; `InMemoryQueue` is the
//! in-process implementation backed by an unbounded tokio channel. Nothing
//! is persisted: jobs still queued when the process exits are lost.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::pipeline::types::FeedbackJob;

/// FIFO job hand-off.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job. Never blocks.
    fn enqueue(&self, job: FeedbackJob) -> Result<(), QueueError>;

    /// Wait for the next job. Returns `None` once the queue is closed and empty.
    async fn dequeue(&self) -> Option<FeedbackJob>;

    /// Mark the most recently dequeued job as finished (committed or discarded).
    fn acknowledge(&self) -> Result<(), QueueError>;

    /// Jobs enqueued but not yet dequeued.
    fn pending(&self) -> usize;

    /// Jobs enqueued but not yet acknowledged.
    fn unfinished(&self) -> usize;

    /// Reject further enqueues. Already queued jobs can still be dequeued.
    fn close(&self);

    /// Wait until every enqueued job has been acknowledged.
    async fn wait_drained(&self);
}

/// Unbounded in-memory queue.
pub struct InMemoryQueue {
    tx: mpsc::UnboundedSender<FeedbackJob>,
    rx: Mutex<mpsc::UnboundedReceiver<FeedbackJob>>,
    pending: AtomicUsize,
    unfinished: AtomicUsize,
    closed: AtomicBool,
    closed_signal: Notify,
    drained: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            unfinished: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            closed_signal: Notify::new(),
            drained: Notify::new(),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn enqueue(&self, job: FeedbackJob) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            warn!(job_id = %job.job_id, "Rejected job: queue closed");
            return Err(QueueError::Closed);
        }

        let job_id = job.job_id;
        // Count before sending so a fast consumer never sees pending underflow.
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.unfinished.fetch_add(1, Ordering::AcqRel);

        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.unfinished.fetch_sub(1, Ordering::AcqRel);
            return Err(QueueError::Closed);
        }

        debug!(job_id = %job_id, pending = self.pending(), "Job enqueued");
        Ok(())
    }

    async fn dequeue(&self) -> Option<FeedbackJob> {
        let mut rx = self.rx.lock().await;
        loop {
            let closed_signal = self.closed_signal.notified();
            if self.closed.load(Ordering::Acquire) {
                // Closed: hand out what is left, then report exhaustion.
                return match rx.try_recv() {
                    Ok(job) => {
                        self.pending.fetch_sub(1, Ordering::AcqRel);
                        Some(job)
                    }
                    Err(_) => None,
                };
            }

            tokio::select! {
                job = rx.recv() => {
                    let job = job?;
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    return Some(job);
                }
                _ = closed_signal => {}
            }
        }
    }

    fn acknowledge(&self) -> Result<(), QueueError> {
        let previous = self
            .unfinished
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| QueueError::AcknowledgeWithoutDequeue)?;

        if previous == 1 {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(pending = self.pending(), "Job queue closed");
            self.closed_signal.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.unfinished() == 0 {
                return;
            }
            notified.await;
        }
    }
}
