//! Single-consumer feedback worker.
//!
//! The worker pulls one job at a time off the queue and runs it as one unit
//! of work: classify, stage the raw observation, fold it into the entity's
//! score, decide on an alert, then commit everything or nothing. A failed
//! job is logged with its payload and discarded; the loop keeps going.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ProcessingError, WorkerError};
use crate::pipeline::aggregator::ScoreAggregator;
use crate::pipeline::classifier::SentimentClassifier;
use crate::pipeline::locks::EntityGuard;
use crate::pipeline::queue::JobQueue;
use crate::pipeline::throttle::{AlertDecision, AlertThrottler};
use crate::pipeline::types::{FeedbackJob, NewFeedback, score_in_range};
use crate::store::traits::{FeedbackStore, StoreTransaction};
use crate::worker::state::WorkerState;

/// Shared dependencies for the worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn FeedbackStore>,
    pub classifier: Arc<dyn SentimentClassifier>,
    pub aggregator: Arc<ScoreAggregator>,
    pub throttler: Arc<AlertThrottler>,
    pub clock: Arc<dyn Clock>,
}

/// What one committed job produced.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub feedback_id: i64,
    pub sentiment_score: f64,
    /// Entity average after this job. `None` for unscored entity types.
    pub updated_average: Option<f64>,
    /// Throttler decision. `None` for unscored entity types.
    pub alert: Option<AlertDecision>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Jobs handed to `process_job`.
    pub processed: u64,
    pub committed: u64,
    /// Jobs rolled back and discarded.
    pub failed: u64,
    pub alerts_fired: u64,
    pub alerts_throttled: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    alerts_fired: AtomicU64,
    alerts_throttled: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
            alerts_throttled: self.alerts_throttled.load(Ordering::Relaxed),
        }
    }
}

/// The consumer.
pub struct Worker {
    deps: WorkerDeps,
    state: watch::Sender<WorkerState>,
    stats: Arc<StatsCounters>,
}

impl Worker {
    pub fn new(deps: WorkerDeps) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            deps,
            state,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    fn transition(&self, to: WorkerState) {
        self.state.send_modify(|current| {
            if !current.can_transition_to(to) {
                warn!(from = %current, to = %to, "Unexpected worker state transition");
            } else {
                debug!(from = %current, to = %to, "Worker state");
            }
            *current = to;
        });
    }

    /// Start the consume loop on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state_rx = self.state.subscribe();
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(async move { self.run(stop_rx).await });
        WorkerHandle {
            stop_tx,
            join,
            state_rx,
            stats,
        }
    }

    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        info!("Feedback worker started");

        loop {
            if *stop_rx.borrow() {
                info!("Stop requested");
                break;
            }

            self.transition(WorkerState::Dequeuing);
            let job = tokio::select! {
                biased;
                // Also resolves when the handle is dropped.
                _ = stop_rx.changed() => {
                    info!("Stop requested while waiting for work");
                    break;
                }
                job = self.deps.queue.dequeue() => job,
            };

            let Some(job) = job else {
                info!("Job queue closed and empty");
                break;
            };

            let result = AssertUnwindSafe(self.process_job(&job))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(outcome)) => {
                    info!(
                        job_id = %outcome.job_id,
                        entity_id = %job.entity_id,
                        feedback_id = outcome.feedback_id,
                        score = outcome.sentiment_score,
                        average = ?outcome.updated_average,
                        "Feedback processed"
                    );
                }
                Ok(Err(e)) => {
                    // No retry and no dead-letter store: the job is dropped here.
                    error!(
                        job_id = %job.job_id,
                        payload = ?job,
                        error = %e,
                        "Feedback job failed, discarding"
                    );
                }
                Err(panic) => {
                    // The open transaction was dropped mid-unwind; the store
                    // rolls it back when the gate is next taken.
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    if self.state() != WorkerState::RollingBack {
                        self.transition(WorkerState::RollingBack);
                    }
                    self.transition(WorkerState::Idle);
                    error!(
                        job_id = %job.job_id,
                        payload = ?job,
                        panic = %panic_message(panic.as_ref()),
                        "Feedback job panicked, discarding"
                    );
                }
            }

            if let Err(e) = self.deps.queue.acknowledge() {
                warn!(job_id = %job.job_id, error = %e, "Failed to acknowledge job");
            }
        }

        self.transition(WorkerState::Stopped);
        let stats = self.stats();
        info!(
            processed = stats.processed,
            committed = stats.committed,
            failed = stats.failed,
            "Feedback worker stopped"
        );
    }

    /// Run one job as a single unit of work.
    ///
    /// On error nothing the job staged is persisted.
    pub async fn process_job(&self, job: &FeedbackJob) -> Result<JobOutcome, ProcessingError> {
        self.transition(WorkerState::Processing);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        debug!(
            job_id = %job.job_id,
            entity_type = %job.entity_type,
            entity_id = %job.entity_id,
            "Processing feedback"
        );

        let now = self.deps.clock.now();
        let result = self.unit_of_work(job, now).await;
        self.transition(WorkerState::Idle);

        match &result {
            Ok(outcome) => {
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                match outcome.alert {
                    Some(AlertDecision::Fired(_)) => {
                        self.stats.alerts_fired.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(AlertDecision::Throttled { .. }) => {
                        self.stats.alerts_throttled.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
            Err(_) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn unit_of_work(
        &self,
        job: &FeedbackJob,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, ProcessingError> {
        // Held from before begin() until after commit or rollback.
        let guard = if job.entity_type.is_scored() {
            match self.deps.aggregator.lock(&job.entity_id).await {
                Ok(guard) => Some(guard),
                Err(e) => {
                    self.transition(WorkerState::RollingBack);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut tx = match self.deps.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.transition(WorkerState::RollingBack);
                return Err(e.into());
            }
        };

        let result = match self.stage(tx.as_mut(), job, guard.as_ref(), now).await {
            Ok(outcome) => {
                self.transition(WorkerState::Committing);
                match tx.commit().await {
                    Ok(()) => Ok(outcome),
                    Err(e) => {
                        self.transition(WorkerState::RollingBack);
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                self.transition(WorkerState::RollingBack);
                if let Err(rollback_err) = tx.rollback().await {
                    error!(
                        job_id = %job.job_id,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(e)
            }
        };

        drop(guard);
        result
    }

    async fn stage(
        &self,
        tx: &mut dyn StoreTransaction,
        job: &FeedbackJob,
        guard: Option<&EntityGuard>,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, ProcessingError> {
        let classifier = &self.deps.classifier;
        let score = classifier.classify(&job.text);
        if !score_in_range(score) {
            return Err(ProcessingError::Classification {
                classifier: classifier.name().to_string(),
                score,
            });
        }

        let record = tx
            .insert_feedback(&NewFeedback::from_job(job, score, now))
            .await?;

        let (updated_average, alert) = match guard {
            Some(guard) => {
                let average = self
                    .deps
                    .aggregator
                    .update(tx, guard, job.entity_type, score, now)
                    .await?;
                let decision = self
                    .deps
                    .throttler
                    .check_and_record(tx, &job.entity_id, average, now)
                    .await?;
                (Some(average), Some(decision))
            }
            None => (None, None),
        };

        Ok(JobOutcome {
            job_id: job.job_id,
            feedback_id: record.id,
            sentiment_score: score,
            updated_average,
            alert,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Handle to a spawned worker. Dropping it stops the worker.
pub struct WorkerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    state_rx: watch::Receiver<WorkerState>,
    stats: Arc<StatsCounters>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Wait until the worker reaches `target`.
    pub async fn wait_for_state(&self, target: WorkerState) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Signal the worker to stop and wait up to `grace` for it to exit.
    ///
    /// A job already in progress finishes its commit or rollback first. If
    /// the worker is still running when `grace` expires, its task is aborted.
    pub async fn stop(self, grace: Duration) -> Result<WorkerStats, WorkerError> {
        let WorkerHandle {
            stop_tx,
            mut join,
            stats,
            ..
        } = self;

        // Err only if the worker already exited.
        let _ = stop_tx.send(true);

        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(())) => Ok(stats.snapshot()),
            Ok(Err(e)) => Err(WorkerError::Panicked(e.to_string())),
            Err(_) => {
                join.abort();
                warn!(grace = ?grace, "Worker did not stop in time, aborted");
                Err(WorkerError::ShutdownTimeout { grace })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SharedConfig;
    use crate::pipeline::classifier::KeywordClassifier;
    use crate::pipeline::locks::EntityLocks;
    use crate::pipeline::queue::InMemoryQueue;
    use crate::pipeline::types::EntityType;
    use crate::store::libsql_backend::LibSqlBackend;

    /// Returns 9.0 for "boom" and panics on "crash". Anything else goes to
    /// the keyword classifier.
    struct FlakyClassifier(KeywordClassifier);

    impl SentimentClassifier for FlakyClassifier {
        fn name(&self) -> &str {
            "flaky"
        }

        fn classify(&self, text: &str) -> f64 {
            match text {
                "boom" => 9.0,
                "crash" => panic!("model crashed"),
                _ => self.0.classify(text),
            }
        }
    }

    struct Harness {
        queue: Arc<InMemoryQueue>,
        store: Arc<LibSqlBackend>,
        aggregator: Arc<ScoreAggregator>,
        worker: Worker,
    }

    async fn harness(lock_timeout: Duration) -> Harness {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = SharedConfig::default();
        let aggregator = Arc::new(ScoreAggregator::new(
            config.clone(),
            Arc::new(EntityLocks::new()),
            lock_timeout,
        ));
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let worker = Worker::new(WorkerDeps {
            queue: queue.clone(),
            store: store.clone(),
            classifier: Arc::new(FlakyClassifier(KeywordClassifier::default())),
            aggregator: aggregator.clone(),
            throttler: Arc::new(AlertThrottler::new(config)),
            clock: Arc::new(clock),
        });
        Harness {
            queue,
            store,
            aggregator,
            worker,
        }
    }

    #[tokio::test]
    async fn driver_job_commits_feedback_and_score() {
        let h = harness(Duration::from_secs(1)).await;
        let job = FeedbackJob::new("u1", EntityType::Driver, "D1", "rude and late");

        let outcome = h.worker.process_job(&job).await.unwrap();
        assert_eq!(outcome.sentiment_score, 1.0);
        assert_eq!(outcome.updated_average, Some(1.0));
        assert!(outcome.alert.as_ref().is_some_and(AlertDecision::fired));
        assert_eq!(h.worker.state(), WorkerState::Idle);

        assert_eq!(h.store.count_feedback().await.unwrap(), 1);
        let score = h.store.get_entity_score("D1").await.unwrap().unwrap();
        assert_eq!(score.observation_count, 1);
        assert_eq!(h.store.list_alerts_for_entity("D1", 5).await.unwrap().len(), 1);

        let stats = h.worker.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.alerts_fired, 1);
    }

    #[tokio::test]
    async fn unscored_entity_gets_feedback_only() {
        let h = harness(Duration::from_secs(1)).await;
        let job = FeedbackJob::new("u1", EntityType::Trip, "T1", "terrible");

        let outcome = h.worker.process_job(&job).await.unwrap();
        assert_eq!(outcome.updated_average, None);
        assert_eq!(outcome.alert, None);
        assert_eq!(h.store.count_feedback().await.unwrap(), 1);
        assert!(h.store.get_entity_score("T1").await.unwrap().is_none());
        assert!(h.store.get_entity("T1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn out_of_range_classification_rolls_back() {
        let h = harness(Duration::from_secs(1)).await;
        let job = FeedbackJob::new("u1", EntityType::Driver, "D1", "boom");

        let err = h.worker.process_job(&job).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Classification { ref classifier, score } if classifier == "flaky" && score == 9.0
        ));
        assert_eq!(h.worker.state(), WorkerState::Idle);
        assert_eq!(h.store.count_feedback().await.unwrap(), 0);
        assert_eq!(h.worker.stats().failed, 1);
    }

    #[tokio::test]
    async fn lock_timeout_fails_job_without_writes() {
        let h = harness(Duration::from_millis(20)).await;
        let _held = h.aggregator.lock("D1").await.unwrap();
        let job = FeedbackJob::new("u1", EntityType::Driver, "D1", "great");

        let err = h.worker.process_job(&job).await.unwrap_err();
        assert!(matches!(err, ProcessingError::AggregationConflict { .. }));
        assert_eq!(h.store.count_feedback().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_survives_failed_job() {
        let h = harness(Duration::from_secs(1)).await;
        let queue = h.queue.clone();
        let handle = h.worker.spawn();

        for text in ["boom", "great", "boom", "friendly"] {
            queue
                .enqueue(FeedbackJob::new("u1", EntityType::Driver, "D1", text))
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), queue.wait_drained())
            .await
            .unwrap();

        let stats = handle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.committed, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(h.store.count_feedback().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn loop_survives_panicking_classifier() {
        let h = harness(Duration::from_secs(1)).await;
        let queue = h.queue.clone();
        let handle = h.worker.spawn();

        for text in ["crash", "great"] {
            queue
                .enqueue(FeedbackJob::new("u1", EntityType::Driver, "D1", text))
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), queue.wait_drained())
            .await
            .unwrap();

        let stats = handle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.failed, 1);

        // Only the second job's writes are visible; the panicked one left none.
        assert_eq!(h.store.count_feedback().await.unwrap(), 1);
        let score = h.store.get_entity_score("D1").await.unwrap().unwrap();
        assert_eq!(score.observation_count, 1);
        assert_eq!(score.average_score, 4.0);
    }

    #[tokio::test]
    async fn stop_lets_in_flight_job_commit() {
        let h = harness(Duration::from_secs(5)).await;
        let held = h.aggregator.lock("D1").await.unwrap();
        for text in ["great", "friendly"] {
            h.queue
                .enqueue(FeedbackJob::new("u1", EntityType::Driver, "D1", text))
                .unwrap();
        }

        let handle = h.worker.spawn();
        handle.wait_for_state(WorkerState::Processing).await;
        let stop = tokio::spawn(handle.stop(Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stop.is_finished());
        drop(held);

        let stats = stop.await.unwrap().unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(h.store.count_feedback().await.unwrap(), 1);
        // Enqueued before the stop, never picked up.
        assert_eq!(h.queue.pending(), 1);
    }

    #[tokio::test]
    async fn stop_lets_in_flight_job_roll_back() {
        let h = harness(Duration::from_millis(200)).await;
        let _held = h.aggregator.lock("D1").await.unwrap();
        for text in ["great", "friendly"] {
            h.queue
                .enqueue(FeedbackJob::new("u1", EntityType::Driver, "D1", text))
                .unwrap();
        }

        let handle = h.worker.spawn();
        handle.wait_for_state(WorkerState::Processing).await;

        let stats = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(h.store.count_feedback().await.unwrap(), 0);
        assert_eq!(h.queue.pending(), 1);
    }

    #[tokio::test]
    async fn stop_while_idle_returns_promptly() {
        let h = harness(Duration::from_secs(1)).await;
        let handle = h.worker.spawn();
        handle.wait_for_state(WorkerState::Dequeuing).await;

        let stats = tokio::time::timeout(
            Duration::from_secs(1),
            handle.stop(Duration::from_secs(1)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(stats, WorkerStats::default());
    }

    #[tokio::test]
    async fn stop_does_not_drain_queue() {
        let h = harness(Duration::from_secs(1)).await;
        let handle = h.worker.spawn();
        handle.wait_for_state(WorkerState::Dequeuing).await;
        handle.stop(Duration::from_secs(1)).await.unwrap();

        h.queue
            .enqueue(FeedbackJob::new("u1", EntityType::App, "app", "slow"))
            .unwrap();
        assert_eq!(h.queue.pending(), 1);
        assert_eq!(h.store.count_feedback().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_queue_stops_worker() {
        let h = harness(Duration::from_secs(1)).await;
        h.queue
            .enqueue(FeedbackJob::new("u1", EntityType::App, "app", "fast"))
            .unwrap();
        h.queue.close();

        let handle = h.worker.spawn();
        handle.wait_for_state(WorkerState::Stopped).await;
        assert_eq!(handle.stats().committed, 1);
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stuck_job_hits_shutdown_timeout() {
        let h = harness(Duration::from_secs(30)).await;
        let _held = h.aggregator.lock("D1").await.unwrap();
        let queue = h.queue.clone();
        let handle = h.worker.spawn();

        queue
            .enqueue(FeedbackJob::new("u1", EntityType::Driver, "D1", "great"))
            .unwrap();
        handle.wait_for_state(WorkerState::Processing).await;

        let err = handle.stop(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, WorkerError::ShutdownTimeout { .. }));
    }
}
