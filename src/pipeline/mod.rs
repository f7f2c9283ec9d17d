//! Feedback processing pipeline.
//!
//! Submissions flow through:
//! 1. `FeedbackIngestor::submit()`: validation and feature flags
//! 2. `JobQueue`: in-process FIFO hand-off
//! 3. `Worker` (in `crate::worker`): one transaction per job
//!    - `SentimentClassifier::classify()`: text to a 1.0–5.0 score
//!    - `ScoreAggregator::update()`: EMA fold under the entity lock
//!    - `AlertThrottler::check_and_record()`: threshold and cool-down

pub mod aggregator;
pub mod classifier;
pub mod ingest;
pub mod locks;
pub mod queue;
pub mod throttle;
pub mod types;

pub use aggregator::ScoreAggregator;
pub use classifier::{KeywordClassifier, SentimentClassifier};
pub use ingest::{FeedbackIngestor, FeedbackSubmission};
pub use locks::{EntityGuard, EntityLocks};
pub use queue::{InMemoryQueue, JobQueue};
pub use throttle::{AlertDecision, AlertThrottler};
