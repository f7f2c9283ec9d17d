//! Worker system: the single consumer of the job queue.
//!
//! - `state`: worker state machine (Idle → Dequeuing → Processing → Committing/RollingBack)
//! - `worker`: consume loop, per-job unit of work, spawn/stop handle

pub mod state;
pub mod worker;

pub use state::WorkerState;
pub use worker::{JobOutcome, Worker, WorkerDeps, WorkerHandle, WorkerStats};
