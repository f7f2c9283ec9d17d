//! Worker state machine.

use serde::{Deserialize, Serialize};

/// Where the worker is in its consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Between jobs.
    Idle,
    /// Blocked on the queue.
    Dequeuing,
    /// Classifying and staging writes for one job.
    Processing,
    /// Committing the job's transaction.
    Committing,
    /// Discarding the job's transaction.
    RollingBack,
    /// Loop exited. Terminal.
    Stopped,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            // From Idle (Processing when a job is handed in directly)
            (Idle, Dequeuing) | (Idle, Processing) | (Idle, Stopped) |
            // From Dequeuing
            (Dequeuing, Processing) | (Dequeuing, Stopped) |
            // From Processing
            (Processing, Committing) | (Processing, RollingBack) |
            // From Committing (a failed commit still has to roll back)
            (Committing, Idle) | (Committing, RollingBack) |
            // From RollingBack
            (RollingBack, Idle)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether a job's transaction is open in this state.
    pub fn in_unit_of_work(&self) -> bool {
        matches!(self, Self::Processing | Self::Committing | Self::RollingBack)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Dequeuing => "dequeuing",
            Self::Processing => "processing",
            Self::Committing => "committing",
            Self::RollingBack => "rolling_back",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
