//! Worker lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a worker.
///
/// ```text
/// IDLE -> RUNNING -> CANCELLING -> CANCELLED
///                 -> STOPPING   -> COMPLETED
///                 -> ERROR
/// IDLE -> ERROR                 (initializer failed)
/// CANCELLING -> ERROR           (grace period exceeded)
/// STOPPING -> CANCELLING | ERROR
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Cancelling,
    Cancelled,
    Stopping,
    Completed,
    Error,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Cancelled | WorkerState::Error
        )
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Error)
                | (Running, Cancelling)
                | (Running, Stopping)
                | (Running, Error)
                | (Cancelling, Cancelled)
                | (Cancelling, Error)
                | (Stopping, Completed)
                | (Stopping, Cancelling)
                | (Stopping, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Cancelling => "cancelling",
            WorkerState::Cancelled => "cancelled",
            WorkerState::Stopping => "stopping",
            WorkerState::Completed => "completed",
            WorkerState::Error => "error",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
