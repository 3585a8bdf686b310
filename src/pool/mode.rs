use serde::{Deserialize, Serialize};
use std::fmt;

/// How a pool hands queued tasks to idle slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Any idle slot takes the next task immediately.
    #[default]
    Async,
    /// Tasks run in batches of `batch`; a batch starts only after the
    /// previous one has fully finished.
    Parallel { batch: usize },
}

impl SchedulingMode {
    pub fn is_parallel(self) -> bool {
        matches!(self, SchedulingMode::Parallel { .. })
    }

    pub fn batch_size(self) -> Option<usize> {
        match self {
            SchedulingMode::Async => None,
            SchedulingMode::Parallel { batch } => Some(batch),
        }
    }
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingMode::Async => f.write_str("async"),
            SchedulingMode::Parallel { batch } => write!(f, "parallel({})", batch),
        }
    }
}
