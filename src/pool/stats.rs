use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by pool slots.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub workers_spawned: AtomicU64,
    pub tasks_submitted: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
}

impl PoolCounters {
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers_spawned: u64,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
}

impl PoolStats {
    /// Tasks that reached a terminal outcome.
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_cancelled
    }

    pub fn tasks_pending(&self) -> u64 {
        self.tasks_submitted.saturating_sub(self.tasks_finished())
    }
}
