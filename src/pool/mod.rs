//! Task pools: keyed tasks fanned out over a bounded set of worker slots.

pub mod depth;
mod dispatch;
pub mod mode;
pub mod stats;
pub mod task;
pub mod task_pool;

pub use depth::{current_depth, MAX_DEPTH};
pub use mode::SchedulingMode;
pub use stats::PoolStats;
pub use task::{TaskConfig, TaskContext, TaskDescriptor, TaskRef, TaskReport, TaskResult, WorkSpec};
pub use task_pool::{TaskPool, DEFAULT_SUBMIT_ALL_SIZE};
