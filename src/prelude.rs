pub use crate::cancel::CancellationToken;
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, ErrorInfo, ErrorKind, PoolError, Result};
pub use crate::init::{DuplicatePolicy, InitScope, InitializerRegistry};
pub use crate::pool::{
    current_depth, SchedulingMode, TaskConfig, TaskContext, TaskDescriptor, TaskPool, TaskResult,
    WorkSpec,
};
pub use crate::worker::{
    Reservation, SpawnOptions, WorkerContext, WorkerId, WorkerManager, WorkerRecord, WorkerState,
};
