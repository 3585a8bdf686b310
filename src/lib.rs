//! Weft - worker lifecycle management and bounded task pools.
//!
//! Weft runs named units of work on dedicated threads and tracks each one
//! through an explicit lifecycle, with cooperative cancellation, ordered
//! initializers and keyed task fan-out.
//!
//! # Quick Start
//!
//! ```no_run
//! use weft::prelude::*;
//!
//! let tasks: Vec<TaskDescriptor<usize>> = ["alpha", "beta", "gamma"]
//!     .into_iter()
//!     .map(|word| TaskDescriptor::from_fn(word, move |_| Ok(word.len())))
//!     .collect();
//!
//! let results = TaskPool::submit_all(tasks)?;
//! let lengths: Vec<usize> = results.iter().filter_map(|r| r.value().copied()).collect();
//! assert_eq!(lengths, vec![5, 4, 5]);
//! # Ok::<(), weft::Error>(())
//! ```
//!
//! # Building blocks
//!
//! - [`CancellationToken`]: one-shot cooperative cancellation signal
//! - [`InitializerRegistry`]: prioritized per-scope worker initializers
//! - [`WorkerManager`]: spawns, cancels, joins and reaps workers
//! - [`TaskPool`]: keyed tasks over a bounded set of slots, in asynchronous
//!   or batched parallel mode, with nesting depth capped at
//!   [`pool::MAX_DEPTH`]

#![warn(missing_debug_implementations)]

pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod init;
pub mod pool;
pub mod prelude;
pub mod util;
pub mod worker;

pub use cancel::CancellationToken;
pub use codec::{Codec, JsonCodec};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, ErrorInfo, ErrorKind, PoolError, PoolTaskError, Result, TaskFailure};
pub use init::{DuplicatePolicy, FunctionInstance, InitScope, InitializerRegistry};
pub use pool::{SchedulingMode, TaskDescriptor, TaskPool, TaskResult, WorkSpec};
pub use worker::{Reservation, WorkerId, WorkerManager, WorkerRecord, WorkerState};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_manager_and_pool_share_initializers() {
        let registry = Arc::new(InitializerRegistry::new());
        registry
            .register(InitScope::Thread, "greeting", || Ok("hello".to_string()))
            .unwrap();

        let manager = WorkerManager::new(registry.clone());
        let record = manager
            .spawn("greeter", |ctx| {
                let greeting = ctx.init_result::<String>("greeting").unwrap();
                Ok(greeting.len())
            })
            .unwrap();
        assert!(manager.join(record.id(), Some(Duration::from_secs(5))).unwrap());
        assert_eq!(record.take_result::<usize>(), Some(5));

        let config = Config::builder().pool_size(1).build().unwrap();
        let mut pool = TaskPool::with_registry(config, registry).unwrap();
        pool.submit(TaskDescriptor::from_fn("t", |ctx| {
            Ok(ctx.init_result::<String>("greeting").is_some())
        }))
        .unwrap();
        assert_eq!(pool.get_result("t").unwrap().value(), Some(&true));
    }

    #[test]
    fn test_scoped_pool() {
        let total = TaskPool::scoped(2, |pool| {
            for i in 0..4u32 {
                pool.submit(TaskDescriptor::from_fn(format!("n{}", i), move |_| Ok(i)))
                    .unwrap();
            }
            pool.get_all_results()
                .iter()
                .filter_map(|r| r.value().copied())
                .sum::<u32>()
        })
        .unwrap();
        assert_eq!(total, 6);
    }
}
