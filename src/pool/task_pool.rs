//! Bounded pool of worker slots running keyed tasks.

use super::depth;
use super::dispatch::Dispatcher;
use super::mode::SchedulingMode;
use super::stats::PoolStats;
use super::task::{TaskContext, TaskDescriptor, TaskRef, TaskResult};
use crate::config::Config;
use crate::error::{Error, ErrorInfo, PoolError, PoolTaskError, Result, TaskFailure};
use crate::init::{InitScope, InitializerRegistry};
use crate::util::clock::system_clock;
use crate::worker::{PanicHandler, SpawnOptions, WorkerContext, WorkerId, WorkerManager, WorkerRecord};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool size used by [`TaskPool::submit_all`].
pub const DEFAULT_SUBMIT_ALL_SIZE: usize = 8;

/// Runs [`TaskDescriptor`]s on a fixed set of worker slots.
///
/// Slots are spawned at construction and live until [`close`](Self::close),
/// [`cancel`](Self::cancel) or drop. Results come back in submission order
/// no matter which slot finished first.
///
/// ```no_run
/// use weft::pool::{TaskDescriptor, TaskPool};
///
/// let mut pool = TaskPool::new(4)?;
/// for i in 0..10u64 {
///     pool.submit(TaskDescriptor::from_fn(format!("square-{}", i), move |_| Ok(i * i)))?;
/// }
/// let squares: Vec<u64> = pool
///     .get_all_results()
///     .iter()
///     .filter_map(|r| r.value().copied())
///     .collect();
/// assert_eq!(squares.len(), 10);
/// # Ok::<(), weft::Error>(())
/// ```
pub struct TaskPool<T: Send + 'static> {
    size: usize,
    depth: usize,
    config: Config,
    manager: WorkerManager,
    dispatcher: Arc<Dispatcher<T>>,
    slots: Vec<WorkerId>,
    collected: Vec<TaskResult<T>>,
    closed: bool,
}

impl<T: Send + 'static> TaskPool<T> {
    pub fn new(size: usize) -> Result<Self> {
        Self::with_config(Config::builder().pool_size(size).build()?)
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_registry(config, Arc::new(InitializerRegistry::new()))
    }

    /// Create a pool whose slots run the initializers in `registry`.
    ///
    /// Fails with [`Error::DepthLimitExceeded`] when called at
    /// [`MAX_DEPTH`](super::MAX_DEPTH), and with the initializer's error if
    /// any slot fails to start.
    pub fn with_registry(config: Config, registry: Arc<InitializerRegistry>) -> Result<Self> {
        config.validate()?;
        let depth = depth::check_can_nest()?;
        let size = config.worker_count();

        let dispatcher = Arc::new(Dispatcher::new(
            config.initial_mode(),
            config.backlog_capacity,
        ));
        let handler = Arc::new(PanicHandler::new(config.panic_strategy));
        let manager = WorkerManager::with_config(registry, system_clock(), config.clone());

        let mut slots = Vec::with_capacity(size);
        for slot in 1..=size {
            let options = SpawnOptions::new()
                .name(format!("{}-{}", config.thread_name_prefix, slot))
                .scopes(vec![InitScope::Process, InitScope::Thread])
                .depth(depth + 1);

            let dispatcher_clone = dispatcher.clone();
            let handler_clone = handler.clone();
            let spawned = manager.spawn_with(options, move |ctx| {
                run_slot(ctx, slot, depth + 1, &dispatcher_clone, &handler_clone)
            });

            match spawned {
                Ok(record) => {
                    dispatcher
                        .counters
                        .workers_spawned
                        .fetch_add(1, Ordering::Relaxed);
                    slots.push(record.id());
                }
                Err(err) => {
                    // Already-started slots see the closed queue and exit;
                    // dropping the manager joins them.
                    dispatcher.close();
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            size,
            depth,
            mode = %dispatcher.mode(),
            "task pool started"
        );

        Ok(Self {
            size,
            depth,
            config,
            manager,
            dispatcher,
            slots,
            collected: Vec::new(),
            closed: false,
        })
    }

    /// Run `f` against a fresh pool, closing it afterwards.
    pub fn scoped<F, R>(size: usize, f: F) -> Result<R>
    where
        F: FnOnce(&mut TaskPool<T>) -> R,
    {
        let mut pool = Self::new(size)?;
        let out = f(&mut pool);
        pool.close()?;
        Ok(out)
    }

    /// One-shot helper using [`DEFAULT_SUBMIT_ALL_SIZE`] slots in
    /// asynchronous mode.
    pub fn submit_all(tasks: Vec<TaskDescriptor<T>>) -> Result<Vec<TaskResult<T>>> {
        Self::submit_all_with(tasks, DEFAULT_SUBMIT_ALL_SIZE, SchedulingMode::Async)
    }

    /// Run `tasks` to completion on a temporary pool of
    /// `min(size, tasks.len())` slots.
    ///
    /// Every failure is gathered into one [`PoolError`].
    pub fn submit_all_with(
        tasks: Vec<TaskDescriptor<T>>,
        size: usize,
        mode: SchedulingMode,
    ) -> Result<Vec<TaskResult<T>>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let size = size.min(tasks.len());
        let pool = Self::new(size)?;
        if let SchedulingMode::Parallel { batch } = mode {
            pool.set_parallel(Some(batch.min(size)))?;
        }
        pool.submit_multiple(tasks)?;

        let results = pool.into_results()?;
        let failures = collect_failures(&results);
        if !failures.is_empty() {
            return Err(PoolError::new(failures).into());
        }
        Ok(results)
    }

    pub fn submit(&self, task: TaskDescriptor<T>) -> Result<()> {
        let key = task.key.clone();
        let index = self.dispatcher.enqueue(task)?;
        tracing::trace!(key = %key, index, "task submitted");
        Ok(())
    }

    /// Submit several tasks. Keys are checked for duplicates, among
    /// themselves and against earlier submissions, before anything is
    /// queued.
    pub fn submit_multiple<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = TaskDescriptor<T>>,
    {
        let tasks: Vec<_> = tasks.into_iter().collect();

        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(task.key.as_str()) || self.dispatcher.contains_key(&task.key) {
                return Err(Error::DuplicateKey(task.key.clone()));
            }
        }

        for task in tasks {
            self.submit(task)?;
        }
        Ok(())
    }

    pub fn mode(&self) -> SchedulingMode {
        self.dispatcher.mode()
    }

    /// Switch to parallel batches of `batch` tasks (the pool size if
    /// `None`). Tasks already submitted keep their mode.
    pub fn set_parallel(&self, batch: Option<usize>) -> Result<()> {
        let batch = batch.unwrap_or(self.size);
        if batch == 0 || batch > self.size {
            return Err(Error::config(format!(
                "parallel batch must be in 1..={}, got {}",
                self.size, batch
            )));
        }
        self.dispatcher.set_mode(SchedulingMode::Parallel { batch });
        tracing::debug!(batch, "pool switched to parallel mode");
        Ok(())
    }

    pub fn set_async(&self) {
        self.dispatcher.set_mode(SchedulingMode::Async);
        tracing::debug!("pool switched to async mode");
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Depth of the thread that created this pool.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn submitted(&self) -> usize {
        self.dispatcher.submitted()
    }

    pub fn stats(&self) -> PoolStats {
        self.dispatcher.counters.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Records of the slots still tracked by the pool.
    pub fn workers(&self) -> Vec<WorkerRecord> {
        self.manager.records()
    }

    /// Wait for one task, blocking until it is terminal.
    ///
    /// A failed task comes back as [`Error::PoolTask`].
    pub fn get_result<R: Into<TaskRef>>(&mut self, task: R) -> Result<&TaskResult<T>> {
        let task = task.into();
        let index = match &task {
            TaskRef::Key(key) => self
                .dispatcher
                .index_of(key)
                .ok_or_else(|| Error::UnknownTask(task.to_string()))?,
            TaskRef::Index(i) if *i < self.submitted() => *i,
            TaskRef::Index(_) => return Err(Error::UnknownTask(task.to_string())),
        };

        self.collect_through(index + 1);
        let result = &self.collected[index];
        match result.failure() {
            Some(failure) => Err(PoolTaskError::new(failure).into()),
            None => Ok(result),
        }
    }

    /// Every result so far, in submission order, once all are terminal.
    pub fn get_all_results(&mut self) -> &[TaskResult<T>] {
        let submitted = self.submitted();
        self.collect_through(submitted);
        &self.collected
    }

    /// The failures among all submitted tasks, if any. Tasks that stopped
    /// on a cancellation request are not failures.
    pub fn errors(&mut self) -> Option<PoolError> {
        let failures = collect_failures(self.get_all_results());
        if failures.is_empty() {
            None
        } else {
            Some(PoolError::new(failures))
        }
    }

    /// Block until every submitted task is terminal.
    pub fn wait_all(&self) {
        self.dispatcher.wait_idle();
    }

    /// Stop accepting tasks, let queued and running ones finish, then join
    /// and reap every slot.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.dispatcher.close();

        for id in &self.slots {
            self.manager.join(*id, None)?;
            self.manager.reap(*id)?;
        }

        tracing::debug!(stats = ?self.stats(), "task pool closed");
        Ok(())
    }

    /// Cancel the pool.
    ///
    /// Queued tasks resolve as cancelled and running ones are asked to stop.
    /// Slots still running after `grace` are abandoned; their task resolves
    /// with a cancellation timeout. Returns the abandoned workers.
    pub fn cancel(&mut self, grace: Duration) -> Vec<WorkerId> {
        let dropped = self.dispatcher.cancel_queued();
        let abandoned = self.manager.shutdown(grace);

        for (i, id) in self.slots.iter().enumerate() {
            if abandoned.contains(id) {
                self.dispatcher.abandon_slot(i + 1, grace);
            }
            if let Err(err) = self.manager.reap(*id) {
                tracing::debug!(worker = %id, error = %err, "slot not reaped");
            }
        }
        self.closed = true;

        tracing::debug!(
            dropped,
            abandoned = abandoned.len(),
            "task pool cancelled"
        );
        abandoned
    }

    /// Close the pool and hand back every result in submission order.
    pub fn into_results(mut self) -> Result<Vec<TaskResult<T>>> {
        self.close()?;
        self.get_all_results();
        Ok(std::mem::take(&mut self.collected))
    }

    fn collect_through(&mut self, end: usize) {
        while self.collected.len() < end {
            match self.dispatcher.take_result(self.collected.len()) {
                Some(result) => self.collected.push(result),
                None => break,
            }
        }
    }
}

fn collect_failures<T>(results: &[TaskResult<T>]) -> Vec<TaskFailure> {
    results
        .iter()
        .filter(|r| !r.is_cancelled())
        .filter_map(|r| r.failure())
        .collect()
}

fn run_slot<T>(
    ctx: &WorkerContext,
    slot: usize,
    depth: usize,
    dispatcher: &Dispatcher<T>,
    handler: &PanicHandler,
) -> Result<()> {
    let identity = format!("{}{}", ctx.name(), ctx.id());

    while let Some(task) = dispatcher.next_task(slot, &identity) {
        let work_spec_name = task.work.name().to_string();
        let task_ctx = TaskContext {
            key: task.key.clone(),
            slot,
            depth,
            worker: ctx.clone(),
        };

        let work = task.work;
        let outcome = match handler.execute(|| work.run(&task_ctx)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ErrorInfo::from(&err)),
            Err(panicked) => Err(panicked),
        };

        if let Err(err) = &outcome {
            tracing::debug!(key = %task.key, slot, error = %err, "task failed");
        }

        dispatcher.complete(TaskResult {
            key: task.key,
            work_spec_name,
            worker_identity: identity.clone(),
            worker_slot: slot,
            submission_index: task.index,
            tags: task.config.tags,
            started_at: Some(task.started_at),
            finished_at: Instant::now(),
            outcome,
        });
    }

    Ok(())
}

impl<T: Send + 'static> fmt::Debug for TaskPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.size)
            .field("depth", &self.depth)
            .field("mode", &self.mode())
            .field("stats", &self.stats())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<T: Send + 'static> Drop for TaskPool<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to close task pool");
        }
    }
}
