//! Queue shared between a pool and its slots.
//!
//! In asynchronous mode the queue is plain FIFO with a bounded backlog. In
//! parallel mode every task is stamped with a batch number; a slot may only
//! start a batched task when everything currently running belongs to the
//! same batch, and a submitter opening a new batch waits until the previous
//! one has drained.

use super::mode::SchedulingMode;
use super::stats::PoolCounters;
use super::task::{TaskConfig, TaskDescriptor, TaskResult, WorkSpec};
use crate::error::{Error, ErrorInfo, ErrorKind, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

pub(crate) struct Queued<T> {
    pub index: usize,
    pub key: String,
    pub batch: Option<u64>,
    pub work: WorkSpec<T>,
    pub config: TaskConfig,
    pub started_at: Instant,
}

struct InFlight {
    batch: Option<u64>,
    slot: usize,
    key: String,
    work_spec_name: String,
    worker_identity: String,
    tags: BTreeMap<String, String>,
    started_at: Instant,
}

struct State<T> {
    mode: SchedulingMode,
    queue: VecDeque<Queued<T>>,
    in_flight: HashMap<usize, InFlight>,
    results: Vec<Option<TaskResult<T>>>,
    finished: usize,
    keys: HashMap<String, usize>,
    open_batch: Option<(u64, usize)>,
    next_batch: u64,
    batch_pending: HashMap<u64, usize>,
    closed: bool,
    cancelled: bool,
}

impl<T> State<T> {
    fn can_start(&self, task: &Queued<T>) -> bool {
        match task.batch {
            None => true,
            Some(b) => self.in_flight.values().all(|f| f.batch == Some(b)),
        }
    }

    fn batch_done(&mut self, batch: Option<u64>) {
        if let Some(b) = batch {
            if let Some(n) = self.batch_pending.get_mut(&b) {
                *n -= 1;
                if *n == 0 {
                    self.batch_pending.remove(&b);
                }
            }
        }
    }

    fn store(&mut self, result: TaskResult<T>) -> bool {
        let slot = &mut self.results[result.submission_index];
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.finished += 1;
        true
    }
}

pub(crate) struct Dispatcher<T> {
    state: Mutex<State<T>>,
    work_ready: Condvar,
    progress: Condvar,
    backlog_capacity: usize,
    pub(crate) counters: PoolCounters,
}

impl<T> Dispatcher<T> {
    pub fn new(mode: SchedulingMode, backlog_capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                mode,
                queue: VecDeque::new(),
                in_flight: HashMap::new(),
                results: Vec::new(),
                finished: 0,
                keys: HashMap::new(),
                open_batch: None,
                next_batch: 0,
                batch_pending: HashMap::new(),
                closed: false,
                cancelled: false,
            }),
            work_ready: Condvar::new(),
            progress: Condvar::new(),
            backlog_capacity,
            counters: PoolCounters::default(),
        }
    }

    pub fn mode(&self) -> SchedulingMode {
        self.state.lock().mode
    }

    /// Applies to tasks submitted from now on.
    pub fn set_mode(&self, mode: SchedulingMode) {
        let mut state = self.state.lock();
        state.mode = mode;
        state.open_batch = None;
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().keys.contains_key(key)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.state.lock().keys.get(key).copied()
    }

    pub fn submitted(&self) -> usize {
        self.state.lock().results.len()
    }

    /// Queue a task, blocking while the async backlog is full or while the
    /// previous parallel batch is still draining.
    pub fn enqueue(&self, task: TaskDescriptor<T>) -> Result<usize> {
        let mut state = self.state.lock();

        if state.keys.contains_key(&task.key) {
            return Err(Error::DuplicateKey(task.key));
        }

        let batch = loop {
            if state.closed || state.cancelled {
                return Err(Error::PoolClosed);
            }

            let mode = state.mode;
            let open = state.open_batch;
            match mode {
                SchedulingMode::Async => {
                    if state.queue.len() < self.backlog_capacity {
                        break None;
                    }
                }
                SchedulingMode::Parallel { batch: size } => match open {
                    Some((b, n)) if n < size => {
                        state.open_batch = Some((b, n + 1));
                        break Some(b);
                    }
                    Some((b, _)) if state.batch_pending.contains_key(&b) => {}
                    _ => {
                        let b = state.next_batch;
                        state.next_batch += 1;
                        state.open_batch = Some((b, 1));
                        break Some(b);
                    }
                },
            }

            self.progress.wait(&mut state);
        };

        // A concurrent submitter may have used the key while we waited.
        if state.keys.contains_key(&task.key) {
            return Err(Error::DuplicateKey(task.key));
        }

        let index = state.results.len();
        state.results.push(None);
        state.keys.insert(task.key.clone(), index);
        if let Some(b) = batch {
            *state.batch_pending.entry(b).or_insert(0) += 1;
        }

        state.queue.push_back(Queued {
            index,
            key: task.key,
            batch,
            work: task.work,
            config: task.config,
            started_at: Instant::now(),
        });
        self.counters.tasks_submitted.fetch_add(1, Ordering::Relaxed);

        drop(state);
        self.work_ready.notify_all();
        Ok(index)
    }

    /// Next task for `slot`, or `None` once the pool is closed and drained
    /// (or cancelled).
    pub fn next_task(&self, slot: usize, worker_identity: &str) -> Option<Queued<T>> {
        let mut state = self.state.lock();

        loop {
            if state.cancelled {
                return None;
            }

            let startable = state
                .queue
                .front()
                .map(|front| state.can_start(front))
                .unwrap_or(false);

            if startable {
                if let Some(mut task) = state.queue.pop_front() {
                    task.started_at = Instant::now();
                    state.in_flight.insert(
                        task.index,
                        InFlight {
                            batch: task.batch,
                            slot,
                            key: task.key.clone(),
                            work_spec_name: task.work.name().to_string(),
                            worker_identity: worker_identity.to_string(),
                            tags: task.config.tags.clone(),
                            started_at: task.started_at,
                        },
                    );
                    drop(state);
                    // Backlog space freed.
                    self.progress.notify_all();
                    return Some(task);
                }
            } else if state.queue.is_empty() && state.closed {
                return None;
            }

            self.work_ready.wait(&mut state);
        }
    }

    pub fn complete(&self, result: TaskResult<T>) {
        let mut state = self.state.lock();

        // Reports for tasks no longer in flight (resolved when their slot
        // was abandoned) are dropped, even if the result was already taken.
        let Some(flight) = state.in_flight.remove(&result.submission_index) else {
            return;
        };
        state.batch_done(flight.batch);

        let outcome_kind = result.error().map(|e| e.kind);
        if state.store(result) {
            let counter = match outcome_kind {
                None => &self.counters.tasks_completed,
                Some(ErrorKind::Cancelled) | Some(ErrorKind::CancellationTimeout) => {
                    &self.counters.tasks_cancelled
                }
                Some(_) => &self.counters.tasks_failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }

        drop(state);
        self.progress.notify_all();
        self.work_ready.notify_all();
    }

    /// Stop accepting tasks; slots exit once the queue is empty.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.work_ready.notify_all();
        self.progress.notify_all();
    }

    /// Resolve every queued task as cancelled and stop handing out work.
    pub fn cancel_queued(&self) -> usize {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.closed = true;

        let drained: Vec<Queued<T>> = state.queue.drain(..).collect();
        let count = drained.len();
        let now = Instant::now();

        for task in drained {
            state.batch_done(task.batch);
            let stored = state.store(TaskResult {
                key: task.key,
                work_spec_name: task.work.name().to_string(),
                worker_identity: String::new(),
                worker_slot: 0,
                submission_index: task.index,
                tags: task.config.tags,
                started_at: None,
                finished_at: now,
                outcome: Err(ErrorInfo::new(
                    ErrorKind::Cancelled,
                    "pool cancelled before the task started",
                )),
            });
            if stored {
                self.counters.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }

        drop(state);
        self.work_ready.notify_all();
        self.progress.notify_all();
        count
    }

    /// The slot's worker was abandoned: whatever it was running resolves
    /// with a cancellation timeout.
    pub fn abandon_slot(&self, slot: usize, grace: Duration) {
        let mut state = self.state.lock();

        let indices: Vec<usize> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.slot == slot)
            .map(|(i, _)| *i)
            .collect();

        let now = Instant::now();
        for index in indices {
            let Some(flight) = state.in_flight.remove(&index) else {
                continue;
            };
            state.batch_done(flight.batch);
            let stored = state.store(TaskResult {
                key: flight.key,
                work_spec_name: flight.work_spec_name,
                worker_identity: flight.worker_identity,
                worker_slot: flight.slot,
                submission_index: index,
                tags: flight.tags,
                started_at: Some(flight.started_at),
                finished_at: now,
                outcome: Err(ErrorInfo::new(
                    ErrorKind::CancellationTimeout,
                    format!("task did not stop within {:?} of cancellation", grace),
                )),
            });
            if stored {
                self.counters.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }

        drop(state);
        self.progress.notify_all();
    }

    /// Block until every submitted task has a result.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.finished < state.results.len() {
            self.progress.wait(&mut state);
        }
    }

    /// Block until task `index` has a result, then move it out.
    pub fn take_result(&self, index: usize) -> Option<TaskResult<T>> {
        let mut state = self.state.lock();
        if index >= state.results.len() {
            return None;
        }
        loop {
            if let Some(result) = state.results[index].take() {
                return Some(result);
            }
            self.progress.wait(&mut state);
        }
    }
}
