//! Units of work submitted to a [`TaskPool`](super::TaskPool) and their results.

use crate::cancel::CancellationToken;
use crate::error::{Error, ErrorInfo, ErrorKind, PoolTaskError, Result, TaskFailure};
use crate::worker::{WorkerContext, WorkerId};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

type WorkFn<T> = Box<dyn FnOnce(&TaskContext) -> Result<T> + Send + 'static>;

/// The callable a task runs, with a name used in results and error reports.
pub struct WorkSpec<T> {
    name: String,
    func: WorkFn<T>,
}

impl<T> WorkSpec<T> {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(self, ctx: &TaskContext) -> Result<T> {
        (self.func)(ctx)
    }
}

impl<T> fmt::Debug for WorkSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkSpec").field("name", &self.name).finish()
    }
}

/// Per-task settings carried through to the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub tags: BTreeMap<String, String>,
}

impl TaskConfig {
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A task: a caller-chosen key, the work to run, and its settings.
#[derive(Debug)]
pub struct TaskDescriptor<T> {
    pub key: String,
    pub work: WorkSpec<T>,
    pub config: TaskConfig,
}

impl<T> TaskDescriptor<T> {
    pub fn new(key: impl Into<String>, work: WorkSpec<T>) -> Self {
        Self {
            key: key.into(),
            work,
            config: TaskConfig::default(),
        }
    }

    /// Shorthand for a task whose work spec is named after its key.
    pub fn from_fn<F>(key: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        let key = key.into();
        let work = WorkSpec::new(key.clone(), f);
        Self::new(key, work)
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }
}

/// What a task body sees while it runs on a pool slot.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub(crate) key: String,
    pub(crate) slot: usize,
    pub(crate) depth: usize,
    pub(crate) worker: WorkerContext,
}

impl TaskContext {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 1-based slot the task runs on.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker.id()
    }

    /// Nesting depth of the slot thread.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn token(&self) -> &CancellationToken {
        self.worker.token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.worker.is_cancelled()
    }

    pub fn check(&self) -> Result<()> {
        self.worker.check()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.worker.wait(timeout)
    }

    pub fn init_result<V: Any + Send + Sync>(&self, name: &str) -> Option<Arc<V>> {
        self.worker.init_result(name)
    }
}

/// Selects a task by key or by submission index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    Key(String),
    Index(usize),
}

impl From<&str> for TaskRef {
    fn from(key: &str) -> Self {
        TaskRef::Key(key.to_string())
    }
}

impl From<String> for TaskRef {
    fn from(key: String) -> Self {
        TaskRef::Key(key)
    }
}

impl From<usize> for TaskRef {
    fn from(index: usize) -> Self {
        TaskRef::Index(index)
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRef::Key(k) => write!(f, "{:?}", k),
            TaskRef::Index(i) => write!(f, "#{}", i),
        }
    }
}

/// Outcome of one submitted task.
///
/// `worker_slot` is 1-based; it is 0 and `started_at` is `None` for a task
/// that was cancelled before any slot picked it up.
#[derive(Debug)]
pub struct TaskResult<T> {
    pub key: String,
    pub work_spec_name: String,
    pub worker_identity: String,
    pub worker_slot: usize,
    pub submission_index: usize,
    pub tags: BTreeMap<String, String>,
    pub started_at: Option<Instant>,
    pub finished_at: Instant,
    pub outcome: std::result::Result<T, ErrorInfo>,
}

impl<T> TaskResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.outcome.as_ref().err()
    }

    pub fn run_time(&self) -> Option<Duration> {
        self.started_at
            .map(|start| self.finished_at.saturating_duration_since(start))
    }

    /// Failure details, if the task failed.
    pub fn failure(&self) -> Option<TaskFailure> {
        let err = self.error()?;
        Some(TaskFailure {
            work_spec_name: self.work_spec_name.clone(),
            key: self.key.clone(),
            worker_slot: self.worker_slot,
            worker_identity: self.worker_identity.clone(),
            caught_errors: vec![err.clone()],
            message: format!("task {:?} {}", self.key, err.kind),
        })
    }

    pub fn into_value(self) -> Result<T> {
        match self.failure() {
            Some(failure) => Err(PoolTaskError::new(failure).into()),
            // `failure()` is `None` only for successful outcomes.
            None => self.outcome.map_err(|err| Error::other(err.message)),
        }
    }

    /// The task stopped because of a cancellation request rather than
    /// failing on its own.
    pub fn is_cancelled(&self) -> bool {
        self.error()
            .map(|e| e.kind == ErrorKind::Cancelled)
            .unwrap_or(false)
    }

    /// Serializable summary, without the value.
    pub fn report(&self) -> TaskReport {
        TaskReport {
            key: self.key.clone(),
            work_spec_name: self.work_spec_name.clone(),
            worker_identity: self.worker_identity.clone(),
            worker_slot: self.worker_slot,
            submission_index: self.submission_index,
            tags: self.tags.clone(),
            run_time_us: self.run_time().map(|d| d.as_micros() as u64),
            error: self.error().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub key: String,
    pub work_spec_name: String,
    pub worker_identity: String,
    pub worker_slot: usize,
    pub submission_index: usize,
    pub tags: BTreeMap<String, String>,
    pub run_time_us: Option<u64>,
    pub error: Option<ErrorInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: std::result::Result<u32, ErrorInfo>) -> TaskResult<u32> {
        let now = Instant::now();
        TaskResult {
            key: "k".into(),
            work_spec_name: "encode".into(),
            worker_identity: "weft-worker-1#3".into(),
            worker_slot: 1,
            submission_index: 0,
            tags: BTreeMap::new(),
            started_at: Some(now),
            finished_at: now + Duration::from_millis(3),
            outcome,
        }
    }

    #[test]
    fn test_task_ref_conversions() {
        assert_eq!(TaskRef::from("a"), TaskRef::Key("a".into()));
        assert_eq!(TaskRef::from(3usize), TaskRef::Index(3));
    }

    #[test]
    fn test_successful_result() {
        let r = result(Ok(5));
        assert!(r.is_ok());
        assert_eq!(r.value(), Some(&5));
        assert!(r.failure().is_none());
        assert_eq!(r.run_time(), Some(Duration::from_millis(3)));
        assert_eq!(r.into_value().unwrap(), 5);
    }

    #[test]
    fn test_failed_result() {
        let r = result(Err(ErrorInfo::new(ErrorKind::Failed, "bad input")));
        let failure = r.failure().unwrap();
        assert_eq!(failure.key, "k");
        assert_eq!(failure.worker_slot, 1);
        assert_eq!(failure.caught_errors.len(), 1);

        let report = r.report();
        assert_eq!(report.error.as_ref().unwrap().message, "bad input");
        assert_eq!(report.run_time_us, Some(3000));

        match r.into_value() {
            Err(Error::PoolTask(e)) => assert_eq!(e.failure.work_spec_name, "encode"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_result() {
        let r = result(Err(ErrorInfo::new(ErrorKind::Cancelled, "stop")));
        assert!(r.is_cancelled());
        assert!(matches!(r.into_value(), Err(Error::PoolTask(_))));

        let killed = result(Err(ErrorInfo::new(ErrorKind::CancellationTimeout, "gave up")));
        assert!(!killed.is_cancelled());
        assert!(killed.failure().is_some());
    }

    #[test]
    fn test_descriptor_builders() {
        let task: TaskDescriptor<()> = TaskDescriptor::from_fn("job-1", |_| Ok(()))
            .with_config(TaskConfig::default().tag("tenant", "acme"));
        assert_eq!(task.key, "job-1");
        assert_eq!(task.work.name(), "job-1");
        assert_eq!(task.config.tags["tenant"], "acme");
    }
}
