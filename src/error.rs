use crate::init::InitScope;
use crate::worker::{Reservation, WorkerId, WorkerState};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cancellation requested")]
    CancellationRequested,

    #[error("reservation {reservation} already held by worker {holder}")]
    ReservationConflict {
        reservation: Reservation,
        holder: WorkerId,
    },

    #[error("unknown reservation: {0}")]
    UnknownReservation(String),

    #[error("{scope} initializer {name:?} failed: {message}")]
    InitializerFailure {
        name: String,
        scope: InitScope,
        message: String,
    },

    #[error("worker {worker} is not terminal (state {state})")]
    NotTerminal { worker: WorkerId, state: WorkerState },

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("pool nesting depth {depth} exceeds the limit of {max}")]
    DepthLimitExceeded { depth: usize, max: usize },

    #[error("duplicate task key: {0}")]
    DuplicateKey(String),

    #[error("{scope} initializer {name:?} is already registered")]
    DuplicateInitializer { name: String, scope: InitScope },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error(transparent)]
    PoolTask(Box<PoolTaskError>),

    #[error(transparent)]
    Pool(PoolError),

    #[error("pool is closed")]
    PoolClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn spawn<S: Into<String>>(msg: S) -> Self {
        Error::Spawn(msg.into())
    }

    pub fn other<S: Into<String>>(msg: S) -> Self {
        Error::Other(msg.into())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::CancellationRequested)
    }
}

impl From<PoolTaskError> for Error {
    fn from(err: PoolTaskError) -> Self {
        Error::PoolTask(Box::new(err))
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

/// What kind of failure an [`ErrorInfo`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The body returned an error.
    Failed,
    /// The body panicked.
    Panicked,
    /// The body observed its cancellation token and exited.
    Cancelled,
    /// Cancellation was requested but the body never exited within the
    /// grace period; the worker was abandoned.
    CancellationTimeout,
    /// An initializer failed before the body could start.
    Initializer,
}

impl ErrorKind {
    /// Exit code reported for this kind of failure. Abandoned workers get the
    /// same code a killed process would.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Failed => 1,
            ErrorKind::Initializer => 3,
            ErrorKind::Panicked => 101,
            ErrorKind::Cancelled => 130,
            ErrorKind::CancellationTimeout => 137,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Failed => "failed",
            ErrorKind::Panicked => "panicked",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CancellationTimeout => "cancellation timeout",
            ErrorKind::Initializer => "initializer failed",
        };
        f.write_str(s)
    }
}

/// A captured failure: clonable and serializable, so it can be stored on a
/// worker record or a task result and reported later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<String>,
}

impl ErrorInfo {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
        }
    }

    pub fn with_location<S: Into<String>>(mut self, location: S) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Cancelled | ErrorKind::CancellationTimeout
        )
    }
}

impl From<&Error> for ErrorInfo {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::CancellationRequested => ErrorKind::Cancelled,
            Error::InitializerFailure { .. } => ErrorKind::Initializer,
            _ => ErrorKind::Failed,
        };
        ErrorInfo::new(kind, err.to_string())
    }
}

impl From<Error> for ErrorInfo {
    fn from(err: Error) -> Self {
        ErrorInfo::from(&err)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {})", location)?;
        }
        Ok(())
    }
}

/// One failed task inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub work_spec_name: String,
    pub key: String,
    pub worker_slot: usize,
    pub worker_identity: String,
    pub caught_errors: Vec<ErrorInfo>,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {:?} ({}) on slot {} [{}]: {}",
            self.key, self.work_spec_name, self.worker_slot, self.worker_identity, self.message
        )?;
        for caught in &self.caught_errors {
            write!(f, "; {}", caught)?;
        }
        Ok(())
    }
}

/// Raised when the result of a single failed task is requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{failure}")]
pub struct PoolTaskError {
    pub failure: TaskFailure,
}

impl PoolTaskError {
    pub fn new(failure: TaskFailure) -> Self {
        Self { failure }
    }
}

/// All task failures of one pool run, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolError {
    pub failures: Vec<TaskFailure>,
}

impl PoolError {
    pub fn new(failures: Vec<TaskFailure>) -> Self {
        Self { failures }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.key.as_str())
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Failed,
            ErrorKind::Panicked,
            ErrorKind::Cancelled,
            ErrorKind::CancellationTimeout,
            ErrorKind::Initializer,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_error_info_from_error() {
        let info = ErrorInfo::from(Error::CancellationRequested);
        assert_eq!(info.kind, ErrorKind::Cancelled);
        assert!(info.is_cancellation());

        let info = ErrorInfo::from(Error::other("boom"));
        assert_eq!(info.kind, ErrorKind::Failed);
        assert_eq!(info.message, "boom");
    }

    #[test]
    fn test_pool_error_display_lists_failures() {
        let failure = TaskFailure {
            work_spec_name: "resize".into(),
            key: "img-1".into(),
            worker_slot: 2,
            worker_identity: "weft-worker-2".into(),
            caught_errors: vec![ErrorInfo::new(ErrorKind::Failed, "bad header")],
            message: "task failed".into(),
        };
        let err = PoolError::new(vec![failure]);
        let text = err.to_string();
        assert!(text.starts_with("1 task(s) failed"));
        assert!(text.contains("img-1"));
        assert!(text.contains("bad header"));
        assert_eq!(err.keys().collect::<Vec<_>>(), vec!["img-1"]);
    }
}
