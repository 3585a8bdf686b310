//! Per-worker bookkeeping.

use super::reservation::{Reservation, ReservationTable};
use super::state::WorkerState;
use crate::cancel::CancellationToken;
use crate::error::{ErrorInfo, ErrorKind};
use crate::init::InitValue;
use crate::util::clock::Clock;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

static WORKER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub(crate) u64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        WorkerId(WORKER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Fields {
    state: WorkerState,
    last_state_change: Instant,
    history: Vec<WorkerState>,
    thread_id: Option<ThreadId>,
    init_results: HashMap<String, InitValue>,
    result: Option<Box<dyn Any + Send>>,
    error: Option<ErrorInfo>,
    execution_completed: bool,
}

struct Inner {
    id: WorkerId,
    name: String,
    reservation: Option<Reservation>,
    created_at: Instant,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
    fields: Mutex<Fields>,
    completion: Condvar,
}

/// Shared handle to one worker's record.
///
/// Clones refer to the same record. Outside the crate the record is
/// read-only; lifecycle fields are written by the owning
/// [`WorkerManager`](super::WorkerManager) and by the worker reporting its
/// own outcome.
#[derive(Clone)]
pub struct WorkerRecord {
    inner: Arc<Inner>,
}

impl WorkerRecord {
    pub(crate) fn new(name: String, reservation: Option<Reservation>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            inner: Arc::new(Inner {
                id: WorkerId::next(),
                name,
                reservation,
                created_at: now,
                token: CancellationToken::with_clock(clock.clone()),
                clock,
                fields: Mutex::new(Fields {
                    state: WorkerState::Idle,
                    last_state_change: now,
                    history: vec![WorkerState::Idle],
                    thread_id: None,
                    init_results: HashMap::new(),
                    result: None,
                    error: None,
                    execution_completed: false,
                }),
                completion: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn reservation(&self) -> Option<Reservation> {
        self.inner.reservation
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn state(&self) -> WorkerState {
        self.inner.fields.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn last_state_change(&self) -> Instant {
        self.inner.fields.lock().last_state_change
    }

    /// Every state this worker has been in, oldest first.
    pub fn history(&self) -> Vec<WorkerState> {
        self.inner.fields.lock().history.clone()
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.inner.fields.lock().thread_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn init_result<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let value = self.inner.fields.lock().init_results.get(name)?.clone();
        value.downcast::<T>().ok()
    }

    pub fn init_result_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.fields.lock().init_results.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_result(&self) -> bool {
        self.inner.fields.lock().result.is_some()
    }

    /// Take the body's return value. `None` if there is none yet, it was
    /// already taken, or it is not an `R`.
    pub fn take_result<R: Any + Send>(&self) -> Option<R> {
        let mut fields = self.inner.fields.lock();
        let boxed = fields.result.take()?;
        match boxed.downcast::<R>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                fields.result = Some(boxed);
                None
            }
        }
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.inner.fields.lock().error.clone()
    }

    /// Whether the body ran and returned (successfully or with an error).
    pub fn execution_completed(&self) -> bool {
        self.inner.fields.lock().execution_completed
    }

    /// Block until the worker is terminal or `timeout` elapses. `None` waits
    /// forever. Returns whether the worker is terminal.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut fields = self.inner.fields.lock();
        match timeout.and_then(|t| Instant::now().checked_add(t)) {
            None => {
                while !fields.state.is_terminal() {
                    self.inner.completion.wait(&mut fields);
                }
                true
            }
            Some(deadline) => {
                while !fields.state.is_terminal() {
                    if self
                        .inner
                        .completion
                        .wait_until(&mut fields, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                fields.state.is_terminal()
            }
        }
    }

    fn move_to(&self, fields: &mut Fields, next: WorkerState) -> bool {
        if !fields.state.can_transition_to(next) {
            tracing::debug!(
                worker = %self.inner.id,
                from = %fields.state,
                to = %next,
                "ignored illegal state transition"
            );
            return false;
        }

        tracing::trace!(worker = %self.inner.id, from = %fields.state, to = %next, "state change");
        fields.state = next;
        fields.last_state_change = self.inner.clock.now();
        fields.history.push(next);

        if next.is_terminal() {
            self.inner.completion.notify_all();
        }
        true
    }

    pub(crate) fn set_thread_id(&self, id: ThreadId) {
        self.inner.fields.lock().thread_id = Some(id);
    }

    pub(crate) fn start(&self, init_results: HashMap<String, InitValue>) -> bool {
        let mut fields = self.inner.fields.lock();
        fields.init_results = init_results;
        self.move_to(&mut fields, WorkerState::Running)
    }

    /// Initializer failure: straight to `Error`, body never ran.
    pub(crate) fn fail_startup(&self, error: ErrorInfo, reservations: Option<&ReservationTable>) {
        let mut fields = self.inner.fields.lock();
        fields.error = Some(error);
        fields.execution_completed = false;
        if !self.move_to(&mut fields, WorkerState::Error) {
            fields.error = None;
        }
        self.release_reservation(reservations);
    }

    /// Join was requested on a running worker.
    pub(crate) fn mark_stopping(&self) -> bool {
        let mut fields = self.inner.fields.lock();
        if fields.state != WorkerState::Running {
            return false;
        }
        self.move_to(&mut fields, WorkerState::Stopping)
    }

    /// Trigger the token and move to `Cancelling` if the worker is live.
    pub(crate) fn request_cancel(&self) -> bool {
        self.inner.token.trigger();
        let mut fields = self.inner.fields.lock();
        let state = fields.state;
        match state {
            WorkerState::Running | WorkerState::Stopping => {
                self.move_to(&mut fields, WorkerState::Cancelling)
            }
            _ => false,
        }
    }

    /// Cancellation was not honored within the grace period.
    pub(crate) fn abandon(&self, grace: Duration) -> bool {
        let mut fields = self.inner.fields.lock();
        if fields.state != WorkerState::Cancelling {
            return false;
        }
        fields.error = Some(ErrorInfo::new(
            ErrorKind::CancellationTimeout,
            format!("worker did not stop within {:?} of cancellation", grace),
        ));
        self.move_to(&mut fields, WorkerState::Error)
    }

    /// The worker reports its own outcome. A record that is already terminal
    /// (for example after it was abandoned) keeps its state.
    ///
    /// The reservation is released in `reservations` before the record lock
    /// is dropped, so the name is never free while the record still looks
    /// live.
    pub(crate) fn finish(
        &self,
        outcome: Result<Box<dyn Any + Send>, ErrorInfo>,
        reservations: Option<&ReservationTable>,
    ) {
        let mut fields = self.inner.fields.lock();
        if !fields.state.is_terminal() {
            self.settle(&mut fields, outcome);
        }
        self.release_reservation(reservations);
    }

    fn settle(&self, fields: &mut Fields, outcome: Result<Box<dyn Any + Send>, ErrorInfo>) {
        match outcome {
            Ok(value) => {
                fields.result = Some(value);
                fields.execution_completed = true;
                let state = fields.state;
                match state {
                    WorkerState::Cancelling => {
                        self.move_to(fields, WorkerState::Cancelled);
                    }
                    WorkerState::Running => {
                        self.move_to(fields, WorkerState::Stopping);
                        self.move_to(fields, WorkerState::Completed);
                    }
                    _ => {
                        self.move_to(fields, WorkerState::Completed);
                    }
                }
            }
            Err(err) if err.kind == ErrorKind::Cancelled => {
                fields.execution_completed = true;
                if fields.state != WorkerState::Cancelling {
                    self.move_to(fields, WorkerState::Cancelling);
                }
                self.move_to(fields, WorkerState::Cancelled);
            }
            Err(err) => {
                fields.execution_completed = err.kind != ErrorKind::Panicked;
                fields.error = Some(err);
                self.move_to(fields, WorkerState::Error);
            }
        }
    }

    fn release_reservation(&self, reservations: Option<&ReservationTable>) {
        if let (Some(table), Some(reservation)) = (reservations, self.inner.reservation) {
            table.release(reservation, self.inner.id);
        }
    }
}

impl fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.inner.fields.lock();
        f.debug_struct("WorkerRecord")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("reservation", &self.inner.reservation)
            .field("state", &fields.state)
            .field("error", &fields.error)
            .field("execution_completed", &fields.execution_completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::system_clock;
    use std::thread;

    fn record() -> WorkerRecord {
        WorkerRecord::new("test".into(), None, system_clock())
    }

    #[test]
    fn test_new_record_is_idle() {
        let r = record();
        assert_eq!(r.state(), WorkerState::Idle);
        assert_eq!(r.history(), vec![WorkerState::Idle]);
        assert!(r.error().is_none());
        assert!(!r.execution_completed());
    }

    #[test]
    fn test_completed_path() {
        let r = record();
        assert!(r.start(HashMap::new()));
        r.finish(Ok(Box::new(7u32)), None);

        assert_eq!(r.state(), WorkerState::Completed);
        assert_eq!(
            r.history(),
            vec![
                WorkerState::Idle,
                WorkerState::Running,
                WorkerState::Stopping,
                WorkerState::Completed
            ]
        );
        assert!(r.execution_completed());
        assert_eq!(r.take_result::<String>(), None);
        assert_eq!(r.take_result::<u32>(), Some(7));
        assert_eq!(r.take_result::<u32>(), None);
    }

    #[test]
    fn test_cancelled_path() {
        let r = record();
        r.start(HashMap::new());
        assert!(r.request_cancel());
        assert!(r.cancellation_token().is_triggered());
        assert_eq!(r.state(), WorkerState::Cancelling);

        r.finish(Err(ErrorInfo::new(ErrorKind::Cancelled, "stop")), None);
        assert_eq!(r.state(), WorkerState::Cancelled);
        assert!(r.error().is_none());
    }

    #[test]
    fn test_error_iff_error_state() {
        let r = record();
        r.start(HashMap::new());
        r.finish(Err(ErrorInfo::new(ErrorKind::Failed, "bad")), None);
        assert_eq!(r.state(), WorkerState::Error);
        assert_eq!(r.error().unwrap().message, "bad");

        // Second report is ignored.
        r.finish(Ok(Box::new(())), None);
        assert_eq!(r.state(), WorkerState::Error);
        assert!(!r.has_result());
    }

    #[test]
    fn test_fail_startup() {
        let r = record();
        r.fail_startup(ErrorInfo::new(ErrorKind::Initializer, "init"), None);
        assert_eq!(r.state(), WorkerState::Error);
        assert!(!r.execution_completed());
        assert_eq!(r.history(), vec![WorkerState::Idle, WorkerState::Error]);
    }

    #[test]
    fn test_abandon_only_from_cancelling() {
        let r = record();
        r.start(HashMap::new());
        assert!(!r.abandon(Duration::from_millis(1)));

        r.request_cancel();
        assert!(r.abandon(Duration::from_millis(1)));
        assert_eq!(r.state(), WorkerState::Error);
        assert_eq!(r.error().unwrap().kind, ErrorKind::CancellationTimeout);
    }

    #[test]
    fn test_last_state_change_moves_forward() {
        let r = record();
        let created = r.last_state_change();
        thread::sleep(Duration::from_millis(2));
        r.start(HashMap::new());
        assert!(r.last_state_change() > created);
        assert_eq!(r.created_at(), created);
    }

    #[test]
    fn test_wait_for_terminal() {
        let r = record();
        r.start(HashMap::new());
        assert!(!r.wait(Some(Duration::from_millis(10))));

        let remote = r.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.finish(Ok(Box::new(())), None);
        });

        assert!(r.wait(Some(Duration::from_secs(5))));
        h.join().unwrap();
    }

    #[test]
    fn test_reservation_released_only_once_terminal() {
        let table = Arc::new(ReservationTable::default());
        let r = WorkerRecord::new("bridge".into(), Some(Reservation::BridgeThread), system_clock());
        table.claim(Reservation::BridgeThread, r.id()).unwrap();
        r.start(HashMap::new());

        let watcher = {
            let table = table.clone();
            let r = r.clone();
            thread::spawn(move || loop {
                if table.holder(Reservation::BridgeThread).is_none() {
                    // Once the name is free the record must read as terminal.
                    return r.is_terminal();
                }
                thread::yield_now();
            })
        };

        thread::sleep(Duration::from_millis(5));
        r.finish(Ok(Box::new(())), Some(&*table));

        assert!(watcher.join().unwrap());
        assert_eq!(r.state(), WorkerState::Completed);
        assert!(table.holder(Reservation::BridgeThread).is_none());
    }

    #[test]
    fn test_wait_with_unrepresentable_timeout() {
        let r = record();
        r.start(HashMap::new());
        r.finish(Ok(Box::new(())), None);
        assert!(r.wait(Some(Duration::MAX)));
    }
}
