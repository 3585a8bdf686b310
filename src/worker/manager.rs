//! Spawns, tracks, cancels and reaps the workers of one process.

use super::panic_handler::PanicHandler;
use super::record::{WorkerId, WorkerRecord};
use super::reservation::{Reservation, ReservationTable};
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::{Error, ErrorInfo, Result};
use crate::init::{InitScope, InitializerRegistry};
use crate::pool::depth;
use crate::util::clock::{system_clock, Clock};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How to start a worker.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub name: Option<String>,
    pub reservation: Option<Reservation>,
    /// Initializer scopes to run, in order, before the body.
    pub scopes: Vec<InitScope>,
    /// Pool nesting depth the worker thread runs at. Defaults to the
    /// spawning thread's depth.
    pub depth: Option<usize>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self {
            name: None,
            reservation: None,
            scopes: vec![InitScope::Thread],
            depth: None,
        }
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn reservation(mut self, reservation: Reservation) -> Self {
        self.reservation = Some(reservation);
        self
    }

    pub fn scopes(mut self, scopes: Vec<InitScope>) -> Self {
        self.scopes = scopes;
        self
    }

    pub(crate) fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// What a worker body sees while it runs.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    record: WorkerRecord,
}

impl WorkerContext {
    pub fn id(&self) -> WorkerId {
        self.record.id()
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn token(&self) -> &CancellationToken {
        self.record.cancellation_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_triggered()
    }

    /// Cancellation checkpoint.
    pub fn check(&self) -> Result<()> {
        self.token().check()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.token().wait(timeout)
    }

    pub fn init_result<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.record.init_result(name)
    }

    pub fn record(&self) -> &WorkerRecord {
        &self.record
    }
}

struct Tracked {
    record: WorkerRecord,
    thread: Option<JoinHandle<()>>,
}

/// Owns the workers of one process.
///
/// Worker bodies are cancelled cooperatively: [`cancel`](Self::cancel) only
/// triggers the worker's token. Threads cannot be killed, so a worker that
/// never cooperates is abandoned by [`shutdown`](Self::shutdown) and its
/// thread is leaked.
pub struct WorkerManager {
    registry: Arc<InitializerRegistry>,
    clock: Arc<dyn Clock>,
    config: Config,
    panic_handler: Arc<PanicHandler>,
    reservations: Arc<ReservationTable>,
    workers: Mutex<BTreeMap<WorkerId, Tracked>>,
}

impl WorkerManager {
    pub fn new(registry: Arc<InitializerRegistry>) -> Self {
        Self::with_config(registry, system_clock(), Config::default())
    }

    pub fn with_clock(registry: Arc<InitializerRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(registry, clock, Config::default())
    }

    pub fn with_config(registry: Arc<InitializerRegistry>, clock: Arc<dyn Clock>, config: Config) -> Self {
        let panic_handler = Arc::new(PanicHandler::new(config.panic_strategy));
        Self {
            registry,
            clock,
            config,
            panic_handler,
            reservations: Arc::new(ReservationTable::default()),
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<InitializerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn a worker running thread-scope initializers, then `body`.
    pub fn spawn<F, R>(&self, name: &str, body: F) -> Result<WorkerRecord>
    where
        F: FnOnce(&WorkerContext) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.spawn_with(SpawnOptions::new().name(name), body)
    }

    /// Spawn a worker.
    ///
    /// Blocks until the worker's initializers have run. If one fails the
    /// record is left in `Error`, any reservation is released and the
    /// failure is returned here.
    pub fn spawn_with<F, R>(&self, options: SpawnOptions, body: F) -> Result<WorkerRecord>
    where
        F: FnOnce(&WorkerContext) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let SpawnOptions {
            name,
            reservation,
            scopes,
            depth: worker_depth,
        } = options;

        let record = WorkerRecord::new(
            name.unwrap_or_else(|| self.config.thread_name_prefix.clone()),
            reservation,
            self.clock.clone(),
        );
        let id = record.id();

        if let Some(r) = reservation {
            self.reservations.claim(r, id)?;
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let worker_depth = worker_depth.unwrap_or_else(depth::current_depth);

        let worker = record.clone();
        let registry = self.registry.clone();
        let reservations = self.reservations.clone();
        let handler = self.panic_handler.clone();

        let mut builder = thread::Builder::new().name(record.name().to_string());
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let spawned = builder.spawn(move || {
            let _depth = depth::enter(worker_depth);
            worker.set_thread_id(thread::current().id());

            let mut init_results = HashMap::new();
            for scope in scopes {
                match registry.execute_all(scope) {
                    Ok(values) => init_results.extend(values),
                    Err(err) => {
                        worker.fail_startup(ErrorInfo::from(&err), Some(&*reservations));
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                }
            }

            worker.start(init_results);
            let _ = ready_tx.send(Ok(()));

            let ctx = WorkerContext {
                record: worker.clone(),
            };
            let outcome = match handler.execute(|| body(&ctx)) {
                Ok(Ok(value)) => Ok(Box::new(value) as Box<dyn Any + Send>),
                Ok(Err(err)) => Err(ErrorInfo::from(&err)),
                Err(panicked) => Err(panicked),
            };

            if let Err(err) = &outcome {
                tracing::debug!(worker = %id, error = %err, "worker body failed");
            }

            worker.finish(outcome, Some(&*reservations));
        });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                if let Some(r) = reservation {
                    self.reservations.release(r, id);
                }
                return Err(Error::spawn(format!("{}: {}", record.name(), e)));
            }
        };

        self.workers.lock().insert(
            id,
            Tracked {
                record: record.clone(),
                thread: Some(thread),
            },
        );

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!(worker = %id, name = record.name(), ?reservation, "spawned worker");
                Ok(record)
            }
            Ok(Err(err)) => {
                self.join_thread(id);
                Err(err)
            }
            Err(_) => Err(Error::spawn(format!(
                "{}: worker exited during startup",
                record.name()
            ))),
        }
    }

    /// Request cooperative cancellation. Never blocks.
    pub fn cancel(&self, id: WorkerId) -> Result<()> {
        let record = self.record(id).ok_or(Error::UnknownWorker(id))?;
        if record.request_cancel() {
            tracing::debug!(worker = %id, "cancellation requested");
        }
        Ok(())
    }

    pub fn cancel_all(&self) {
        for record in self.records() {
            if record.request_cancel() {
                tracing::debug!(worker = %record.id(), "cancellation requested");
            }
        }
    }

    /// Wait up to `timeout` (forever if `None`) for the worker to reach a
    /// terminal state. Returns whether it did.
    pub fn join(&self, id: WorkerId, timeout: Option<Duration>) -> Result<bool> {
        let record = self.record(id).ok_or(Error::UnknownWorker(id))?;
        record.mark_stopping();

        let done = record.wait(timeout);
        if done {
            self.join_thread(id);
        }
        Ok(done)
    }

    /// Remove a terminal worker and hand back its record.
    pub fn reap(&self, id: WorkerId) -> Result<WorkerRecord> {
        let tracked = {
            let mut workers = self.workers.lock();
            let tracked = workers.get(&id).ok_or(Error::UnknownWorker(id))?;
            let state = tracked.record.state();
            if !state.is_terminal() {
                return Err(Error::NotTerminal { worker: id, state });
            }
            workers.remove(&id)
        };

        let Some(mut tracked) = tracked else {
            return Err(Error::UnknownWorker(id));
        };

        if let Some(r) = tracked.record.reservation() {
            self.reservations.release(r, id);
        }
        if !is_abandoned(&tracked.record) {
            if let Some(thread) = tracked.thread.take() {
                let _ = thread.join();
            }
        }

        tracing::trace!(worker = %id, "reaped worker");
        Ok(tracked.record)
    }

    /// Cancel everything, give workers `grace` to stop, abandon the rest.
    /// Returns the abandoned workers.
    pub fn shutdown(&self, grace: Duration) -> Vec<WorkerId> {
        self.cancel_all();

        // `None` when the grace period is too long to represent: wait forever.
        let deadline = Instant::now().checked_add(grace);
        let mut abandoned = Vec::new();

        for record in self.records() {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if record.wait(remaining) {
                self.join_thread(record.id());
                continue;
            }

            if record.abandon(grace) {
                tracing::warn!(
                    worker = %record.id(),
                    name = record.name(),
                    ?grace,
                    "worker ignored cancellation, abandoning its thread"
                );
                // Detach: the thread keeps running until its body returns.
                if let Some(tracked) = self.workers.lock().get_mut(&record.id()) {
                    tracked.thread.take();
                }
                abandoned.push(record.id());
            }
        }

        abandoned
    }

    pub fn record(&self, id: WorkerId) -> Option<WorkerRecord> {
        self.workers.lock().get(&id).map(|t| t.record.clone())
    }

    /// All tracked records in spawn order.
    pub fn records(&self) -> Vec<WorkerRecord> {
        self.workers.lock().values().map(|t| t.record.clone()).collect()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Workers not yet in a terminal state.
    pub fn live_count(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|t| !t.record.is_terminal())
            .count()
    }

    pub fn reserved(&self) -> Vec<(Reservation, WorkerId)> {
        self.reservations.snapshot()
    }

    pub fn panic_count(&self) -> usize {
        self.panic_handler.panic_count()
    }

    fn join_thread(&self, id: WorkerId) {
        let thread = self
            .workers
            .lock()
            .get_mut(&id)
            .and_then(|t| t.thread.take());
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

fn is_abandoned(record: &WorkerRecord) -> bool {
    record
        .error()
        .map(|e| e.kind == crate::error::ErrorKind::CancellationTimeout)
        .unwrap_or(false)
}

impl fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerManager")
            .field("workers", &self.len())
            .field("live", &self.live_count())
            .field("reserved", &self.reserved())
            .finish()
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        if self.live_count() > 0 {
            self.shutdown(self.config.cancel_grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::worker::WorkerState;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager() -> WorkerManager {
        WorkerManager::new(Arc::new(InitializerRegistry::new()))
    }

    #[test]
    fn test_spawn_join_reap() {
        let m = manager();
        let record = m.spawn("adder", |_| Ok(2 + 2)).unwrap();

        assert!(m.join(record.id(), Some(Duration::from_secs(5))).unwrap());
        assert_eq!(record.state(), WorkerState::Completed);
        assert!(record.execution_completed());

        let reaped = m.reap(record.id()).unwrap();
        assert_eq!(reaped.take_result::<i32>(), Some(4));
        assert!(m.is_empty());
    }

    #[test]
    fn test_reap_running_worker_fails() {
        let m = manager();
        let record = m
            .spawn("waiter", |ctx| {
                ctx.wait(None);
                ctx.check()
            })
            .unwrap();

        assert!(matches!(m.reap(record.id()), Err(Error::NotTerminal { .. })));

        m.cancel(record.id()).unwrap();
        assert!(m.join(record.id(), Some(Duration::from_secs(5))).unwrap());
        assert!(m.reap(record.id()).is_ok());
    }

    #[test]
    fn test_cancel_is_cooperative() {
        let m = manager();
        let record = m
            .spawn("loop", |ctx| -> Result<()> {
                loop {
                    ctx.check()?;
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();

        m.cancel(record.id()).unwrap();
        assert!(m.join(record.id(), Some(Duration::from_secs(5))).unwrap());
        assert_eq!(record.state(), WorkerState::Cancelled);
        assert!(record.history().contains(&WorkerState::Cancelling));
        assert!(record.error().is_none());
    }

    #[test]
    fn test_body_error_is_captured() {
        let m = manager();
        let record = m
            .spawn("fails", |_| -> Result<()> { Err(Error::other("disk full")) })
            .unwrap();

        assert!(m.join(record.id(), Some(Duration::from_secs(5))).unwrap());
        assert_eq!(record.state(), WorkerState::Error);
        let err = record.error().unwrap();
        assert_eq!(err.kind, ErrorKind::Failed);
        assert!(err.message.contains("disk full"));
    }

    #[test]
    fn test_body_panic_is_captured() {
        let m = WorkerManager::with_config(
            Arc::new(InitializerRegistry::new()),
            system_clock(),
            Config::builder()
                .panic_strategy(crate::worker::PanicStrategy::Isolate)
                .build()
                .unwrap(),
        );
        let record = m.spawn("panics", |_| -> Result<()> { panic!("oops") }).unwrap();

        assert!(m.join(record.id(), Some(Duration::from_secs(5))).unwrap());
        assert_eq!(record.state(), WorkerState::Error);
        assert_eq!(record.error().unwrap().kind, ErrorKind::Panicked);
        assert!(!record.execution_completed());
        assert_eq!(m.panic_count(), 1);
    }

    #[test]
    fn test_join_unknown_worker() {
        let m = manager();
        assert!(matches!(
            m.join(WorkerId(u64::MAX), None),
            Err(Error::UnknownWorker(_))
        ));
    }

    #[test]
    fn test_reservation_released_after_exit() {
        let m = manager();
        let first = m
            .spawn_with(
                SpawnOptions::new().name("bridge").reservation(Reservation::BridgeThread),
                |_| Ok(()),
            )
            .unwrap();
        assert!(m.join(first.id(), Some(Duration::from_secs(5))).unwrap());
        assert!(m.reserved().is_empty());

        let second = m.spawn_with(
            SpawnOptions::new().name("bridge").reservation(Reservation::BridgeThread),
            |_| Ok(()),
        );
        assert!(second.is_ok());
    }

    #[test]
    fn test_shutdown_abandons_uncooperative_worker() {
        let m = manager();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();

        let stubborn = m
            .spawn("stubborn", move |_| {
                while !stop_clone.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })
            .unwrap();
        let polite = m
            .spawn("polite", |ctx| {
                ctx.wait(None);
                ctx.check()
            })
            .unwrap();

        let abandoned = m.shutdown(Duration::from_millis(50));
        assert_eq!(abandoned, vec![stubborn.id()]);

        assert_eq!(polite.state(), WorkerState::Cancelled);
        assert_eq!(stubborn.state(), WorkerState::Error);
        let err = stubborn.error().unwrap();
        assert_eq!(err.kind, ErrorKind::CancellationTimeout);
        assert_eq!(err.exit_code(), 137);

        // Late completion does not resurrect the record.
        stop.store(true, Ordering::Release);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stubborn.state(), WorkerState::Error);
        assert!(m.reap(stubborn.id()).is_ok());
    }

    #[test]
    fn test_initializer_failure_fails_spawn() {
        let registry = Arc::new(InitializerRegistry::new());
        registry
            .register(InitScope::Thread, "license", || -> Result<()> {
                Err(Error::other("license server unreachable"))
            })
            .unwrap();
        let m = WorkerManager::new(registry);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let err = m
            .spawn_with(
                SpawnOptions::new().name("bridge").reservation(Reservation::BridgeCommunication),
                move |_| {
                    ran_clone.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InitializerFailure { ref name, scope: InitScope::Thread, .. } if name == "license"
        ));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(m.reserved().is_empty());

        let records = m.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.state(), WorkerState::Error);
        assert!(!record.execution_completed());
        assert_eq!(record.error().unwrap().kind, ErrorKind::Initializer);
        assert!(m.record(record.id()).is_some());
    }

    #[test]
    fn test_unrepresentable_timeouts() {
        let m = manager();
        let done = m.spawn("quick", |_| Ok(())).unwrap();
        assert!(m.join(done.id(), Some(Duration::MAX)).unwrap());

        let polite = m
            .spawn("polite", |ctx| {
                ctx.wait(None);
                ctx.check()
            })
            .unwrap();
        assert!(m.shutdown(Duration::MAX).is_empty());
        assert_eq!(polite.state(), WorkerState::Cancelled);
    }
}
