use crate::error::{ErrorInfo, ErrorKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicStrategy {
    Abort,
    Isolate,
    #[default]
    LogAndContinue,
}

/// Runs worker and task bodies, turning panics into [`ErrorInfo`].
#[derive(Debug)]
pub struct PanicHandler {
    strategy: PanicStrategy,
    panic_count: AtomicUsize,
}

impl PanicHandler {
    pub fn new(strategy: PanicStrategy) -> Self {
        Self {
            strategy,
            panic_count: AtomicUsize::new(0),
        }
    }

    pub fn execute<F, R>(&self, f: F) -> Result<R, ErrorInfo>
    where
        F: FnOnce() -> R,
    {
        match capture(f) {
            Ok(result) => Ok(result),
            Err(info) => {
                self.panic_count.fetch_add(1, Ordering::Relaxed);

                match self.strategy {
                    PanicStrategy::Abort => {
                        tracing::error!(error = %info, "body panicked (abort strategy)");
                        std::process::abort();
                    }
                    PanicStrategy::Isolate => {}
                    PanicStrategy::LogAndContinue => {
                        tracing::warn!(error = %info, "body panicked");
                    }
                }

                Err(info)
            }
        }
    }

    pub fn panic_count(&self) -> usize {
        self.panic_count.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) {
        self.panic_count.store(0, Ordering::Relaxed);
    }

    pub fn strategy(&self) -> PanicStrategy {
        self.strategy
    }
}

impl Default for PanicHandler {
    fn default() -> Self {
        Self::new(PanicStrategy::default())
    }
}

/// Run `f`, catching a panic as an [`ErrorKind::Panicked`] error.
pub fn capture<F, R>(f: F) -> Result<R, ErrorInfo>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(from_payload)
}

fn from_payload(payload: Box<dyn std::any::Any + Send>) -> ErrorInfo {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };

    ErrorInfo::new(ErrorKind::Panicked, message)
}
