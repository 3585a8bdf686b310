//! Cooperative cancellation.
//!
//! A [`CancellationToken`] only *requests* that work stops. The body holding
//! the token decides where it is safe to stop and calls
//! [`check`](CancellationToken::check) or [`wait`](CancellationToken::wait)
//! there. Nothing in this crate polls the token on the body's behalf.

use crate::error::{Error, Result};
use crate::util::clock::{system_clock, Clock};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Inner {
    triggered: AtomicBool,
    triggered_at: Mutex<Option<Instant>>,
    signal: Condvar,
    clock: Arc<dyn Clock>,
}

/// Stop signal shared between one owner and any number of readers.
///
/// Clones share the same underlying flag. Once triggered it stays triggered.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                triggered_at: Mutex::new(None),
                signal: Condvar::new(),
                clock,
            }),
        }
    }

    /// Request cancellation. Calling it again is a no-op.
    pub fn trigger(&self) {
        let mut at = self.inner.triggered_at.lock();
        if at.is_some() {
            return;
        }
        *at = Some(self.inner.clock.now());
        self.inner.triggered.store(true, Ordering::Release);
        self.inner.signal.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// When the token was first triggered.
    pub fn triggered_at(&self) -> Option<Instant> {
        *self.inner.triggered_at.lock()
    }

    /// Checkpoint for task bodies: `Err(CancellationRequested)` once triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(Error::CancellationRequested)
        } else {
            Ok(())
        }
    }

    /// Block until triggered or until `timeout` elapses. `None` waits forever.
    /// Returns whether the token was triggered.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut at = self.inner.triggered_at.lock();
        // A deadline past what `Instant` can represent means no deadline.
        match timeout.and_then(|t| Instant::now().checked_add(t)) {
            None => {
                while at.is_none() {
                    self.inner.signal.wait(&mut at);
                }
                true
            }
            Some(deadline) => {
                while at.is_none() {
                    if self.inner.signal.wait_until(&mut at, deadline).timed_out() {
                        break;
                    }
                }
                at.is_some()
            }
        }
    }

    /// Whether two handles refer to the same token.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("triggered", &self.is_triggered())
            .field("triggered_at", &self.triggered_at())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_starts_untriggered() {
        let token = CancellationToken::new();
        assert!(!token.is_triggered());
        assert!(token.triggered_at().is_none());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let token = CancellationToken::new();
        token.trigger();
        let first = token.triggered_at();
        assert!(first.is_some());

        thread::sleep(Duration::from_millis(5));
        token.trigger();

        assert!(token.is_triggered());
        assert_eq!(token.triggered_at(), first);
    }

    #[test]
    fn test_check_after_trigger() {
        let token = CancellationToken::new();
        token.trigger();
        assert!(matches!(token.check(), Err(Error::CancellationRequested)));
    }

    #[test]
    fn test_wait_times_out() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.wait(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_wakes_on_trigger_from_other_thread() {
        let token = CancellationToken::new();
        let remote = token.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.trigger();
        });

        assert!(token.wait(Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }

    #[test]
    fn test_many_readers() {
        let token = CancellationToken::new();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let t = token.clone();
                thread::spawn(move || t.wait(None))
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        token.trigger();

        for r in readers {
            assert!(r.join().unwrap());
        }
    }

    #[test]
    fn test_clones_share_state() {
        let a = CancellationToken::new();
        let b = a.clone();
        assert!(a.same_as(&b));
        b.trigger();
        assert!(a.is_triggered());
        assert!(!a.same_as(&CancellationToken::new()));
    }

    #[test]
    fn test_wait_with_unrepresentable_timeout() {
        let token = CancellationToken::new();
        token.trigger();
        assert!(token.wait(Some(Duration::MAX)));

        let pending = CancellationToken::new();
        let remote = pending.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.trigger();
        });
        assert!(pending.wait(Some(Duration::MAX)));
        h.join().unwrap();
    }
}
