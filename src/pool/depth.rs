//! Pool nesting depth of the current thread.
//!
//! The top-level caller runs at depth 0. Slots of a pool created at depth
//! `d` run at `d + 1`, so a pool created from inside a task is one level
//! deeper than the pool running that task.

use crate::error::{Error, Result};
use std::cell::Cell;

/// Pools may only be created at a depth below this.
pub const MAX_DEPTH: usize = 2;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub fn current_depth() -> usize {
    DEPTH.with(|d| d.get())
}

/// `Ok(depth)` if a pool may be created on this thread.
pub(crate) fn check_can_nest() -> Result<usize> {
    let depth = current_depth();
    if depth >= MAX_DEPTH {
        return Err(Error::DepthLimitExceeded {
            depth,
            max: MAX_DEPTH,
        });
    }
    Ok(depth)
}

/// Sets this thread's depth until dropped.
#[derive(Debug)]
pub(crate) struct DepthGuard {
    previous: usize,
}

pub(crate) fn enter(depth: usize) -> DepthGuard {
    let previous = DEPTH.with(|d| d.replace(depth));
    DepthGuard { previous }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_depth() {
        assert_eq!(current_depth(), 0);
        assert_eq!(check_can_nest().unwrap(), 0);
    }

    #[test]
    fn test_guard_restores_depth() {
        {
            let _g = enter(1);
            assert_eq!(current_depth(), 1);
            assert!(check_can_nest().is_ok());
            {
                let _g = enter(MAX_DEPTH);
                assert!(matches!(
                    check_can_nest(),
                    Err(Error::DepthLimitExceeded { depth: 2, max: 2 })
                ));
            }
            assert_eq!(current_depth(), 1);
        }
        assert_eq!(current_depth(), 0);
    }
}
