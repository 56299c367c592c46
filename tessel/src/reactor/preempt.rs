//! Task quota tracking.
//!
//! The reactor arms a deadline before running a batch of tasks. Once it
//! passes, [`need_preempt`] turns true and cooperative checkpoints (ready
//! deferreds, [`maybe_yield`](crate::maybe_yield)) hand control back to the
//! scheduler.
use std::cell::Cell;
use std::time::{Duration, Instant};

thread_local! {
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
    static FORCED: Cell<bool> = const { Cell::new(false) };
}

/// True once the current quota slice is used up. Always false outside a
/// reactor slice.
#[inline]
pub fn need_preempt() -> bool {
    if FORCED.with(Cell::get) {
        return true;
    }

    DEADLINE.with(|d| d.get().is_some_and(|deadline| Instant::now() >= deadline))
}

/// Starts a new slice of `quota`. The slice ends when the guard drops.
pub(crate) fn arm(quota: Duration) -> SliceGuard {
    let prev = DEADLINE.with(|d| d.replace(Some(Instant::now() + quota)));
    SliceGuard { prev }
}

/// Forces `need_preempt` to report true until reset.
pub(crate) fn force(on: bool) {
    FORCED.with(|f| f.set(on));
}

#[must_use]
pub(crate) struct SliceGuard {
    prev: Option<Instant>,
}

impl Drop for SliceGuard {
    fn drop(&mut self) {
        DEADLINE.with(|d| d.set(self.prev));
        FORCED.with(|f| f.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_slice_never_preempts() {
        assert!(!need_preempt());
    }

    #[test]
    fn test_slice_expires() {
        let guard = arm(Duration::from_millis(2));
        assert!(!need_preempt());

        std::thread::sleep(Duration::from_millis(3));
        assert!(need_preempt());

        drop(guard);
        assert!(!need_preempt());
    }

    #[test]
    fn test_force_is_cleared_with_slice() {
        let guard = arm(Duration::from_secs(60));
        force(true);
        assert!(need_preempt());
        drop(guard);
        assert!(!need_preempt());
    }
}
