//! Allocation checkpoints and failure injection.
//!
//! Rust aborts on real allocation failure, so the runtime exposes explicit
//! checkpoints at the places where it allocates on behalf of the caller (task
//! spawn, smp items, fair queue entries, semaphore waiters, fifo entries).
//! Each checkpoint consults a thread-local [`FailureInjector`] which tests arm
//! with [`FailureInjector::fail_after`] to exhaustively fail the Nth
//! allocation and check that no structure is left half-updated.
use crate::error::{Error, Result};
use std::cell::RefCell;

thread_local! {
    static INJECTOR: RefCell<FailureInjector> = const { RefCell::new(FailureInjector::new()) };
}

#[derive(Debug, Default)]
pub struct FailureInjector {
    alloc_count: u64,
    fail_at: Option<u64>,
    failed: bool,
}

impl FailureInjector {
    const fn new() -> Self {
        Self {
            alloc_count: 0,
            fail_at: None,
            failed: false,
        }
    }

    /// Fail the allocation `n` checkpoints from now (0 fails the next one).
    pub fn fail_after(&mut self, n: u64) {
        self.fail_at = Some(self.alloc_count + n);
        self.failed = false;
    }

    /// Disarm the injector.
    pub fn cancel(&mut self) {
        self.fail_at = None;
    }

    /// True if the armed failure fired since the last `fail_after`.
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn alloc_count(&self) -> u64 {
        self.alloc_count
    }

    fn on_alloc_point(&mut self) -> Result<()> {
        let current = self.alloc_count;
        self.alloc_count += 1;

        if self.fail_at == Some(current) {
            self.fail_at = None;
            self.failed = true;
            return Err(Error::AllocationFailed);
        }

        Ok(())
    }
}

/// Called before every allocation performed on behalf of a caller.
#[inline]
pub fn on_alloc_point() -> Result<()> {
    INJECTOR.with(|inj| inj.borrow_mut().on_alloc_point())
}

/// Run `f` with this thread's injector.
pub fn with_failure_injector<F, R>(f: F) -> R
where
    F: FnOnce(&mut FailureInjector) -> R,
{
    INJECTOR.with(|inj| f(&mut inj.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_after_fires_once() {
        with_failure_injector(|inj| inj.fail_after(2));

        assert!(on_alloc_point().is_ok());
        assert!(on_alloc_point().is_ok());
        assert_eq!(on_alloc_point(), Err(Error::AllocationFailed));
        assert!(on_alloc_point().is_ok());

        assert!(with_failure_injector(|inj| inj.failed()));
    }

    #[test]
    fn test_cancel_disarms() {
        with_failure_injector(|inj| {
            inj.fail_after(0);
            inj.cancel();
        });

        assert!(on_alloc_point().is_ok());
        assert!(!with_failure_injector(|inj| inj.failed()));
    }
}
