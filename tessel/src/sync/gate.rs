use crate::error::{Error, Result};
use crate::future::{promise, ready, Deferred, Promise};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

#[derive(Default)]
struct GateState {
    count: Cell<usize>,
    closed: Cell<bool>,
    closer: RefCell<Option<Promise<()>>>,
}

impl GateState {
    fn leave(&self) {
        let count = self.count.get();
        assert!(count > 0, "gate left more often than entered");
        self.count.set(count - 1);

        if count == 1 && self.closed.get() {
            let closer = self.closer.borrow_mut().take();
            if let Some(p) = closer {
                p.set_value(());
            }
        }
    }
}

/// Counts in-flight work so shutdown can wait for all of it.
///
/// Once [`Gate::close`] was called no new entry is admitted, and the returned
/// future resolves when the last one leaves.
#[derive(Clone, Default)]
pub struct Gate {
    state: Rc<GateState>,
}

/// One entry into a [`Gate`], left on drop.
#[must_use = "dropping the holder leaves the gate immediately"]
pub struct GateHolder {
    state: Rc<GateState>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters, failing with [`Error::GateClosed`] once closed. Every
    /// successful call must be matched by a [`Gate::leave`].
    pub fn enter(&self) -> Result<()> {
        if self.try_enter() {
            Ok(())
        } else {
            Err(Error::GateClosed)
        }
    }

    pub fn try_enter(&self) -> bool {
        if self.state.closed.get() {
            return false;
        }
        self.state.count.set(self.state.count.get() + 1);
        true
    }

    /// # Panics
    ///
    /// Panics when nobody is inside.
    #[track_caller]
    pub fn leave(&self) {
        self.state.leave();
    }

    /// Enters and returns a holder that leaves on drop.
    pub fn hold(&self) -> Result<GateHolder> {
        self.enter()?;
        Ok(GateHolder {
            state: Rc::clone(&self.state),
        })
    }

    pub fn try_hold(&self) -> Option<GateHolder> {
        self.try_enter().then(|| GateHolder {
            state: Rc::clone(&self.state),
        })
    }

    /// Refuses further entries and resolves once everyone left.
    ///
    /// # Panics
    ///
    /// Panics when the gate was closed already.
    #[track_caller]
    pub fn close(&self) -> Deferred<()> {
        assert!(
            !self.state.closed.get(),
            "gate closed twice, close() must be called only once"
        );
        self.state.closed.set(true);

        if self.state.count.get() == 0 {
            return ready(());
        }
        let (p, d) = promise();
        *self.state.closer.borrow_mut() = Some(p);
        tracing::trace!(inside = self.state.count.get(), "gate closing");
        d
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// How many are inside.
    pub fn count(&self) -> usize {
        self.state.count.get()
    }

    /// Fails with [`Error::GateClosed`] once closed. For long running work
    /// that holds the gate and should stop early.
    pub fn check(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::GateClosed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("count", &self.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl GateHolder {
    /// Leaves before the holder goes out of scope.
    pub fn release(self) {}

    /// Enters the same gate again. `None` once the gate is closed, like
    /// [`Gate::try_hold`].
    pub fn try_clone(&self) -> Option<GateHolder> {
        if self.state.closed.get() {
            return None;
        }
        self.state.count.set(self.state.count.get() + 1);
        Some(GateHolder {
            state: Rc::clone(&self.state),
        })
    }
}

impl Drop for GateHolder {
    fn drop(&mut self) {
        self.state.leave();
    }
}

impl fmt::Debug for GateHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateHolder")
            .field("count", &self.state.count.get())
            .finish()
    }
}

/// Runs `f` inside `gate`, failing with [`Error::GateClosed`] without running
/// it once the gate is closed.
pub async fn with_gate<F, Fut, R>(gate: &Gate, f: F) -> Result<R>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let _holder = gate.hold()?;
    Ok(f().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use crate::{sleep, spawn, yield_now};
    use anyhow::Result;
    use std::time::Duration;

    #[tessel::test]
    async fn test_close_waits_for_holders() -> Result<()> {
        let gate = Gate::new();
        let done = Rc::new(Cell::new(0));

        let handles: Vec<_> = (1..=3u64)
            .map(|i| {
                let (gate, done) = (gate.clone(), Rc::clone(&done));
                spawn(async move {
                    with_gate(&gate, || async {
                        sleep(Duration::from_millis(i)).await;
                        done.set(done.get() + 1);
                    })
                    .await
                })
            })
            .collect();
        yield_now().await;
        assert_eq!(gate.count(), 3);

        gate.close().await?;
        assert_eq!(done.get(), 3);
        assert_eq!(gate.count(), 0);
        for h in handles {
            h.await??;
        }
        Ok(())
    }

    #[tessel::test]
    async fn test_closed_gate_refuses_entry() -> Result<()> {
        let gate = Gate::new();
        let holder = gate.hold()?;
        let closing = gate.close();

        assert!(gate.is_closed());
        assert!(!gate.try_enter());
        assert_eq!(gate.enter(), Err(Error::GateClosed));
        assert_eq!(gate.check(), Err(Error::GateClosed));
        assert!(!closing.available());

        // A draining gate cannot be extended through a holder.
        assert!(holder.try_clone().is_none());
        assert_eq!(gate.count(), 1);
        holder.release();
        closing.await?;
        Ok(())
    }

    #[tessel::test]
    async fn test_holder_copies_count_until_close() -> Result<()> {
        let gate = Gate::new();
        let holder = gate.hold()?;
        let copy = holder.try_clone().expect("gate is open");
        assert_eq!(gate.count(), 2);

        drop(holder);
        let closing = gate.close();
        assert!(!closing.available());
        assert!(copy.try_clone().is_none());

        copy.release();
        closing.await?;
        Ok(())
    }

    #[test]
    fn test_close_empty_gate_is_ready() {
        let gate = Gate::new();
        assert!(gate.close().available());
        assert!(!gate.try_enter());
    }

    #[test]
    #[should_panic(expected = "gate closed twice")]
    fn test_close_twice_panics() {
        let gate = Gate::new();
        let _ = gate.close();
        let _ = gate.close();
    }

    #[test]
    #[should_panic(expected = "left more often than entered")]
    fn test_unbalanced_leave_panics() {
        Gate::new().leave();
    }
}
