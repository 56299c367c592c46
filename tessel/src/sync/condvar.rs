use crate::error::{Error, Result};
use crate::future::{failed, promise, Deferred, Promise};
use crate::sync::{ExpiringFifo, FifoKey};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

struct CondvarState {
    broken: Cell<bool>,
    waiters: ExpiringFifo<Promise<()>>,
}

impl CondvarState {
    fn signal(&self) -> bool {
        while let Some(p) = self.waiters.pop_front() {
            if !p.is_orphaned() {
                p.set_value(());
                return true;
            }
        }
        false
    }
}

/// Lets tasks of one core wait for a notification.
///
/// A signal with nobody waiting is lost, so callers re-check their
/// condition after waking, as [`ConditionVariable::wait_until`] does.
#[derive(Clone)]
pub struct ConditionVariable {
    state: Rc<CondvarState>,
}

/// Future returned by [`ConditionVariable::wait`].
#[must_use = "futures do nothing unless awaited"]
pub struct CondvarWait {
    deferred: Deferred<()>,
    queued: Option<(Weak<CondvarState>, FifoKey)>,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self {
            state: Rc::new(CondvarState {
                broken: Cell::new(false),
                waiters: ExpiringFifo::new(|p: Promise<()>| p.set_error(Error::TimedOut)),
            }),
        }
    }

    /// Waits for the next signal.
    pub fn wait(&self) -> CondvarWait {
        self.enqueue(None)
    }

    /// Waits for the next signal, failing with [`Error::TimedOut`] once
    /// `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) -> CondvarWait {
        self.enqueue(Some(Instant::now() + timeout))
    }

    pub fn wait_deadline(&self, deadline: Instant) -> CondvarWait {
        self.enqueue(Some(deadline))
    }

    /// Waits until `pred` holds, checking it first and after every signal.
    pub async fn wait_until(&self, mut pred: impl FnMut() -> bool) -> Result<()> {
        while !pred() {
            self.wait().await?;
        }
        Ok(())
    }

    fn enqueue(&self, deadline: Option<Instant>) -> CondvarWait {
        if self.state.broken.get() {
            return CondvarWait::done(failed(Error::ConditionVariableBroken));
        }

        let (p, deferred) = promise();
        match self.state.waiters.push_back(p, deadline) {
            Ok(key) => CondvarWait {
                deferred,
                queued: Some((Rc::downgrade(&self.state), key)),
            },
            Err(e) => CondvarWait::done(failed(e)),
        }
    }

    /// Wakes the oldest waiter. Returns false if nobody was waiting.
    pub fn signal(&self) -> bool {
        self.state.signal()
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        for p in self.state.waiters.drain() {
            p.set_value(());
        }
    }

    /// Fails every current and future waiter with
    /// [`Error::ConditionVariableBroken`].
    pub fn broken(&self) {
        self.state.broken.set(true);
        for p in self.state.waiters.drain() {
            p.set_error(Error::ConditionVariableBroken);
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.state.waiters.is_empty()
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.state.waiters)
            .field("broken", &self.state.broken.get())
            .finish()
    }
}

impl CondvarWait {
    fn done(deferred: Deferred<()>) -> Self {
        Self {
            deferred,
            queued: None,
        }
    }
}

impl Future for CondvarWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.deferred).poll(cx);
        if res.is_ready() {
            this.queued = None;
        }
        res
    }
}

impl Drop for CondvarWait {
    fn drop(&mut self) {
        let Some((state, key)) = self.queued.take() else {
            return;
        };
        let Some(state) = state.upgrade() else {
            return;
        };
        if state.waiters.remove(key).is_none() {
            if let Some(Ok(())) = self.deferred.try_take() {
                // Pass on a signal nobody observed.
                state.signal();
            }
        }
    }
}

impl fmt::Debug for CondvarWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondvarWait")
            .field("deferred", &self.deferred)
            .finish()
    }
}
