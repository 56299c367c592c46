use crate::error::{Error, Result};
use crate::future::{failed, promise, ready, Deferred, Promise};
use crate::sync::{abortable, AbortSource, ExpiringFifo, FifoKey};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

struct Waiter {
    units: isize,
    promise: Promise<()>,
}

struct SemaphoreState {
    count: Cell<isize>,
    broken: RefCell<Option<Error>>,
    waiters: ExpiringFifo<Waiter>,
}

impl SemaphoreState {
    /// Grants units to waiters in arrival order. A waiter that does not fit
    /// blocks everyone behind it.
    fn wake_waiters(&self) {
        loop {
            let count = self.count.get();
            let Some(w) = self
                .waiters
                .pop_front_if(|w| w.promise.is_orphaned() || w.units <= count)
            else {
                return;
            };
            if w.promise.is_orphaned() {
                continue;
            }
            self.count.set(count - w.units);
            w.promise.set_value(());
        }
    }

    fn signal(&self, units: isize) {
        self.count.set(self.count.get().saturating_add(units));
        self.wake_waiters();
    }
}

/// A counting semaphore for tasks of one core.
///
/// Waiters are served strictly in arrival order. The count is signed so
/// [`Semaphore::consume`] can take units that are not there yet.
#[derive(Clone)]
pub struct Semaphore {
    state: Rc<SemaphoreState>,
}

/// Future returned by the `wait` family of [`Semaphore`]. Dropping it before
/// it resolves gives up the place in line.
#[must_use = "futures do nothing unless awaited"]
pub struct SemaphoreWait {
    deferred: Deferred<()>,
    queued: Option<(Weak<SemaphoreState>, FifoKey, isize)>,
}

fn to_units(units: usize) -> isize {
    isize::try_from(units).unwrap_or(isize::MAX)
}

impl Semaphore {
    /// The largest count a semaphore can hold.
    pub const MAX_UNITS: usize = isize::MAX as usize;

    pub fn new(count: usize) -> Self {
        let state = Rc::new_cyclic(|weak: &Weak<SemaphoreState>| {
            let weak = weak.clone();
            SemaphoreState {
                count: Cell::new(to_units(count)),
                broken: RefCell::new(None),
                waiters: ExpiringFifo::new(move |w: Waiter| {
                    w.promise.set_error(Error::TimedOut);
                    // The expired waiter may have been blocking others.
                    if let Some(state) = weak.upgrade() {
                        state.wake_waiters();
                    }
                }),
            }
        });
        Self { state }
    }

    /// Waits until `units` are available and takes them.
    pub fn wait(&self, units: usize) -> SemaphoreWait {
        self.enqueue(to_units(units), None)
    }

    /// Like [`Semaphore::wait`], failing with [`Error::TimedOut`] after
    /// `timeout`.
    pub fn wait_timeout(&self, units: usize, timeout: Duration) -> SemaphoreWait {
        self.wait_until(units, Instant::now() + timeout)
    }

    pub fn wait_until(&self, units: usize, deadline: Instant) -> SemaphoreWait {
        self.enqueue(to_units(units), Some(deadline))
    }

    /// Like [`Semaphore::wait`], failing with [`Error::AbortRequested`] when
    /// `abort` fires first.
    pub async fn wait_abortable(&self, units: usize, abort: &AbortSource) -> Result<()> {
        abortable(self.wait(units), abort).await?
    }

    fn enqueue(&self, units: isize, deadline: Option<Instant>) -> SemaphoreWait {
        if let Some(err) = self.state.broken.borrow().clone() {
            return SemaphoreWait::done(failed(err));
        }

        if self.state.waiters.is_empty() && self.state.count.get() >= units {
            self.state.count.set(self.state.count.get() - units);
            return SemaphoreWait::done(ready(()));
        }

        let (promise, deferred) = promise();
        match self.state.waiters.push_back(Waiter { units, promise }, deadline) {
            Ok(key) => SemaphoreWait {
                deferred,
                queued: Some((Rc::downgrade(&self.state), key, units)),
            },
            Err(e) => SemaphoreWait::done(failed(e)),
        }
    }

    /// Takes `units` if they are available right now and nobody is waiting.
    pub fn try_wait(&self, units: usize) -> bool {
        let units = to_units(units);
        let count = self.state.count.get();
        if self.state.broken.borrow().is_none() && self.state.waiters.is_empty() && count >= units
        {
            self.state.count.set(count - units);
            true
        } else {
            false
        }
    }

    pub fn signal(&self, units: usize) {
        self.state.signal(to_units(units));
    }

    /// Takes `units` without waiting, possibly driving the count negative.
    pub fn consume(&self, units: usize) {
        let count = self.state.count.get();
        self.state.count.set(count.saturating_sub(to_units(units)));
    }

    /// The current count. Negative after over-consuming.
    pub fn available_units(&self) -> isize {
        self.state.count.get()
    }

    pub fn waiters(&self) -> usize {
        self.state.waiters.len()
    }

    /// Fails every current and future waiter with
    /// [`Error::SemaphoreBroken`].
    pub fn broken(&self, reason: impl Into<String>) {
        self.break_with(Error::SemaphoreBroken(reason.into()));
    }

    pub(crate) fn break_with(&self, err: Error) {
        *self.state.broken.borrow_mut() = Some(err.clone());
        let waiters = self.state.waiters.drain();
        tracing::debug!(waiters = waiters.len(), error = %err, "semaphore broken");
        for w in waiters {
            w.promise.set_error(err.clone());
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.state.count.get())
            .field("waiters", &self.state.waiters)
            .field("broken", &self.state.broken.borrow().is_some())
            .finish()
    }
}

impl SemaphoreWait {
    fn done(deferred: Deferred<()>) -> Self {
        Self {
            deferred,
            queued: None,
        }
    }
}

impl Future for SemaphoreWait {
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

impl Drop for SemaphoreWait {
    fn drop(&mut self) {
        let Some((state, key, units)) = self.queued.take() else {
            return;
        };
        let Some(state) = state.upgrade() else {
            return;
        };

        if state.waiters.remove(key).is_some() {
            // Leaving the head of the line may let the next waiter through.
            state.wake_waiters();
        } else if let Some(Ok(())) = self.deferred.try_take() {
            // Granted but never observed.
            state.signal(units);
        }
    }
}

impl fmt::Debug for SemaphoreWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreWait")
            .field("deferred", &self.deferred)
            .field("queued", &self.queued.is_some())
            .finish()
    }
}

/// Units taken from a [`Semaphore`], given back on drop.
#[must_use = "dropping the units returns them immediately"]
pub struct SemaphoreUnits {
    sem: Semaphore,
    units: usize,
}

/// Waits for `units` and wraps them so they return to `sem` on drop.
pub async fn get_units(sem: &Semaphore, units: usize) -> Result<SemaphoreUnits> {
    sem.wait(units).await?;
    Ok(SemaphoreUnits {
        sem: sem.clone(),
        units,
    })
}

/// Like [`get_units`], without waiting.
pub fn try_get_units(sem: &Semaphore, units: usize) -> Option<SemaphoreUnits> {
    sem.try_wait(units).then(|| SemaphoreUnits {
        sem: sem.clone(),
        units,
    })
}

/// Holds `units` of `sem` while `f` runs.
pub async fn with_semaphore<F, Fut, R>(sem: &Semaphore, units: usize, f: F) -> Result<R>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let _units = get_units(sem, units).await?;
    Ok(f().await)
}

impl SemaphoreUnits {
    pub fn count(&self) -> usize {
        self.units
    }

    /// Moves `units` of these into a holder of their own.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `units` are held.
    #[track_caller]
    pub fn split(&mut self, units: usize) -> SemaphoreUnits {
        assert!(
            units <= self.units,
            "cannot split {units} semaphore units out of {}",
            self.units
        );
        self.units -= units;
        SemaphoreUnits {
            sem: self.sem.clone(),
            units,
        }
    }

    /// Gives `units` back early.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `units` are held.
    #[track_caller]
    pub fn return_units(&mut self, units: usize) {
        assert!(
            units <= self.units,
            "cannot return {units} semaphore units out of {}",
            self.units
        );
        self.units -= units;
        self.sem.signal(units);
    }

    /// Gives everything back.
    pub fn return_all(&mut self) {
        let units = std::mem::take(&mut self.units);
        self.sem.signal(units);
    }

    /// Detaches the units from the holder; they will not be given back.
    pub fn release(mut self) -> usize {
        std::mem::take(&mut self.units)
    }
}

impl Drop for SemaphoreUnits {
    fn drop(&mut self) {
        if self.units > 0 {
            self.sem.signal(self.units);
        }
    }
}

impl fmt::Debug for SemaphoreUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreUnits")
            .field("units", &self.units)
            .finish()
    }
}
