use crate::context;
use crate::error::{Error, Result};
use pin_project::pin_project;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    deadline: Instant,
    id: u64,
}

pub(crate) enum TimerAction {
    Wake(Waker),
    Callback(Weak<TimerState>),
}

/// Per-core ordered set of armed timers.
#[derive(Default)]
pub(crate) struct TimerSet {
    armed: BTreeMap<TimerKey, TimerAction>,
    next_id: u64,
}

impl TimerSet {
    pub(crate) fn insert(&mut self, deadline: Instant, action: TimerAction) -> TimerKey {
        let key = TimerKey {
            deadline,
            id: self.next_id,
        };
        self.next_id += 1;
        self.armed.insert(key, action);
        key
    }

    pub(crate) fn remove(&mut self, key: &TimerKey) -> bool {
        self.armed.remove(key).is_some()
    }

    pub(crate) fn update_waker(&mut self, key: &TimerKey, waker: &Waker) {
        if let Some(TimerAction::Wake(w)) = self.armed.get_mut(key) {
            if !w.will_wake(waker) {
                *w = waker.clone();
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.armed.first_key_value().map(|(k, _)| k.deadline)
    }

    /// Removes and returns every action due at `now`, earliest first.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut due = Vec::new();
        while let Some(entry) = self.armed.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.armed.len()
    }

    pub(crate) fn take_all(&mut self) -> BTreeMap<TimerKey, TimerAction> {
        std::mem::take(&mut self.armed)
    }
}

impl fmt::Debug for TimerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSet")
            .field("armed", &self.armed.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

/// Runs the fired actions. Must be called with no reactor borrows held.
pub(crate) fn fire(actions: Vec<TimerAction>) -> usize {
    let n = actions.len();
    for action in actions {
        match action {
            TimerAction::Wake(waker) => waker.wake(),
            TimerAction::Callback(state) => {
                if let Some(state) = state.upgrade() {
                    TimerState::fire(&state);
                }
            }
        }
    }
    n
}

pub(crate) struct TimerState {
    callback: RefCell<Box<dyn FnMut()>>,
    key: Cell<Option<TimerKey>>,
    period: Cell<Option<Duration>>,
}

impl TimerState {
    fn fire(self: &Rc<Self>) {
        let Some(key) = self.key.take() else {
            return;
        };

        if let Some(period) = self.period.get() {
            self.schedule(key.deadline + period);
        }

        // A callback re-entering its own timer (cancel/arm) is fine, the
        // callback cell itself must not be re-entered.
        match self.callback.try_borrow_mut() {
            Ok(mut cb) => (cb)(),
            Err(_) => tracing::warn!("timer callback re-entered, skipping"),
        }
    }

    fn schedule(self: &Rc<Self>, deadline: Instant) {
        let weak = Rc::downgrade(self);
        let key = context::with_reactor(|r| {
            r.timers
                .borrow_mut()
                .insert(deadline, TimerAction::Callback(weak))
        });
        self.key.set(Some(key));
    }

    fn cancel(&self) -> bool {
        match self.key.take() {
            Some(key) => context::try_with_reactor(|r| r.timers.borrow_mut().remove(&key))
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Callback timer bound to the reactor of the core that armed it.
///
/// Dropping the timer cancels it.
pub struct Timer {
    state: Rc<TimerState>,
}

impl Timer {
    pub fn new(callback: impl FnMut() + 'static) -> Self {
        Self {
            state: Rc::new(TimerState {
                callback: RefCell::new(Box::new(callback)),
                key: Cell::new(None),
                period: Cell::new(None),
            }),
        }
    }

    /// Arms the timer. An already armed timer is re-armed.
    #[track_caller]
    pub fn arm(&self, deadline: Instant) {
        self.state.cancel();
        self.state.period.set(None);
        self.state.schedule(deadline);
    }

    #[track_caller]
    pub fn arm_after(&self, delay: Duration) {
        self.arm(Instant::now() + delay);
    }

    /// Fires every `period`, first after one period.
    #[track_caller]
    pub fn arm_periodic(&self, period: Duration) {
        assert!(!period.is_zero(), "periodic timer needs a non zero period");
        self.state.cancel();
        self.state.period.set(Some(period));
        self.state.schedule(Instant::now() + period);
    }

    /// Returns true if the timer was armed.
    pub fn cancel(&self) -> bool {
        self.state.period.set(None);
        self.state.cancel()
    }

    pub fn armed(&self) -> bool {
        self.state.key.get().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.key.get().map(|k| k.deadline)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("deadline", &self.deadline())
            .field("period", &self.state.period.get())
            .finish()
    }
}

/// Future resolving once `deadline` has passed.
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    key: Option<TimerKey>,
}

pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        key: None,
    }
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn disarm(&mut self) {
        if let Some(key) = self.key.take() {
            context::try_with_reactor(|r| r.timers.borrow_mut().remove(&key));
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.is_elapsed() {
            this.disarm();
            return Poll::Ready(());
        }

        match &this.key {
            Some(key) => context::with_reactor(|r| r.timers.borrow_mut().update_waker(key, cx.waker())),
            None => {
                let key = context::with_reactor(|r| {
                    r.timers
                        .borrow_mut()
                        .insert(this.deadline, TimerAction::Wake(cx.waker().clone()))
                });
                this.key = Some(key);
            }
        }

        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Future returned by [`timeout`]: the inner output, or [`Error::TimedOut`].
#[pin_project]
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct Timeout<F> {
    #[pin]
    inner: F,
    sleep: Sleep,
}

/// Races `fut` against a timer. Whichever completes first wins; the loser is
/// dropped with the returned future, removing its timer registration.
pub fn timeout<F: Future>(duration: Duration, fut: F) -> Timeout<F> {
    with_timeout(Instant::now() + duration, fut)
}

pub fn with_timeout<F: Future>(deadline: Instant, fut: F) -> Timeout<F> {
    Timeout {
        inner: fut,
        sleep: sleep_until(deadline),
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(v) = this.inner.poll(cx) {
            this.sleep.disarm();
            return Poll::Ready(Ok(v));
        }

        match Pin::new(this.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Error::TimedOut)),
            Poll::Pending => Poll::Pending,
        }
    }
}
