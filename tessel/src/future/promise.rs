use crate::error::{Error, Result};
use crate::reactor::preempt;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

enum State<T> {
    Pending(Option<Waker>),
    Ready(Result<T>),
    Consumed,
}

type Shared<T> = Rc<RefCell<State<T>>>;

/// Producer half of a single-assignment result cell.
///
/// Setting consumes the promise, so a value can be delivered at most once.
/// Dropping a promise that was never set delivers [`Error::BrokenPromise`] to
/// whoever awaits the paired [`Deferred`].
pub struct Promise<T> {
    shared: Option<Shared<T>>,
}

/// Consumer half of a single-assignment result cell.
///
/// When the value is already available, polling returns it inline unless the
/// current task quota expired, in which case the deferred yields once to the
/// scheduler first.
#[must_use = "deferred values do nothing unless awaited"]
pub struct Deferred<T> {
    shared: Shared<T>,
    yielded: bool,
}

/// Creates a connected promise/deferred pair.
pub fn promise<T>() -> (Promise<T>, Deferred<T>) {
    let shared = Rc::new(RefCell::new(State::Pending(None)));
    (
        Promise {
            shared: Some(Rc::clone(&shared)),
        },
        Deferred {
            shared,
            yielded: false,
        },
    )
}

/// A deferred that is already resolved with `value`.
pub fn ready<T>(value: T) -> Deferred<T> {
    Deferred::from_result(Ok(value))
}

/// A deferred that is already resolved with `err`.
pub fn failed<T>(err: Error) -> Deferred<T> {
    Deferred::from_result(Err(err))
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        self.set_result(Ok(value));
    }

    pub fn set_error(self, err: Error) {
        self.set_result(Err(err));
    }

    pub fn set_result(mut self, res: Result<T>) {
        if let Some(shared) = self.shared.take() {
            Self::resolve(&shared, res);
        }
    }

    /// True when the paired deferred was dropped, nobody is listening anymore.
    pub fn is_orphaned(&self) -> bool {
        self.shared
            .as_ref()
            .map_or(true, |shared| Rc::strong_count(shared) == 1)
    }

    fn resolve(shared: &Shared<T>, res: Result<T>) {
        let waker = {
            let mut state = shared.borrow_mut();
            match std::mem::replace(&mut *state, State::Ready(res)) {
                State::Pending(waker) => waker,
                State::Ready(_) | State::Consumed => {
                    unreachable!("promise resolved twice")
                }
            }
        };

        // Borrow released before waking, the waker may poll inline.
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            Self::resolve(&shared, Err(Error::BrokenPromise));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("set", &self.shared.is_none())
            .finish()
    }
}

impl<T> Deferred<T> {
    pub fn from_result(res: Result<T>) -> Self {
        Deferred {
            shared: Rc::new(RefCell::new(State::Ready(res))),
            yielded: false,
        }
    }

    /// True once a value or a failure has been delivered.
    pub fn available(&self) -> bool {
        matches!(&*self.shared.borrow(), State::Ready(_))
    }

    /// True once a failure has been delivered.
    pub fn failed(&self) -> bool {
        matches!(&*self.shared.borrow(), State::Ready(Err(_)))
    }

    /// Takes the result if it is available, without going through the
    /// preemption check.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        let mut state = self.shared.borrow_mut();
        match &*state {
            State::Ready(_) => match std::mem::replace(&mut *state, State::Consumed) {
                State::Ready(res) => Some(res),
                _ => None,
            },
            _ => None,
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.shared.borrow_mut();

        match &mut *state {
            State::Ready(_) => {
                if !this.yielded && preempt::need_preempt() {
                    this.yielded = true;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }

                match std::mem::replace(&mut *state, State::Consumed) {
                    State::Ready(res) => Poll::Ready(res),
                    _ => unreachable!("state checked above"),
                }
            }
            State::Pending(waker) => {
                match waker {
                    Some(w) if w.will_wake(cx.waker()) => {}
                    _ => *waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            State::Consumed => panic!("`Deferred` polled after its result was consumed"),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.borrow() {
            State::Pending(_) => "pending",
            State::Ready(Ok(_)) => "ready",
            State::Ready(Err(_)) => "failed",
            State::Consumed => "consumed",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_waker;
    use std::pin::pin;

    #[test]
    fn test_set_value_wakes_waiter() {
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let (p, d) = promise::<u32>();
        let mut d = pin!(d);

        assert!(d.as_mut().poll(&mut cx).is_pending());
        assert!(!d.available());

        p.set_value(7);
        assert_eq!(data.get_count(), 1);
        assert!(d.available());
        assert_eq!(d.as_mut().poll(&mut cx), Poll::Ready(Ok(7)));
    }

    #[test]
    fn test_dropped_promise_is_broken() {
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let (p, d) = promise::<()>();
        let mut d = pin!(d);
        assert!(d.as_mut().poll(&mut cx).is_pending());

        drop(p);
        assert_eq!(data.get_count(), 1);
        assert!(d.failed());
        assert_eq!(
            d.as_mut().poll(&mut cx),
            Poll::Ready(Err(Error::BrokenPromise))
        );
    }

    #[test]
    fn test_orphaned_promise() {
        let (p, d) = promise::<()>();
        assert!(!p.is_orphaned());
        drop(d);
        assert!(p.is_orphaned());
        p.set_value(());
    }

    #[test]
    #[should_panic(expected = "polled after its result was consumed")]
    fn test_double_consume_panics() {
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let mut d = pin!(ready(1));
        assert_eq!(d.as_mut().poll(&mut cx), Poll::Ready(Ok(1)));
        let _ = d.as_mut().poll(&mut cx);
    }

    #[test]
    fn test_ready_and_failed_factories() {
        let mut ok = ready("v");
        assert!(ok.available());
        assert_eq!(ok.try_take(), Some(Ok("v")));
        assert_eq!(ok.try_take(), None);

        let ko = failed::<()>(Error::TimedOut);
        assert!(ko.failed());
    }
}
