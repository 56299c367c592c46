use crate::error::{panic_payload_as_str, Error, Result};
use pin_project::pin_project;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// Runs a continuation, turning a panic into [`Error::Panicked`].
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|p| Error::Panicked(panic_payload_as_str(&*p)))
}

/// Continuation chaining over any fallible future.
///
/// Each continuation runs inline on the poll that observes the upstream
/// result. A panicking continuation resolves the chain with
/// [`Error::Panicked`] instead of unwinding into the scheduler.
pub trait DeferredExt<T>: Future<Output = Result<T>> + Sized {
    /// Maps the value; failures skip the continuation.
    fn then<U, C>(self, cont: C) -> Then<Self, C>
    where
        C: FnOnce(T) -> U,
    {
        Then {
            inner: self,
            cont: Some(cont),
        }
    }

    /// Chains an asynchronous continuation; failures skip it.
    fn then_async<U, C, Fut>(self, cont: C) -> ThenAsync<Self, C, Fut>
    where
        C: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<U>>,
    {
        ThenAsync {
            state: ThenAsyncState::First {
                inner: self,
                cont: Some(cont),
            },
        }
    }

    /// Continuation receiving the full result, value or failure.
    fn then_wrapped<U, C>(self, cont: C) -> ThenWrapped<Self, C>
    where
        C: FnOnce(Result<T>) -> U,
    {
        ThenWrapped {
            inner: self,
            cont: Some(cont),
        }
    }

    /// Recovers from a failure by producing a replacement value.
    fn handle_exception<C>(self, cont: C) -> HandleException<Self, C>
    where
        C: FnOnce(Error) -> T,
    {
        HandleException {
            inner: self,
            cont: Some(cont),
        }
    }

    /// Recovers from a failure with a fallible handler.
    fn or_else<C>(self, cont: C) -> OrElse<Self, C>
    where
        C: FnOnce(Error) -> Result<T>,
    {
        OrElse {
            inner: self,
            cont: Some(cont),
        }
    }

    /// Runs `cont` whatever the outcome and forwards the original result. A
    /// panic in `cont` replaces the result.
    fn finally<C>(self, cont: C) -> Finally<Self, C>
    where
        C: FnOnce(),
    {
        Finally {
            inner: self,
            cont: Some(cont),
        }
    }

    /// Drops the value and keeps the failure.
    fn discard_result(self) -> Then<Self, fn(T)> {
        self.then(drop as fn(T))
    }
}

impl<T, F> DeferredExt<T> for F where F: Future<Output = Result<T>> {}

#[pin_project]
#[must_use = "futures do nothing unless awaited"]
pub struct Then<F, C> {
    #[pin]
    inner: F,
    cont: Option<C>,
}

impl<T, U, F, C> Future for Then<F, C>
where
    F: Future<Output = Result<T>>,
    C: FnOnce(T) -> U,
{
    type Output = Result<U>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = ready!(this.inner.poll(cx));
        let cont = this.cont.take().expect("`Then` polled after completion");

        Poll::Ready(res.and_then(|v| guarded(|| cont(v))))
    }
}

#[pin_project(project = ThenAsyncProj)]
enum ThenAsyncState<F, C, Fut> {
    First {
        #[pin]
        inner: F,
        cont: Option<C>,
    },
    Second {
        #[pin]
        next: Fut,
    },
    Done,
}

#[pin_project]
#[must_use = "futures do nothing unless awaited"]
pub struct ThenAsync<F, C, Fut> {
    #[pin]
    state: ThenAsyncState<F, C, Fut>,
}

impl<T, U, F, C, Fut> Future for ThenAsync<F, C, Fut>
where
    F: Future<Output = Result<T>>,
    C: FnOnce(T) -> Fut,
    Fut: Future<Output = Result<U>>,
{
    type Output = Result<U>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            match this.state.as_mut().project() {
                ThenAsyncProj::First { inner, cont } => {
                    let res = ready!(inner.poll(cx));
                    let cont = cont.take().expect("`ThenAsync` polled after completion");

                    match res.and_then(|v| guarded(|| cont(v))) {
                        Ok(next) => this.state.set(ThenAsyncState::Second { next }),
                        Err(e) => {
                            this.state.set(ThenAsyncState::Done);
                            return Poll::Ready(Err(e));
                        }
                    }
                }
                ThenAsyncProj::Second { next } => {
                    let res = ready!(next.poll(cx));
                    this.state.set(ThenAsyncState::Done);
                    return Poll::Ready(res);
                }
                ThenAsyncProj::Done => panic!("`ThenAsync` polled after completion"),
            }
        }
    }
}

#[pin_project]
#[must_use = "futures do nothing unless awaited"]
pub struct ThenWrapped<F, C> {
    #[pin]
    inner: F,
    cont: Option<C>,
}

impl<T, U, F, C> Future for ThenWrapped<F, C>
where
    F: Future<Output = Result<T>>,
    C: FnOnce(Result<T>) -> U,
{
    type Output = Result<U>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = ready!(this.inner.poll(cx));
        let cont = this
            .cont
            .take()
            .expect("`ThenWrapped` polled after completion");

        Poll::Ready(guarded(|| cont(res)))
    }
}

#[pin_project]
#[must_use = "futures do nothing unless awaited"]
pub struct HandleException<F, C> {
    #[pin]
    inner: F,
    cont: Option<C>,
}

impl<T, F, C> Future for HandleException<F, C>
where
    F: Future<Output = Result<T>>,
    C: FnOnce(Error) -> T,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = ready!(this.inner.poll(cx));
        let cont = this
            .cont
            .take()
            .expect("`HandleException` polled after completion");

        Poll::Ready(match res {
            Ok(v) => Ok(v),
            Err(e) => guarded(|| cont(e)),
        })
    }
}

#[pin_project]
#[must_use = "futures do nothing unless awaited"]
pub struct OrElse<F, C> {
    #[pin]
    inner: F,
    cont: Option<C>,
}

impl<T, F, C> Future for OrElse<F, C>
where
    F: Future<Output = Result<T>>,
    C: FnOnce(Error) -> Result<T>,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = ready!(this.inner.poll(cx));
        let cont = this.cont.take().expect("`OrElse` polled after completion");

        Poll::Ready(match res {
            Ok(v) => Ok(v),
            Err(e) => guarded(|| cont(e)).and_then(|r| r),
        })
    }
}

#[pin_project]
#[must_use = "futures do nothing unless awaited"]
pub struct Finally<F, C> {
    #[pin]
    inner: F,
    cont: Option<C>,
}

impl<T, F, C> Future for Finally<F, C>
where
    F: Future<Output = Result<T>>,
    C: FnOnce(),
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = ready!(this.inner.poll(cx));
        let cont = this.cont.take().expect("`Finally` polled after completion");

        Poll::Ready(guarded(cont).and(res))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::{failed, promise, ready};
    use crate::test_utils::*;
    use rstest::rstest;
    use std::cell::Cell;
    use std::rc::Rc;

    #[rstest]
    #[case::single(1)]
    #[case::few(8)]
    #[case::many(1_000)]
    fn test_identity_chain_preserves_value(#[case] links: usize) {
        let mut fut: Pin<Box<dyn Future<Output = Result<u64>>>> = Box::pin(ready(42u64));
        for _ in 0..links {
            fut = Box::pin(fut.then(|v| v));
        }

        assert_eq!(poll_once(fut), Poll::Ready(Ok(42)));
    }

    #[test]
    fn test_failure_skips_then_and_reaches_handler() {
        let ran = Rc::new(Cell::new(false));
        let ran2 = Rc::clone(&ran);

        let fut = failed::<u32>(Error::TimedOut)
            .then(move |v| {
                ran2.set(true);
                v + 1
            })
            .handle_exception(|e| {
                assert_eq!(e, Error::TimedOut);
                5
            });

        assert_eq!(poll_once(fut), Poll::Ready(Ok(5)));
        assert!(!ran.get());
    }

    #[test]
    fn test_panicking_continuation_is_captured() {
        let fut = ready(1).then(|_: i32| -> i32 { panic!("continuation exploded") });

        match poll_once(fut) {
            Poll::Ready(Err(Error::Panicked(msg))) => assert!(msg.contains("exploded")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_finally_runs_on_both_paths() {
        let count = Rc::new(Cell::new(0));

        let c1 = Rc::clone(&count);
        let ok = ready(()).finally(move || c1.set(c1.get() + 1));
        assert_eq!(poll_once(ok), Poll::Ready(Ok(())));

        let c2 = Rc::clone(&count);
        let ko = failed::<()>(Error::Cancelled).finally(move || c2.set(c2.get() + 1));
        assert_eq!(poll_once(ko), Poll::Ready(Err(Error::Cancelled)));

        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_then_async_waits_for_inner_future() {
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let (p, d) = promise::<u32>();
        let mut fut = Box::pin(ready(2).then_async(move |v| d.then(move |x| x * v)));

        assert!(fut.as_mut().poll(&mut cx).is_pending());
        p.set_value(21);
        assert_eq!(data.get_count(), 1);
        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Ok(42)));
    }

    #[test]
    fn test_then_wrapped_sees_failure() {
        let fut = failed::<()>(Error::BrokenPromise).then_wrapped(|res| res.is_err());
        assert_eq!(poll_once(fut), Poll::Ready(Ok(true)));
    }

    #[test]
    fn test_or_else_and_discard() {
        let fut = failed::<u8>(Error::GateClosed).or_else(|_| Ok(9)).discard_result();
        assert_eq!(poll_once(fut), Poll::Ready(Ok(())));
    }
}
