use crate::error::Result;
use crate::future::Deferred;
use crate::task::{current_id, TaskId};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// An owned permission to await the output of a spawned task.
///
/// Awaiting yields the task output, [`Error::Panicked`] if the task panicked,
/// or [`Error::BrokenPromise`] if the runtime dropped it before completion.
/// Dropping the handle detaches the task, it keeps running.
///
/// While a task awaits a handle, the handle records it as the waiting task of
/// the spawned one, which is what [`backtrace`](crate::task::backtrace) walks.
///
/// [`Error::Panicked`]: crate::Error::Panicked
/// [`Error::BrokenPromise`]: crate::Error::BrokenPromise
#[must_use = "dropping a JoinHandle detaches the task"]
pub struct JoinHandle<T> {
    inner: Deferred<T>,
    id: TaskId,
    waiter: Rc<Cell<Option<TaskId>>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(inner: Deferred<T>, id: TaskId, waiter: Rc<Cell<Option<TaskId>>>) -> Self {
        Self { inner, id, waiter }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True once the task produced its output, or failed.
    pub fn is_finished(&self) -> bool {
        self.inner.available()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(me) = current_id() {
            this.waiter.set(Some(me));
        }

        let res = Pin::new(&mut this.inner).poll(cx);
        if res.is_ready() {
            this.waiter.set(None);
        }
        res
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        self.waiter.set(None);
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
