use crate::context;
use crate::error::{Error, Result};
use crate::future::{guarded, Promise};
use crate::sched::SchedulingGroup;
use crate::task::{Task, TaskId, TaskIdGuard, TaskKey};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A spawned future, polled by the reactor of the core it was spawned on.
pub(crate) struct FutureTask<T> {
    id: TaskId,
    key: TaskKey,
    group: SchedulingGroup,
    future: Pin<Box<dyn Future<Output = T>>>,
    promise: Promise<T>,
    waiter: Rc<Cell<Option<TaskId>>>,
    waker: Waker,
}

impl<T> FutureTask<T> {
    pub(crate) fn new(
        id: TaskId,
        key: TaskKey,
        group: SchedulingGroup,
        future: Pin<Box<dyn Future<Output = T>>>,
        promise: Promise<T>,
        waiter: Rc<Cell<Option<TaskId>>>,
        waker: Waker,
    ) -> Self {
        Self {
            id,
            key,
            group,
            future,
            promise,
            waiter,
            waker,
        }
    }

    fn complete(self: Box<Self>, res: Result<T>) {
        let FutureTask {
            id,
            future,
            promise,
            ..
        } = *self;

        // Resources held by the future go before the joiner is woken.
        drop(future);
        context::try_with_reactor(|r| r.unlink_task(id));
        promise.set_result(res);
    }
}

impl<T: 'static> Task for FutureTask<T> {
    fn run_and_dispose(mut self: Box<Self>) {
        let _id = TaskIdGuard::enter(self.id);

        let poll = {
            let this = &mut *self;
            let mut cx = Context::from_waker(&this.waker);
            guarded(|| this.future.as_mut().poll(&mut cx))
        };

        match poll {
            Ok(Poll::Pending) => {
                let key = self.key;
                context::with_reactor(|r| r.repark(key, self));
            }
            Ok(Poll::Ready(value)) => self.complete(Ok(value)),
            Err(e) => {
                if let Error::Panicked(msg) = &e {
                    tracing::warn!(task = %self.id, panic = %msg, "task panicked");
                }
                self.complete(Err(e));
            }
        }
    }

    fn waiting_task(&self) -> Option<TaskId> {
        self.waiter.get()
    }

    fn scheduling_group(&self) -> SchedulingGroup {
        self.group
    }
}

impl<T> fmt::Debug for FutureTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureTask")
            .field("id", &self.id)
            .field("group", &self.group)
            .finish()
    }
}

/// A closure run once, created by [`schedule`](crate::schedule).
pub(crate) struct LambdaTask {
    func: Box<dyn FnOnce()>,
    group: SchedulingGroup,
}

impl LambdaTask {
    pub(crate) fn new(func: Box<dyn FnOnce()>, group: SchedulingGroup) -> Self {
        Self { func, group }
    }
}

impl Task for LambdaTask {
    fn run_and_dispose(self: Box<Self>) {
        if let Err(e) = guarded(self.func) {
            tracing::error!(error = %e, "scheduled closure failed");
        }
    }

    fn waiting_task(&self) -> Option<TaskId> {
        None
    }

    fn scheduling_group(&self) -> SchedulingGroup {
        self.group
    }
}
