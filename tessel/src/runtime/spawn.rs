//! Functions for putting work on the current core.
//!
//! Everything spawned here stays on the core it was spawned on: futures need
//! not be `Send`. Use [`crate::smp`] to run work on another core.
use crate::context;
use crate::reactor::need_preempt;
use crate::sched::SchedulingGroup;
use crate::task::JoinHandle;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Spawns `future` as a task of the current scheduling group.
///
/// The task starts running once the spawning task yields. Dropping the
/// returned handle detaches the task, it keeps running to completion.
///
/// # Panics
///
/// Panics when called outside of a reactor thread.
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    spawn_in(context::current_scheduling_group(), future)
}

/// Spawns `future` as a task of `group`, sharing the core's cpu time by the
/// shares of that group.
///
/// ```no_run
/// # async fn compact() {}
/// # async fn run() -> tessel::Result<()> {
/// let batch = tessel::sched::create_scheduling_group("batch", 100)?;
/// tessel::spawn_in(batch, compact()).await?;
/// # Ok(())
/// # }
/// ```
#[track_caller]
pub fn spawn_in<F>(group: SchedulingGroup, future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    context::with_reactor(|r| r.spawn_local(group, future))
}

/// Runs `f` as a task of the current scheduling group, after the tasks
/// already queued there.
#[track_caller]
pub fn schedule<F>(f: F)
where
    F: FnOnce() + 'static,
{
    context::with_reactor(|r| r.schedule(Box::new(f)));
}

/// Lets every other runnable task of the core run before resuming.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Yields only when the current task quota is used up. Cheap enough for
/// tight loops that may otherwise starve the core.
pub async fn maybe_yield() {
    if need_preempt() {
        yield_now().await;
    }
}

/// Stops the runtime: every core leaves its loop and the pending
/// `block_on` fails with [`Error::Shutdown`](crate::Error::Shutdown).
///
/// # Panics
///
/// Panics when called outside of a reactor thread.
#[track_caller]
pub fn stop() {
    context::with_shared(|s| s.request_stop());
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }

        self.yielded = true;
        // Goes to the back of the group queue.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
