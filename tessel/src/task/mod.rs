//! Schedulable units of work.
//!
//! Every spawned future becomes a [`Task`] owned by the reactor of the core it
//! was spawned on. Tasks never migrate: they are polled on their core and their
//! wakers route back to it from any thread.
use crate::context;
use crate::sched::SchedulingGroup;

mod future_task;
pub(crate) use future_task::{FutureTask, LambdaTask};

pub mod id;
pub use id::{current_id, TaskId};
pub(crate) use id::{TaskIdGuard, ROOT_TASK_ID};

mod join;
pub use join::JoinHandle;

mod slots;
pub(crate) use slots::{TaskKey, TaskSlots, WakeOutcome};

mod waker;
pub(crate) use waker::{RootWaker, TaskWaker};

/// A unit of work the reactor can run.
///
/// `run_and_dispose` consumes the task. A task that is not done yet hands
/// itself back to the reactor before returning, anything else is dropped.
pub trait Task {
    fn run_and_dispose(self: Box<Self>);

    /// The task blocked on the completion of this one, if any.
    fn waiting_task(&self) -> Option<TaskId>;

    fn scheduling_group(&self) -> SchedulingGroup;
}

/// Queues a task on the current core, in its scheduling group.
///
/// # Panics
///
/// Panics when called outside of a reactor thread.
#[track_caller]
pub fn schedule_task(task: Box<dyn Task>) {
    context::with_reactor(|r| r.schedule_task(task));
}

/// The chain of tasks waiting on the current one, starting with the current
/// task itself. Empty outside of tasks.
pub fn backtrace() -> Vec<TaskId> {
    current_id().map(backtrace_of).unwrap_or_default()
}

/// The chain of tasks waiting on task `id` on this core, starting with `id`.
///
/// A link ends the walk once it reaches a task owned by another core, or the
/// root future.
pub fn backtrace_of(id: TaskId) -> Vec<TaskId> {
    context::try_with_reactor(|r| r.backtrace_of(id)).unwrap_or_else(|| vec![id])
}
