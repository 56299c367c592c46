use crate::context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a task among every task spawned by
/// the process, on any core.
///
/// # Notes
///
/// - Task IDs are never reused.
/// - The ID of the running task is available from inside the task through
///   [`task::current_id()`](crate::task::current_id) and from outside through
///   [`JoinHandle::id()`](crate::task::JoinHandle::id).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

/// The root future handed to `block_on` is polled directly by the reactor of
/// core 0 but still gets an id so backtraces can end at it.
pub(crate) const ROOT_TASK_ID: TaskId = TaskId(NonZeroU64::new(1).unwrap());

/// Returns the [`TaskId`] of the currently running task, or `None` if called
/// outside of a task.
pub fn current_id() -> Option<TaskId> {
    context::current_task_id()
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TaskId {
    pub(crate) fn next() -> Self {
        // Id 1 belongs to the root future.
        static COUNTER: AtomicU64 = AtomicU64::new(2);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Even at one billion spawns per second this takes centuries to wrap.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }

    pub fn is_root(&self) -> bool {
        *self == ROOT_TASK_ID
    }

    /// Get a unique task tracing Id to be used with tracing library.
    pub fn as_tracing_id(&self) -> tracing::Id {
        tracing::Id::from_non_zero_u64(self.0)
    }
}

/// Sets the current task id while a task is polled, restoring the previous
/// one on drop.
pub(crate) struct TaskIdGuard {
    parent_task_id: Option<TaskId>,
}

impl TaskIdGuard {
    pub(crate) fn enter(id: TaskId) -> Self {
        TaskIdGuard {
            parent_task_id: context::set_current_task_id(Some(id)),
        }
    }
}

impl Drop for TaskIdGuard {
    fn drop(&mut self) {
        context::set_current_task_id(self.parent_task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_task_id_unique() {
        let n = 13;
        let ids: HashSet<_> = (0..n).map(|_| TaskId::next()).collect();

        assert_eq!(ids.len(), n);
        assert!(!ids.contains(&ROOT_TASK_ID));
    }

    #[test]
    fn test_guard_restores_parent() {
        let outer = TaskId::next();
        let inner = TaskId::next();

        let g1 = TaskIdGuard::enter(outer);
        {
            let _g2 = TaskIdGuard::enter(inner);
            assert_eq!(current_id(), Some(inner));
        }
        assert_eq!(current_id(), Some(outer));

        drop(g1);
        assert_eq!(current_id(), None);
    }
}
