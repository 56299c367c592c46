use crate::context::{self, CoreHandle};
use crate::task::TaskKey;
use std::sync::Arc;
use std::task::{Wake, Waker};

/// Waker of a spawned task.
///
/// Wakers are `Send` and may fire from any thread. A wake on the task's own
/// core goes straight to the run queue, any other thread pushes the key onto
/// the core's remote wake queue and kicks the core if it sleeps.
pub(crate) struct TaskWaker {
    core: Arc<CoreHandle>,
    key: TaskKey,
}

impl TaskWaker {
    pub(crate) fn new_waker(core: Arc<CoreHandle>, key: TaskKey) -> Waker {
        Waker::from(Arc::new(TaskWaker { core, key }))
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let local = context::try_with_reactor(|r| {
            if Arc::ptr_eq(&r.core, &self.core) {
                r.wake_local(self.key);
                true
            } else {
                false
            }
        });

        if local != Some(true) {
            self.core.push_remote_wake(self.key);
        }
    }
}

/// Waker of the future passed to `block_on`, which is not a task and is
/// polled directly by the loop of core 0.
pub(crate) struct RootWaker {
    core: Arc<CoreHandle>,
}

impl RootWaker {
    pub(crate) fn new_waker(core: Arc<CoreHandle>) -> Waker {
        Waker::from(Arc::new(RootWaker { core }))
    }
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.core.wake_root();
    }
}
