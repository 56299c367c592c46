use crate::sched::SchedulingGroup;
use crate::task::Task;
use slab::Slab;
use std::fmt;

/// Stable handle to a task slot. The generation guards against a stale waker
/// waking whatever task later reuses the slab index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskKey {
    index: u32,
    generation: u32,
}

enum SlotState {
    /// Waiting to be woken.
    Idle(Box<dyn Task>),
    /// Sitting in a scheduling group queue.
    Queued(Box<dyn Task>),
    /// Taken out by the reactor. `notified` records a wake that arrived while
    /// the task was running.
    Running { notified: bool },
}

struct Slot {
    generation: u32,
    state: SlotState,
}

/// What a wake should do to the run queues.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WakeOutcome {
    Enqueue(SchedulingGroup),
    Nothing,
}

/// Per-core owner of every spawned task.
#[derive(Default)]
pub(crate) struct TaskSlots {
    slab: Slab<Slot>,
    next_generation: u32,
}

impl TaskSlots {
    /// Stores a runnable task. The caller pushes the key onto the task's
    /// scheduling group queue.
    pub(crate) fn insert_queued(&mut self, task: Box<dyn Task>) -> TaskKey {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let index = self.slab.insert(Slot {
            generation,
            state: SlotState::Queued(task),
        });

        TaskKey {
            index: index as u32,
            generation,
        }
    }

    /// Reserves a key before the task exists, for tasks that need to know
    /// their own key. The slot starts as running and notified, so the first
    /// [`TaskSlots::repark`] queues the task.
    pub(crate) fn reserve(&mut self) -> TaskKey {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let index = self.slab.insert(Slot {
            generation,
            state: SlotState::Running { notified: true },
        });

        TaskKey {
            index: index as u32,
            generation,
        }
    }

    fn get_mut(&mut self, key: TaskKey) -> Option<&mut Slot> {
        self.slab
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
    }

    pub(crate) fn wake(&mut self, key: TaskKey) -> WakeOutcome {
        let Some(slot) = self.get_mut(key) else {
            return WakeOutcome::Nothing;
        };

        match &mut slot.state {
            SlotState::Running { notified } => {
                *notified = true;
                WakeOutcome::Nothing
            }
            SlotState::Queued(_) => WakeOutcome::Nothing,
            SlotState::Idle(_) => {
                let SlotState::Idle(task) =
                    std::mem::replace(&mut slot.state, SlotState::Running { notified: false })
                else {
                    unreachable!("state checked above");
                };
                let group = task.scheduling_group();
                slot.state = SlotState::Queued(task);
                WakeOutcome::Enqueue(group)
            }
        }
    }

    /// Takes a queued task out for running. `None` for stale keys.
    pub(crate) fn begin_run(&mut self, key: TaskKey) -> Option<Box<dyn Task>> {
        let slot = self.get_mut(key)?;

        match std::mem::replace(&mut slot.state, SlotState::Running { notified: false }) {
            SlotState::Queued(task) => Some(task),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Puts a task that did not complete back. Returns the group to enqueue
    /// on if it was woken while running.
    pub(crate) fn repark(&mut self, key: TaskKey, task: Box<dyn Task>) -> WakeOutcome {
        let Some(slot) = self.get_mut(key) else {
            // The slot was torn down underneath the task.
            return WakeOutcome::Nothing;
        };

        match slot.state {
            SlotState::Running { notified: true } => {
                let group = task.scheduling_group();
                slot.state = SlotState::Queued(task);
                WakeOutcome::Enqueue(group)
            }
            SlotState::Running { notified: false } => {
                slot.state = SlotState::Idle(task);
                WakeOutcome::Nothing
            }
            _ => panic!("task {key:?} reparked while not running"),
        }
    }

    /// Frees the slot of a task that ran and did not repark itself.
    pub(crate) fn finish_run(&mut self, key: TaskKey) -> bool {
        let running = self
            .get_mut(key)
            .is_some_and(|slot| matches!(slot.state, SlotState::Running { .. }));

        if running {
            self.slab.remove(key.index as usize);
        }
        running
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    /// Empties the slab. The tasks must be dropped by the caller once no
    /// reactor state is borrowed, since dropping a future can wake others.
    pub(crate) fn take_all(&mut self) -> Vec<Box<dyn Task>> {
        std::mem::take(&mut self.slab)
            .into_iter()
            .filter_map(|(_, slot)| match slot.state {
                SlotState::Idle(task) | SlotState::Queued(task) => Some(task),
                SlotState::Running { .. } => None,
            })
            .collect()
    }
}

impl fmt::Debug for TaskSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSlots")
            .field("len", &self.slab.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    struct Noop(SchedulingGroup);

    impl Task for Noop {
        fn run_and_dispose(self: Box<Self>) {}

        fn waiting_task(&self) -> Option<TaskId> {
            None
        }

        fn scheduling_group(&self) -> SchedulingGroup {
            self.0
        }
    }

    fn noop() -> Box<dyn Task> {
        Box::new(Noop(SchedulingGroup::MAIN))
    }

    #[test]
    fn test_wake_transitions() {
        let mut slots = TaskSlots::default();
        let key = slots.insert_queued(noop());

        // Already queued, waking is a no-op.
        assert_eq!(slots.wake(key), WakeOutcome::Nothing);

        let task = slots.begin_run(key).expect("queued task");
        assert_eq!(slots.wake(key), WakeOutcome::Nothing);

        // Woken while running: goes straight back to the queue.
        assert_eq!(
            slots.repark(key, task),
            WakeOutcome::Enqueue(SchedulingGroup::MAIN)
        );

        let task = slots.begin_run(key).expect("requeued");
        assert_eq!(slots.repark(key, task), WakeOutcome::Nothing);
        assert_eq!(slots.wake(key), WakeOutcome::Enqueue(SchedulingGroup::MAIN));

        let _task = slots.begin_run(key).expect("woken");
        assert!(slots.finish_run(key));
        assert_eq!(slots.len(), 0);
    }

    #[test]
    fn test_reserved_slot_queues_on_first_repark() {
        let mut slots = TaskSlots::default();
        let key = slots.reserve();

        assert_eq!(slots.repark(key, noop()), WakeOutcome::Enqueue(SchedulingGroup::MAIN));
        assert!(slots.begin_run(key).is_some());
    }

    #[test]
    fn test_stale_key_is_ignored() {
        let mut slots = TaskSlots::default();
        let old = slots.insert_queued(noop());
        let _ = slots.begin_run(old);
        assert!(slots.finish_run(old));

        let new = slots.insert_queued(noop());
        assert_eq!(old.index, new.index);
        assert_ne!(old, new);

        assert_eq!(slots.wake(old), WakeOutcome::Nothing);
        assert!(slots.begin_run(old).is_none());
        assert!(!slots.finish_run(old));
        assert!(slots.begin_run(new).is_some());
    }
}
