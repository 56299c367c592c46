use crate::metrics::MetricValue;
use crate::sched::table::GroupHandle;
use crate::sched::SchedulingGroup;
use crate::task::TaskKey;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Virtual runtime advances by `elapsed_ns * VRUNTIME_SCALE / shares`.
const VRUNTIME_SCALE: u128 = 1000;

/// Per-queue counters, exported as the group's metric series on this shard.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskQueueStats {
    pub(crate) runtime_usec: MetricValue,
    pub(crate) tasks_processed: MetricValue,
    pub(crate) queue_length: MetricValue,
    pub(crate) shares: MetricValue,
}

/// Runnable tasks of one scheduling group on one core.
#[derive(Debug)]
pub(crate) struct TaskQueue {
    group: SchedulingGroup,
    shares: Arc<AtomicU32>,
    alive: Arc<AtomicBool>,
    vruntime: u64,
    tasks: VecDeque<TaskKey>,
    active: bool,
    pub(crate) stats: TaskQueueStats,
}

impl TaskQueue {
    pub(crate) fn new(handle: &GroupHandle) -> Self {
        let stats = TaskQueueStats::default();
        stats.shares.set(handle.shares.load(Ordering::Relaxed) as u64);

        Self {
            group: handle.group,
            shares: Arc::clone(&handle.shares),
            alive: Arc::clone(&handle.alive),
            vruntime: 0,
            tasks: VecDeque::new(),
            active: false,
            stats,
        }
    }

    pub(crate) fn group(&self) -> SchedulingGroup {
        self.group
    }

    pub(crate) fn vruntime(&self) -> u64 {
        self.vruntime
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn charge(&mut self, elapsed: Duration) {
        let shares = self.shares.load(Ordering::Relaxed).max(1);
        self.stats.shares.set(shares as u64);

        let delta = elapsed.as_nanos() * VRUNTIME_SCALE / shares as u128;
        self.vruntime = self
            .vruntime
            .saturating_add(delta.min(u64::MAX as u128) as u64);
    }
}

/// The scheduling group queues of one core.
///
/// The active queue with the lowest virtual runtime runs next, ties broken by
/// the lower group index. A queue becoming active is clamped up to the last
/// virtual runtime that ran, so idling never turns into banked credit.
#[derive(Debug, Default)]
pub(crate) struct TaskQueueSet {
    queues: Vec<Option<TaskQueue>>,
    active: BTreeSet<(u64, usize)>,
    last_vruntime: u64,
    len: usize,
}

impl TaskQueueSet {
    pub(crate) fn has_queue(&self, group: SchedulingGroup) -> bool {
        matches!(self.queues.get(group.index()), Some(Some(q)) if q.is_alive())
    }

    /// Installs the local queue of a group. A stale queue left behind by a
    /// destroyed group in the same slot is folded into the main queue first.
    pub(crate) fn add_queue(&mut self, queue: TaskQueue) {
        let index = queue.group.index();
        if self.queues.len() <= index {
            self.queues.resize_with(index + 1, || None);
        }

        if let Some(stale) = self.queues[index].take() {
            self.fold_into_main(stale);
        }
        self.queues[index] = Some(queue);
    }

    pub(crate) fn queue(&self, group: SchedulingGroup) -> Option<&TaskQueue> {
        self.queues.get(group.index())?.as_ref()
    }

    /// Queues `key` on `group`. Returns false, without queueing, if this core
    /// has no live queue for the group yet.
    pub(crate) fn push(&mut self, group: SchedulingGroup, key: TaskKey) -> bool {
        let last = self.last_vruntime;
        let Some(Some(queue)) = self.queues.get_mut(group.index()) else {
            return false;
        };
        if !queue.is_alive() {
            return false;
        }

        queue.tasks.push_back(key);
        queue.stats.queue_length.set(queue.tasks.len() as u64);

        if !queue.active {
            queue.active = true;
            queue.vruntime = queue.vruntime.max(last);
            self.active.insert((queue.vruntime, group.index()));
        }

        self.len += 1;
        true
    }

    /// Picks the group to run next and detaches it from the active set. The
    /// caller runs tasks with [`TaskQueueSet::pop_task`] then hands the queue
    /// back with [`TaskQueueSet::finish_group`].
    pub(crate) fn pick_group(&mut self) -> Option<SchedulingGroup> {
        while let Some((vruntime, index)) = self.active.pop_first() {
            let Some(queue) = self.queues[index].as_mut() else {
                continue;
            };

            if !queue.is_alive() {
                let Some(stale) = self.queues[index].take() else {
                    continue;
                };
                self.fold_into_main(stale);
                continue;
            }

            self.last_vruntime = self.last_vruntime.max(vruntime);
            return Some(queue.group);
        }
        None
    }

    pub(crate) fn pop_task(&mut self, group: SchedulingGroup) -> Option<TaskKey> {
        let queue = self.queues.get_mut(group.index())?.as_mut()?;
        let key = queue.tasks.pop_front()?;
        queue.stats.queue_length.set(queue.tasks.len() as u64);
        self.len -= 1;
        Some(key)
    }

    /// Charges `elapsed` of runtime to `group` and puts it back in the active
    /// set if it still has runnable tasks.
    pub(crate) fn finish_group(&mut self, group: SchedulingGroup, elapsed: Duration, ran: u64) {
        let Some(Some(queue)) = self.queues.get_mut(group.index()) else {
            return;
        };

        queue.charge(elapsed);
        queue.stats.runtime_usec.add(elapsed.as_micros() as u64);
        queue.stats.tasks_processed.add(ran);

        if queue.tasks.is_empty() {
            queue.active = false;
        } else {
            self.active.insert((queue.vruntime, group.index()));
        }
    }

    fn fold_into_main(&mut self, stale: TaskQueue) {
        let orphans = stale.tasks;
        if orphans.is_empty() {
            return;
        }

        tracing::debug!(
            group = stale.group.index(),
            tasks = orphans.len(),
            "moving tasks of a destroyed scheduling group to main"
        );

        // Keys are re-counted by `push`.
        self.len -= orphans.len();
        if let Some((vruntime, index)) = self
            .active
            .iter()
            .find(|(_, index)| *index == stale.group.index())
            .copied()
        {
            self.active.remove(&(vruntime, index));
        }

        for key in orphans {
            let queued = self.push(SchedulingGroup::MAIN, key);
            debug_assert!(queued, "main queue is always installed");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn active_groups(&self) -> usize {
        self.active.len()
    }

    /// Drops every queue, returning the keys that were still runnable.
    pub(crate) fn take_all(&mut self) -> Vec<TaskKey> {
        self.active.clear();
        self.len = 0;
        std::mem::take(&mut self.queues)
            .into_iter()
            .flatten()
            .flat_map(|q| q.tasks)
            .collect()
    }
}
