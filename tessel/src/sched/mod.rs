//! Scheduling groups.
//!
//! A scheduling group is a named class of tasks with a shares weight. Every
//! core keeps one run queue per group and splits its CPU time between the
//! runnable groups in proportion to their shares.
//!
//! ```ignore
//! let batch = tessel::sched::create_scheduling_group("batch", 100)?;
//! let handle = tessel::spawn_in(batch, async { compact().await });
//! ```
use crate::context;
use crate::error::Result;
use crate::metrics::{labels, MetricKind, Registration};
use std::fmt;

pub(crate) mod queue;
pub(crate) use queue::{TaskQueue, TaskQueueSet};

pub(crate) mod table;
pub(crate) use table::SchedulingGroupTable;

/// Handle to a scheduling group. Small, `Copy`, and valid on every core.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulingGroup(u32);

impl SchedulingGroup {
    /// The group tasks run in unless spawned elsewhere.
    pub const MAIN: SchedulingGroup = SchedulingGroup(0);

    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn is_main(&self) -> bool {
        *self == Self::MAIN
    }

    /// Current name of the group, `None` once destroyed.
    pub fn name(&self) -> Option<String> {
        context::with_shared(|shared| shared.groups.read().name(*self).ok())
    }

    pub fn shares(&self) -> Option<u32> {
        context::with_shared(|shared| shared.groups.read().shares(*self).ok())
    }

    /// Changes the weight of the group. Takes effect on every core at the
    /// next accounting point.
    pub fn set_shares(&self, shares: u32) -> Result<()> {
        context::with_shared(|shared| shared.groups.read().set_shares(*self, shares))
    }
}

impl fmt::Debug for SchedulingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchedulingGroup({})", self.0)
    }
}

impl Default for SchedulingGroup {
    fn default() -> Self {
        Self::MAIN
    }
}

/// Creates a group. Names must be unique since they label the metric series
/// of the group.
pub fn create_scheduling_group(name: &str, shares: u32) -> Result<SchedulingGroup> {
    let group = context::with_shared(|shared| shared.groups.write().create(name, shares))?;
    tracing::debug!(name, shares, index = group.index(), "created scheduling group");
    Ok(group)
}

/// Destroys a group. Tasks still queued in it on any core move to the main
/// group the next time that core looks at the queue.
pub fn destroy_scheduling_group(group: SchedulingGroup) -> Result<()> {
    context::with_shared(|shared| shared.groups.write().destroy(group))?;
    tracing::debug!(index = group.index(), "destroyed scheduling group");
    Ok(())
}

/// Renames a group. The metric series of every core move to the new label
/// in one step.
pub fn rename_scheduling_group(group: SchedulingGroup, name: &str) -> Result<()> {
    context::with_shared(|shared| {
        shared
            .groups
            .write()
            .rename(group, name, &shared.metrics)
    })
}

/// The group of the running task, [`SchedulingGroup::MAIN`] outside tasks.
pub fn current_scheduling_group() -> SchedulingGroup {
    context::current_scheduling_group()
}

/// Makes sure this core has a run queue for `group`, registering its metric
/// series under the group table lock.
pub(crate) fn ensure_local_queue(reactor: &crate::reactor::Reactor, group: SchedulingGroup) -> bool {
    if reactor.queues.borrow().has_queue(group) {
        return true;
    }

    let shared = &reactor.shared;
    let shard = reactor.id().to_string();

    // Write lock: the series get attached to the table entry.
    let mut table = shared.groups.write();
    let Ok(handle) = table.handle(group) else {
        return false;
    };

    let queue = TaskQueue::new(&handle);
    let series = [
        ("runtime_usec", MetricKind::Counter, queue.stats.runtime_usec.clone()),
        ("tasks_processed", MetricKind::Counter, queue.stats.tasks_processed.clone()),
        ("queue_length", MetricKind::Gauge, queue.stats.queue_length.clone()),
        ("shares", MetricKind::Gauge, queue.stats.shares.clone()),
    ];

    let mut regs: Vec<Registration> = Vec::with_capacity(series.len());
    for (name, kind, value) in series {
        match shared.metrics.register(
            table::METRICS_GROUP,
            name,
            kind,
            labels([("group", handle.name.clone()), ("shard", shard.clone())]),
            value,
        ) {
            Ok(reg) => regs.push(reg),
            Err(e) => tracing::warn!(group = %handle.name, error = %e, "scheduling group metric"),
        }
    }

    if table.attach(group, regs).is_err() {
        return false;
    }
    drop(table);

    reactor.queues.borrow_mut().add_queue(queue);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use crate::error::Error;
    use crate::sched::table::METRICS_GROUP;
    use crate::{smp, spawn_in, yield_now};
    use anyhow::Result;
    use std::cell::Cell;
    use std::collections::BTreeSet;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    #[tessel::test]
    async fn test_spawn_in_runs_in_group() -> Result<()> {
        let g = create_scheduling_group("spawn-in", 200)?;
        assert_eq!(g.name().as_deref(), Some("spawn-in"));
        assert_eq!(g.shares(), Some(200));

        let seen = spawn_in(g, async { current_scheduling_group() }).await?;
        assert_eq!(seen, g);
        assert_eq!(current_scheduling_group(), SchedulingGroup::MAIN);

        destroy_scheduling_group(g)?;
        assert_eq!(g.name(), None);
        Ok(())
    }

    #[tessel::test]
    async fn test_group_metrics_follow_rename() -> Result<()> {
        let g = create_scheduling_group("before", 100)?;
        spawn_in(g, async {}).await?;

        rename_scheduling_group(g, "after")?;
        let registry = crate::metrics::registry();
        let names = registry.label_values(METRICS_GROUP, "group");
        assert!(names.contains("after"));
        assert!(!names.contains("before"));

        destroy_scheduling_group(g)?;
        assert!(!registry.label_values(METRICS_GROUP, "group").contains("after"));
        Ok(())
    }

    #[tessel::test(cores = 4)]
    async fn test_concurrent_rename_storm_leaves_one_label() -> Result<()> {
        let g = create_scheduling_group("storm-0", 100)?;

        // Make every core own series for the group.
        smp::invoke_on_all(move || async move {
            let _ = spawn_in(g, async {}).await;
        })
        .await?;

        smp::invoke_on_all(move || async move {
            for round in 0..50 {
                let name = format!("storm-{}-{}", smp::this_core(), round);
                rename_scheduling_group(g, &name).expect("unique name");
                yield_now().await;
            }
        })
        .await?;

        let registry = crate::metrics::registry();
        let labels: BTreeSet<String> = registry
            .label_values(METRICS_GROUP, "group")
            .into_iter()
            .filter(|n| n.starts_with("storm-"))
            .collect();
        assert_eq!(labels.len(), 1, "labels: {labels:?}");
        assert_eq!(labels.into_iter().next(), g.name());

        destroy_scheduling_group(g)?;
        Ok(())
    }

    #[tessel::test]
    async fn test_shares_split_cpu_between_busy_groups() -> Result<()> {
        let light = create_scheduling_group("light", 100)?;
        let heavy = create_scheduling_group("heavy", 300)?;

        let done = Rc::new(Cell::new(false));
        let spin = |counter: Rc<Cell<u64>>, done: Rc<Cell<bool>>| async move {
            while !done.get() {
                let start = Instant::now();
                while start.elapsed() < Duration::from_micros(50) {}
                counter.set(counter.get() + 1);
                yield_now().await;
            }
        };

        let a = Rc::new(Cell::new(0));
        let b = Rc::new(Cell::new(0));
        let ha = spawn_in(light, spin(Rc::clone(&a), Rc::clone(&done)));
        let hb = spawn_in(heavy, spin(Rc::clone(&b), Rc::clone(&done)));

        crate::sleep(Duration::from_millis(300)).await;
        done.set(true);
        ha.await?;
        hb.await?;

        let ratio = b.get() as f64 / a.get().max(1) as f64;
        assert!((2.0..4.0).contains(&ratio), "light {} heavy {}", a.get(), b.get());

        destroy_scheduling_group(light)?;
        destroy_scheduling_group(heavy)?;
        Ok(())
    }

    #[tessel::test]
    async fn test_table_limit_is_reported() -> Result<()> {
        let max = context::with_shared(|s| s.cfg.max_scheduling_groups);
        let mut created = Vec::new();
        loop {
            match create_scheduling_group(&format!("fill-{}", created.len()), 1) {
                Ok(g) => created.push(g),
                Err(e) => {
                    assert_eq!(e, Error::TooManySchedulingGroups { max });
                    break;
                }
            }
        }
        assert_eq!(created.len(), max - 1);

        for g in created {
            destroy_scheduling_group(g)?;
        }
        Ok(())
    }
}
