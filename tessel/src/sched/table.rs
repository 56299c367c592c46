use crate::error::{Error, Result};
use crate::metrics::{MetricsRegistry, Registration};
use crate::sched::SchedulingGroup;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Metric group every scheduling group series is registered under.
pub(crate) const METRICS_GROUP: &str = "scheduler";

pub(crate) const MAIN_GROUP_NAME: &str = "main";
pub(crate) const MAIN_GROUP_SHARES: u32 = 1000;

/// What a core needs to build its local queue for one group.
#[derive(Debug, Clone)]
pub(crate) struct GroupHandle {
    pub(crate) group: SchedulingGroup,
    pub(crate) name: String,
    pub(crate) shares: Arc<AtomicU32>,
    pub(crate) alive: Arc<AtomicBool>,
}

#[derive(Debug)]
struct GroupEntry {
    name: String,
    shares: Arc<AtomicU32>,
    alive: Arc<AtomicBool>,
    /// Per-core series of this group. Dropping the entry unregisters them
    /// from every shard at once.
    registrations: Vec<Registration>,
}

/// Process-wide table of scheduling groups, owned by the runtime root.
///
/// Mutations take the table write lock. Renames re-key the metric series
/// while still holding it, and cores register their series under at least
/// the read lock, so the label a series carries always matches the name the
/// table reports.
#[derive(Debug)]
pub(crate) struct SchedulingGroupTable {
    entries: Vec<Option<GroupEntry>>,
    max: usize,
}

impl SchedulingGroupTable {
    #[track_caller]
    pub(crate) fn new(max: usize) -> Self {
        assert!(max > 0, "at least the main scheduling group must fit");

        let mut entries = Vec::with_capacity(max);
        entries.push(Some(GroupEntry {
            name: MAIN_GROUP_NAME.to_string(),
            shares: Arc::new(AtomicU32::new(MAIN_GROUP_SHARES)),
            alive: Arc::new(AtomicBool::new(true)),
            registrations: Vec::new(),
        }));

        Self { entries, max }
    }

    pub(crate) fn create(&mut self, name: &str, shares: u32) -> Result<SchedulingGroup> {
        if self.find(name).is_some() {
            return Err(Error::NameInUse(name.to_string()));
        }

        let entry = GroupEntry {
            name: name.to_string(),
            shares: Arc::new(AtomicU32::new(shares.max(1))),
            alive: Arc::new(AtomicBool::new(true)),
            registrations: Vec::new(),
        };

        // Lowest free index first, keeping ids small.
        if let Some(index) = self.entries.iter().position(Option::is_none) {
            self.entries[index] = Some(entry);
            return Ok(SchedulingGroup::from_index(index));
        }

        if self.entries.len() >= self.max {
            return Err(Error::TooManySchedulingGroups { max: self.max });
        }

        self.entries.push(Some(entry));
        Ok(SchedulingGroup::from_index(self.entries.len() - 1))
    }

    /// Frees the slot. Cores notice through the `alive` flag and fold their
    /// local queue into the main group.
    pub(crate) fn destroy(&mut self, group: SchedulingGroup) -> Result<()> {
        if group.is_main() {
            return Err(Error::Other(Arc::new(anyhow::anyhow!(
                "the main scheduling group cannot be destroyed"
            ))));
        }

        let entry = self
            .entries
            .get_mut(group.index())
            .and_then(Option::take)
            .ok_or(Error::NoSuchSchedulingGroup)?;

        entry.alive.store(false, Ordering::Release);
        Ok(())
    }

    pub(crate) fn rename(
        &mut self,
        group: SchedulingGroup,
        name: &str,
        metrics: &MetricsRegistry,
    ) -> Result<()> {
        if let Some(other) = self.find(name) {
            return if other == group {
                Ok(())
            } else {
                Err(Error::NameInUse(name.to_string()))
            };
        }

        let entry = self.entry_mut(group)?;
        let old = std::mem::replace(&mut entry.name, name.to_string());
        let moved = metrics.relabel(METRICS_GROUP, "group", &old, name);

        tracing::debug!(from = %old, to = %name, series = moved, "renamed scheduling group");
        Ok(())
    }

    pub(crate) fn handle(&self, group: SchedulingGroup) -> Result<GroupHandle> {
        let entry = self.entry(group)?;
        Ok(GroupHandle {
            group,
            name: entry.name.clone(),
            shares: Arc::clone(&entry.shares),
            alive: Arc::clone(&entry.alive),
        })
    }

    pub(crate) fn attach(&mut self, group: SchedulingGroup, regs: Vec<Registration>) -> Result<()> {
        self.entry_mut(group)?.registrations.extend(regs);
        Ok(())
    }

    pub(crate) fn name(&self, group: SchedulingGroup) -> Result<String> {
        self.entry(group).map(|e| e.name.clone())
    }

    pub(crate) fn shares(&self, group: SchedulingGroup) -> Result<u32> {
        self.entry(group).map(|e| e.shares.load(Ordering::Relaxed))
    }

    pub(crate) fn set_shares(&self, group: SchedulingGroup, shares: u32) -> Result<()> {
        self.entry(group)
            .map(|e| e.shares.store(shares.max(1), Ordering::Relaxed))
    }

    pub(crate) fn find(&self, name: &str) -> Option<SchedulingGroup> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.name == name))
            .map(SchedulingGroup::from_index)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    fn entry(&self, group: SchedulingGroup) -> Result<&GroupEntry> {
        self.entries
            .get(group.index())
            .and_then(Option::as_ref)
            .ok_or(Error::NoSuchSchedulingGroup)
    }

    fn entry_mut(&mut self, group: SchedulingGroup) -> Result<&mut GroupEntry> {
        self.entries
            .get_mut(group.index())
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchSchedulingGroup)
    }
}
