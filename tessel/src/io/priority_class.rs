//! Process-wide registry of io priority classes.
use crate::context;
use crate::error::{Error, Result};
use crate::metrics::{MetricsRegistry, Registration};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Metric group of the per-class io queue series.
pub(crate) const METRICS_GROUP: &str = "io_queue";

pub(crate) const DEFAULT_CLASS_NAME: &str = "default";
pub(crate) const DEFAULT_CLASS_SHARES: u32 = 1000;

static SERIALS: AtomicU64 = AtomicU64::new(1);

/// A weighted class of io requests. Every io queue of the runtime serves the
/// class, with the same shares and under the same name.
///
/// Handles stay valid until the class is unregistered. Ids of unregistered
/// classes get reused, a stale handle never resolves to the new class.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoPriorityClass {
    id: u32,
    serial: u64,
}

/// What an io queue needs to serve one class.
#[derive(Debug, Clone)]
pub(crate) struct ClassHandle {
    pub(crate) serial: u64,
    pub(crate) name: String,
    pub(crate) shares: Arc<AtomicU32>,
    pub(crate) alive: Arc<AtomicBool>,
}

#[derive(Debug)]
struct ClassEntry {
    serial: u64,
    name: String,
    shares: Arc<AtomicU32>,
    alive: Arc<AtomicBool>,
    registrations: Vec<Registration>,
}

/// Bounded table of priority classes. Lock order: this table, then the
/// metrics registry.
#[derive(Debug)]
pub(crate) struct PriorityClassTable {
    entries: Vec<Option<ClassEntry>>,
    free: Vec<usize>,
    max: usize,
}

impl PriorityClassTable {
    #[track_caller]
    pub(crate) fn new(max: usize) -> Self {
        assert!(max > 0, "the default priority class must fit");
        let mut table = Self {
            entries: Vec::with_capacity(max),
            free: Vec::new(),
            max,
        };
        // Never fails on an empty table with room for one.
        let _ = table.register(DEFAULT_CLASS_NAME, DEFAULT_CLASS_SHARES);
        table
    }

    pub(crate) fn register(&mut self, name: &str, shares: u32) -> Result<IoPriorityClass> {
        if self.find(name).is_some() {
            return Err(Error::NameInUse(name.to_string()));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.entries.len() < self.max => {
                self.entries.push(None);
                self.entries.len() - 1
            }
            None => return Err(Error::TooManyPriorityClasses { max: self.max }),
        };

        let serial = SERIALS.fetch_add(1, Ordering::Relaxed);
        self.entries[index] = Some(ClassEntry {
            serial,
            name: name.to_string(),
            shares: Arc::new(AtomicU32::new(shares.max(1))),
            alive: Arc::new(AtomicBool::new(true)),
            registrations: Vec::new(),
        });

        Ok(IoPriorityClass {
            id: index as u32,
            serial,
        })
    }

    pub(crate) fn unregister(&mut self, class: IoPriorityClass) -> Result<()> {
        self.entry(class)?;
        let index = class.id as usize;
        if let Some(entry) = self.entries[index].take() {
            entry.alive.store(false, Ordering::Release);
        }
        self.free.push(index);
        Ok(())
    }

    pub(crate) fn rename(&mut self, class: IoPriorityClass, name: &str, metrics: &MetricsRegistry) -> Result<()> {
        if let Some(other) = self.find(name) {
            return if other == class {
                Ok(())
            } else {
                Err(Error::NameInUse(name.to_string()))
            };
        }

        let entry = self.entry_mut(class)?;
        let old = std::mem::replace(&mut entry.name, name.to_string());
        let moved = metrics.relabel(METRICS_GROUP, "class", &old, name);
        tracing::debug!(from = %old, to = %name, series = moved, "renamed priority class");
        Ok(())
    }

    pub(crate) fn handle(&self, class: IoPriorityClass) -> Result<ClassHandle> {
        let entry = self.entry(class)?;
        Ok(ClassHandle {
            serial: entry.serial,
            name: entry.name.clone(),
            shares: Arc::clone(&entry.shares),
            alive: Arc::clone(&entry.alive),
        })
    }

    pub(crate) fn attach(&mut self, class: IoPriorityClass, regs: Vec<Registration>) -> Result<()> {
        self.entry_mut(class)?.registrations.extend(regs);
        Ok(())
    }

    pub(crate) fn find(&self, name: &str) -> Option<IoPriorityClass> {
        self.entries.iter().enumerate().find_map(|(id, e)| {
            let e = e.as_ref()?;
            (e.name == name).then_some(IoPriorityClass {
                id: id as u32,
                serial: e.serial,
            })
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    fn entry(&self, class: IoPriorityClass) -> Result<&ClassEntry> {
        self.entries
            .get(class.id as usize)
            .and_then(Option::as_ref)
            .filter(|e| e.serial == class.serial)
            .ok_or(Error::NoSuchPriorityClass)
    }

    fn entry_mut(&mut self, class: IoPriorityClass) -> Result<&mut ClassEntry> {
        self.entries
            .get_mut(class.id as usize)
            .and_then(Option::as_mut)
            .filter(|e| e.serial == class.serial)
            .ok_or(Error::NoSuchPriorityClass)
    }
}

impl IoPriorityClass {
    /// Registers a class with the running runtime. Names must be unique.
    pub fn register(name: &str, shares: u32) -> Result<Self> {
        context::with_shared(|s| s.classes.write().register(name, shares))
    }

    /// The class every request without an explicit class belongs to.
    pub fn default_class() -> Self {
        context::with_shared(|s| s.classes.read().find(DEFAULT_CLASS_NAME))
            .unwrap_or(IoPriorityClass { id: 0, serial: 1 })
    }

    pub fn id(&self) -> usize {
        self.id as usize
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub fn name(&self) -> Option<String> {
        context::with_shared(|s| s.classes.read().entry(*self).ok().map(|e| e.name.clone()))
    }

    pub fn shares(&self) -> Option<u32> {
        context::with_shared(|s| {
            s.classes
                .read()
                .entry(*self)
                .ok()
                .map(|e| e.shares.load(Ordering::Relaxed))
        })
    }

    /// Takes effect on every core the next time its io queue dispatches.
    pub fn update_shares(&self, shares: u32) -> Result<()> {
        context::with_shared(|s| {
            s.classes
                .read()
                .entry(*self)
                .map(|e| e.shares.store(shares.max(1), Ordering::Relaxed))
        })
    }

    /// Renames the class, moving every metric series it owns.
    pub fn rename(&self, name: &str) -> Result<()> {
        context::with_shared(|s| s.classes.write().rename(*self, name, &s.metrics))
    }

    /// Frees the class. Requests already queued still complete; new ones
    /// fail with [`Error::NoSuchPriorityClass`].
    pub fn unregister(self) -> Result<()> {
        context::with_shared(|s| s.classes.write().unregister(self))
    }
}

impl fmt::Debug for IoPriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoPriorityClass({}#{})", self.id, self.serial)
    }
}

/// Shorthand for [`IoPriorityClass::register`].
pub fn register_priority_class(name: &str, shares: u32) -> Result<IoPriorityClass> {
    IoPriorityClass::register(name, shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use anyhow::Result;

    #[test]
    fn test_table_is_bounded() {
        let mut table = PriorityClassTable::new(3);
        assert_eq!(table.len(), 1);
        assert!(table.register("a", 10).is_ok());
        assert!(table.register("b", 10).is_ok());
        assert_eq!(
            table.register("c", 10),
            Err(Error::TooManyPriorityClasses { max: 3 })
        );
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_ids_are_reused_but_handles_are_not() {
        let mut table = PriorityClassTable::new(4);
        let a = table.register("a", 10).expect("room");
        table.unregister(a).expect("registered");

        let b = table.register("b", 20).expect("room");
        assert_eq!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(table.handle(a).err(), Some(Error::NoSuchPriorityClass));
        assert_eq!(table.unregister(a), Err(Error::NoSuchPriorityClass));
        assert_eq!(table.handle(b).map(|h| h.name).ok().as_deref(), Some("b"));
    }

    #[test]
    fn test_names_are_unique() {
        let metrics = MetricsRegistry::new();
        let mut table = PriorityClassTable::new(4);
        let a = table.register("a", 10).expect("room");
        let b = table.register("b", 10).expect("room");

        assert_eq!(table.register("a", 1), Err(Error::NameInUse("a".into())));
        assert_eq!(table.rename(b, "a", &metrics), Err(Error::NameInUse("a".into())));
        assert_eq!(table.rename(a, "a", &metrics), Ok(()));
    }

    #[tessel::test]
    async fn test_handle_api() -> Result<()> {
        let class = register_priority_class("compaction", 100)?;
        assert_eq!(class.name().as_deref(), Some("compaction"));
        assert_eq!(class.shares(), Some(100));

        class.update_shares(0)?;
        assert_eq!(class.shares(), Some(1));

        class.rename("background")?;
        assert_eq!(class.name().as_deref(), Some("background"));

        class.unregister()?;
        assert_eq!(class.name(), None);
        assert_eq!(IoPriorityClass::default_class().name().as_deref(), Some("default"));
        Ok(())
    }
}
