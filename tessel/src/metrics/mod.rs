//! Process-wide metrics registry.
//!
//! Series are keyed by `(group, name, labels)`. Every core registers its own
//! series (they carry a `shard` label) but they all live in the one registry
//! owned by the runtime root. Renames of scheduling groups and priority classes
//! re-key series in place under the write lock, so a concurrent `snapshot`
//! observes either the old or the new label value, never both or neither.
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// Shared value cell. The owning component updates it with relaxed atomics,
/// readers take a snapshot.
#[derive(Debug, Clone, Default)]
pub struct MetricValue(Arc<AtomicU64>);

impl MetricValue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, delta: u64) {
        self.0.fetch_sub(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub group: String,
    pub name: String,
    pub labels: Labels,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}{{", self.group, self.name)?;
        for (i, (k, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}=\"{v}\"")?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub key: SeriesKey,
    pub kind: MetricKind,
    pub value: u64,
}

#[derive(Debug)]
struct Series {
    id: u64,
    kind: MetricKind,
    value: MetricValue,
}

#[derive(Debug, Default)]
struct Inner {
    series: BTreeMap<SeriesKey, Series>,
    index: HashMap<u64, SeriesKey>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: RwLock<Inner>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers one series. The returned [`Registration`] removes it on drop.
    pub fn register(
        self: &Arc<Self>,
        group: &str,
        name: &str,
        kind: MetricKind,
        labels: Labels,
        value: MetricValue,
    ) -> Result<Registration> {
        let key = SeriesKey {
            group: group.to_string(),
            name: name.to_string(),
            labels,
        };

        let mut inner = self.inner.write();
        if inner.series.contains_key(&key) {
            return Err(Error::DuplicateMetric(key.to_string()));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.index.insert(id, key.clone());
        inner.series.insert(key, Series { id, kind, value });

        Ok(Registration {
            registry: Arc::downgrade(self),
            id,
        })
    }

    fn unregister(&self, id: u64) {
        let mut inner = self.inner.write();
        if let Some(key) = inner.index.remove(&id) {
            inner.series.remove(&key);
        }
    }

    /// Re-keys every series of `group` whose `label` equals `from` so that it
    /// equals `to`. Returns the number of series moved.
    pub fn relabel(&self, group: &str, label: &str, from: &str, to: &str) -> usize {
        if from == to {
            return 0;
        }

        let mut inner = self.inner.write();

        let moving: Vec<SeriesKey> = inner
            .series
            .keys()
            .filter(|k| k.group == group && k.labels.get(label).is_some_and(|v| v == from))
            .cloned()
            .collect();

        for old in &moving {
            let Some(series) = inner.series.remove(old) else {
                continue;
            };

            let mut new = old.clone();
            new.labels.insert(label.to_string(), to.to_string());

            inner.index.insert(series.id, new.clone());
            inner.series.insert(new, series);
        }

        moving.len()
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.inner
            .read()
            .series
            .iter()
            .map(|(key, s)| Sample {
                key: key.clone(),
                kind: s.kind,
                value: s.value.get(),
            })
            .collect()
    }

    /// Distinct values of `label` across all series of `group`.
    pub fn label_values(&self, group: &str, label: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .series
            .keys()
            .filter(|k| k.group == group)
            .filter_map(|k| k.labels.get(label).cloned())
            .collect()
    }

    pub fn get(&self, group: &str, name: &str, labels: &Labels) -> Option<u64> {
        let key = SeriesKey {
            group: group.to_string(),
            name: name.to_string(),
            labels: labels.clone(),
        };
        self.inner.read().series.get(&key).map(|s| s.value.get())
    }

    pub fn len(&self) -> usize {
        self.inner.read().series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a series alive. Dropping it unregisters the series.
#[derive(Debug)]
pub struct Registration {
    registry: Weak<MetricsRegistry>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

/// The registry of the running runtime.
///
/// # Panics
///
/// Panics when called outside of a reactor thread.
#[track_caller]
pub fn registry() -> Arc<MetricsRegistry> {
    crate::context::with_shared(|shared| Arc::clone(&shared.metrics))
}

/// Builds a label set from `(key, value)` pairs.
pub fn labels<const N: usize>(pairs: [(&str, String); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
