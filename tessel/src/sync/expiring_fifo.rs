use crate::error::Result;
use crate::memory;
use crate::reactor::Timer;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Locates an item of an [`ExpiringFifo`] for early removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FifoKey(u64);

struct Entry<T> {
    item: T,
    deadline: Option<Instant>,
    _timer: Option<Timer>,
}

type OnExpiry<T> = Box<dyn FnMut(T)>;

struct FifoInner<T> {
    items: RefCell<BTreeMap<u64, Entry<T>>>,
    // Entries with a deadline, soonest first.
    deadlines: RefCell<BTreeSet<(Instant, u64)>>,
    next: Cell<u64>,
    on_expiry: RefCell<Option<OnExpiry<T>>>,
    expired: RefCell<Vec<T>>,
}

impl<T: 'static> FifoInner<T> {
    fn hand_over(&self, expired: Vec<T>) {
        if expired.is_empty() {
            return;
        }
        self.expired.borrow_mut().extend(expired);

        // Taken out so the callback may push or pop freely. A nested call
        // finds the slot empty and leaves its items to the outer loop.
        let Some(mut cb) = self.on_expiry.borrow_mut().take() else {
            return;
        };
        loop {
            let batch = std::mem::take(&mut *self.expired.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for item in batch {
                cb(item);
            }
        }
        *self.on_expiry.borrow_mut() = Some(cb);
    }

    fn unindex(&self, seq: u64, entry: &Entry<T>) {
        if let Some(d) = entry.deadline {
            self.deadlines.borrow_mut().remove(&(d, seq));
        }
    }

    fn take(&self, seq: u64) -> Option<T> {
        let entry = self.items.borrow_mut().remove(&seq)?;
        self.unindex(seq, &entry);
        Some(entry.item)
    }

    fn expire_one(&self, seq: u64) {
        if let Some(item) = self.take(seq) {
            self.hand_over(vec![item]);
        }
    }

    fn expire_due(&self, now: Instant) {
        let expired: Vec<T> = {
            let mut deadlines = self.deadlines.borrow_mut();
            let mut items = self.items.borrow_mut();
            let mut out = Vec::new();
            while let Some(&(d, seq)) = deadlines.first() {
                if d > now {
                    break;
                }
                deadlines.pop_first();
                if let Some(e) = items.remove(&seq) {
                    out.push(e.item);
                }
            }
            out
        };
        self.hand_over(expired);
    }
}

/// A FIFO whose items may carry a deadline.
///
/// Items past their deadline leave the queue and go to the expiry callback,
/// either when their timer fires or when an accessor notices first. No
/// accessor ever returns an expired item.
pub struct ExpiringFifo<T: 'static> {
    inner: Rc<FifoInner<T>>,
}

impl<T: 'static> ExpiringFifo<T> {
    pub fn new(on_expiry: impl FnMut(T) + 'static) -> Self {
        Self {
            inner: Rc::new(FifoInner {
                items: RefCell::new(BTreeMap::new()),
                deadlines: RefCell::new(BTreeSet::new()),
                next: Cell::new(0),
                on_expiry: RefCell::new(Some(Box::new(on_expiry))),
                expired: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Appends `item`. Arming the deadline needs a running reactor.
    pub fn push_back(&self, item: T, deadline: Option<Instant>) -> Result<FifoKey> {
        memory::on_alloc_point()?;

        let seq = self.inner.next.get();
        self.inner.next.set(seq + 1);

        let timer = deadline.map(|at| {
            let weak: Weak<FifoInner<T>> = Rc::downgrade(&self.inner);
            let timer = Timer::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.expire_one(seq);
                }
            });
            timer.arm(at);
            timer
        });

        if let Some(at) = deadline {
            self.inner.deadlines.borrow_mut().insert((at, seq));
        }
        self.inner.items.borrow_mut().insert(
            seq,
            Entry {
                item,
                deadline,
                _timer: timer,
            },
        );
        Ok(FifoKey(seq))
    }

    pub fn pop_front(&self) -> Option<T> {
        self.inner.expire_due(Instant::now());
        let (seq, entry) = self.inner.items.borrow_mut().pop_first()?;
        self.inner.unindex(seq, &entry);
        Some(entry.item)
    }

    /// Pops the oldest live item if `f` accepts it.
    pub fn pop_front_if(&self, f: impl FnOnce(&T) -> bool) -> Option<T> {
        self.inner.expire_due(Instant::now());
        let mut items = self.inner.items.borrow_mut();
        let entry = items.first_entry()?;
        if !f(&entry.get().item) {
            return None;
        }
        let seq = *entry.key();
        let entry = entry.remove();
        self.inner.unindex(seq, &entry);
        Some(entry.item)
    }

    /// Runs `f` on the oldest live item.
    pub fn with_front<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.expire_due(Instant::now());
        let items = self.inner.items.borrow();
        items.first_key_value().map(|(_, e)| f(&e.item))
    }

    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.with_front(T::clone)
    }

    /// Takes a specific item out, wherever it is.
    pub fn remove(&self, key: FifoKey) -> Option<T> {
        self.inner.take(key.0)
    }

    /// Drops items from the front while `f` says so.
    pub fn pop_while(&self, mut f: impl FnMut(&T) -> bool) -> Vec<T> {
        self.inner.expire_due(Instant::now());
        let mut items = self.inner.items.borrow_mut();
        let mut out = Vec::new();
        while let Some(entry) = items.first_entry() {
            if !f(&entry.get().item) {
                break;
            }
            let seq = *entry.key();
            let entry = entry.remove();
            self.inner.unindex(seq, &entry);
            out.push(entry.item);
        }
        out
    }

    /// Empties the queue without running the expiry callback.
    pub fn drain(&self) -> Vec<T> {
        self.inner.deadlines.borrow_mut().clear();
        std::mem::take(&mut *self.inner.items.borrow_mut())
            .into_values()
            .map(|e| e.item)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.expire_due(Instant::now());
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn indexed_deadlines(&self) -> usize {
        self.inner.deadlines.borrow().len()
    }
}

impl<T: 'static> fmt::Debug for ExpiringFifo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringFifo")
            .field("len", &self.inner.items.borrow().len())
            .finish()
    }
}
