use crate::io::fair_queue::FairQueueEntryKey;
use crate::io::IoQueue;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

type Link = Option<(Weak<IoQueue>, FairQueueEntryKey)>;

#[derive(Default)]
struct IntentState {
    cancelled: Cell<bool>,
    links: RefCell<Slab<Link>>,
    // Links dropped while `links` was borrowed, unlinked on next access.
    orphans: RefCell<Vec<usize>>,
}

impl IntentState {
    fn links(&self) -> std::cell::RefMut<'_, Slab<Link>> {
        let mut links = self.links.borrow_mut();
        for index in self.orphans.borrow_mut().drain(..) {
            links.try_remove(index);
        }
        links
    }
}

/// Cancels every queued request submitted with it at once.
///
/// Requests stay linked to the intent until they are dispatched. Cancelling
/// removes the linked ones from their io queues and fails them with
/// [`crate::Error::Cancelled`] before `cancel` returns; dispatched requests
/// run to completion. Dropping the intent leaves its requests queued.
#[derive(Default)]
pub struct IoIntent {
    state: Rc<IntentState>,
}

/// The side of a link held by the queued request. Unlinks on drop.
#[derive(Debug)]
pub(crate) struct IntentLink {
    state: Weak<IntentState>,
    index: usize,
}

impl IoIntent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    /// Fails every linked request. Returns how many were removed.
    pub fn cancel(&self) -> usize {
        self.state.cancelled.set(true);
        let links = std::mem::take(&mut *self.state.links());

        // Failing a request wakes its awaiter, which may touch the intent.
        let mut removed = 0;
        for (_, link) in links {
            let Some((queue, key)) = link else {
                continue;
            };
            if let Some(queue) = queue.upgrade() {
                if queue.cancel_request(key) {
                    removed += 1;
                }
            }
        }
        tracing::trace!(removed, "io intent cancelled");
        removed
    }

    /// Reserves a link for a request about to be queued.
    pub(crate) fn reserve(&self) -> IntentLink {
        IntentLink {
            state: Rc::downgrade(&self.state),
            index: self.state.links().insert(None),
        }
    }

    pub(crate) fn bind(&self, index: usize, queue: &Rc<IoQueue>, key: FairQueueEntryKey) {
        if let Some(slot) = self.state.links().get_mut(index) {
            *slot = Some((Rc::downgrade(queue), key));
        }
    }

    pub(crate) fn linked(&self) -> usize {
        self.state.links().iter().filter(|(_, l)| l.is_some()).count()
    }

    #[cfg(test)]
    fn reserved(&self) -> usize {
        self.state.links().len()
    }
}

impl IntentLink {
    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

// Dropped at dispatch, or when the request failed to queue.
impl Drop for IntentLink {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        match state.links.try_borrow_mut() {
            Ok(mut links) => {
                links.try_remove(self.index);
            }
            Err(_) => {
                tracing::trace!(index = self.index, "io intent busy, deferring unlink");
                state.orphans.borrow_mut().push(self.index);
            }
        }
    }
}

impl fmt::Debug for IoIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoIntent")
            .field("cancelled", &self.is_cancelled())
            .field("linked", &self.state.links.try_borrow().map(|l| l.len()).ok())
            .finish()
    }
}
