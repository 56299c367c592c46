use crate::error::{Error, Result};
use crate::reactor::sleep;
use futures::future::{select, Either};
use slab::Slab;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::rc::{Rc, Weak};
use std::time::Duration;

type Callback = Box<dyn FnOnce()>;

#[derive(Default)]
struct AbortState {
    requested: bool,
    subscribers: Slab<Callback>,
}

/// Broadcasts a one-time abort request to whoever subscribed.
///
/// Clones share the same state, so any clone may request the abort.
#[derive(Clone, Default)]
pub struct AbortSource {
    state: Rc<RefCell<AbortState>>,
}

/// Keeps a callback subscribed to an [`AbortSource`]. Dropping it
/// unsubscribes; a subscription outliving its source is inert.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    state: Weak<RefCell<AbortState>>,
    key: usize,
}

impl AbortSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` once, when the abort is requested. Returns `None` if it
    /// already was; `f` is dropped without running then.
    pub fn subscribe(&self, f: impl FnOnce() + 'static) -> Option<Subscription> {
        let mut state = self.state.borrow_mut();
        if state.requested {
            return None;
        }
        let key = state.subscribers.insert(Box::new(f));
        Some(Subscription {
            state: Rc::downgrade(&self.state),
            key,
        })
    }

    /// Runs every subscriber, in subscription order. Later calls do nothing.
    pub fn request_abort(&self) {
        let subscribers = {
            let mut state = self.state.borrow_mut();
            if state.requested {
                return;
            }
            state.requested = true;
            std::mem::take(&mut state.subscribers)
        };

        tracing::trace!(subscribers = subscribers.len(), "abort requested");
        // Subscribers may subscribe or drop subscriptions while running.
        for (_, f) in subscribers {
            f();
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.state.borrow().requested
    }

    /// Fails with [`Error::AbortRequested`] once the abort was requested.
    pub fn check(&self) -> Result<()> {
        if self.abort_requested() {
            Err(Error::AbortRequested)
        } else {
            Ok(())
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.borrow_mut().subscribers.try_remove(self.key);
        }
    }
}

impl fmt::Debug for AbortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("AbortSource")
            .field("requested", &state.requested)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

/// Runs `fut` until it completes or `abort` is requested, whichever comes
/// first. An aborted `fut` is dropped before this returns.
pub async fn abortable<F: Future>(fut: F, abort: &AbortSource) -> Result<F::Output> {
    abort.check()?;

    let (p, d) = crate::future::promise::<()>();
    let slot = Rc::new(RefCell::new(Some(p)));
    let on_abort = Rc::clone(&slot);
    let _sub = abort.subscribe(move || {
        if let Some(p) = on_abort.borrow_mut().take() {
            p.set_error(Error::AbortRequested);
        }
    });

    // Polled first, so a completion racing the abort still wins.
    match select(pin!(fut), d).await {
        Either::Left((out, _)) => Ok(out),
        Either::Right((res, _)) => Err(res.err().unwrap_or(Error::AbortRequested)),
    }
}

/// Sleeps for `duration`, failing early with [`Error::AbortRequested`].
pub async fn sleep_abortable(duration: Duration, abort: &AbortSource) -> Result<()> {
    abortable(sleep(duration), abort).await
}
