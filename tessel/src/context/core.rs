use crate::task::TaskKey;
use crate::utils::sys::EventFd;
use crossbeam_queue::{ArrayQueue, SegQueue};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::fmt;

/// Work submitted to a core from a thread outside the reactor pool.
pub(crate) type AlienItem = Box<dyn FnOnce() + Send + 'static>;

/// The cross-thread face of one reactor core.
///
/// Everything reachable from other threads lives here: the remote wake queue,
/// the alien queue and the sleep/wake handshake. The reactor itself is `!Send`
/// and never leaves its thread.
///
/// # Sleep/wake protocol
///
/// The reactor publishes `sleeping = true`, issues a `SeqCst` fence and checks
/// every incoming queue once more before blocking. Producers push first, fence,
/// then check-and-clear the flag and write the eventfd only if it was set.
/// One of the two sides always observes the other.
pub(crate) struct CoreHandle {
    id: usize,
    remote_wakes: SegQueue<TaskKey>,
    root_woken: AtomicBool,
    sleeping: AtomicBool,
    wake_fd: EventFd,
    alien: ArrayQueue<AlienItem>,
    wakeups: AtomicU64,
}

impl CoreHandle {
    pub(crate) fn try_new(id: usize, alien_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            id,
            remote_wakes: SegQueue::new(),
            // The root future gets polled once before anything woke it.
            root_woken: AtomicBool::new(true),
            sleeping: AtomicBool::new(false),
            wake_fd: EventFd::new()?,
            alien: ArrayQueue::new(alien_capacity.max(1)),
            wakeups: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake_fd.as_raw_fd()
    }

    /// Wakes a task owned by this core from another thread.
    pub(crate) fn push_remote_wake(&self, key: TaskKey) {
        self.remote_wakes.push(key);
        self.wakeup();
    }

    pub(crate) fn pop_remote_wake(&self) -> Option<TaskKey> {
        self.remote_wakes.pop()
    }

    pub(crate) fn wake_root(&self) {
        self.root_woken.store(true, Ordering::Release);
        self.wakeup();
    }

    pub(crate) fn take_root_woken(&self) -> bool {
        self.root_woken.swap(false, Ordering::AcqRel)
    }

    /// Queues `item` for execution on this core. Blocks the calling thread
    /// while the queue is full; alien threads are never reactor threads.
    pub(crate) fn push_alien(&self, item: AlienItem) {
        let mut item = item;
        loop {
            match self.alien.push(item) {
                Ok(()) => break,
                Err(back) => {
                    item = back;
                    self.wakeup();
                    std::thread::yield_now();
                }
            }
        }
        self.wakeup();
    }

    pub(crate) fn pop_alien(&self) -> Option<AlienItem> {
        self.alien.pop()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.remote_wakes.is_empty()
            || !self.alien.is_empty()
            || self.root_woken.load(Ordering::Acquire)
    }

    /// Called by the owning reactor before it blocks. Returns false if work
    /// raced in, in which case the reactor must not sleep.
    pub(crate) fn enter_sleep(&self) -> bool {
        self.sleeping.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if self.has_pending() {
            self.sleeping.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn exit_sleep(&self) {
        self.sleeping.store(false, Ordering::SeqCst);
        if let Err(e) = self.wake_fd.drain() {
            tracing::warn!(core = self.id, error = %e, "failed to drain wake fd");
        }
    }

    /// Kicks the reactor out of its kernel wait if it is sleeping.
    pub(crate) fn wakeup(&self) {
        fence(Ordering::SeqCst);
        if self.sleeping.swap(false, Ordering::SeqCst) {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.wake_fd.signal() {
                tracing::error!(core = self.id, error = %e, "failed to signal wake fd");
            }
        }
    }

    pub(crate) fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreHandle")
            .field("id", &self.id)
            .field("sleeping", &self.sleeping.load(Ordering::Relaxed))
            .field("remote_wakes", &self.remote_wakes.len())
            .field("alien", &self.alien.len())
            .finish()
    }
}
