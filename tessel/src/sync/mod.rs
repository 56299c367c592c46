//! Cooperative synchronization for tasks of one core.
//!
//! Nothing here is `Send`: these primitives order tasks that interleave at
//! await points on a single reactor. Cross-core coordination goes through
//! [`crate::smp`].

mod abort;
pub use abort::{abortable, sleep_abortable, AbortSource, Subscription};

mod condvar;
pub use condvar::{ConditionVariable, CondvarWait};

mod expiring_fifo;
pub use expiring_fifo::{ExpiringFifo, FifoKey};

mod gate;
pub use gate::{with_gate, Gate, GateHolder};

mod rwlock;
pub use rwlock::{with_lock, with_shared, RwLock, RwLockReadGuard, RwLockWriteGuard, SharedMutex};

mod semaphore;
pub use semaphore::{
    get_units, try_get_units, with_semaphore, Semaphore, SemaphoreUnits, SemaphoreWait,
};
