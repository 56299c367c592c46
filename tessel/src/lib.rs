//! A thread-per-core, share-nothing async runtime.
//!
//! Every core runs a reactor of its own on a dedicated thread. Tasks never
//! leave the core they were spawned on, so they need not be `Send`, and
//! cores talk to each other only through message queues ([`smp`]). Disk io
//! goes through per-device io queues that share the device's capacity
//! fairly between priority classes ([`io`]).
//!
//! ```no_run
//! #[tessel::main(cores = 2)]
//! async fn main() -> tessel::Result<()> {
//!     let remote = tessel::smp::submit_to(1, || async { tessel::smp::this_core() }).await?;
//!     assert_eq!(remote, 1);
//!     Ok(())
//! }
//! ```
#[doc(inline)]
pub use tessel_macros::main;

#[doc(inline)]
pub use tessel_macros::test;

mod context;

mod error;
pub use error::{Error, Result};

pub mod future;

pub mod io;

pub mod memory;

pub mod metrics;

pub mod reactor;
pub use reactor::{need_preempt, sleep, sleep_until, timeout, with_timeout};

pub mod runtime;
pub use runtime::{maybe_yield, schedule, spawn, spawn_in, stop, yield_now};

pub mod sched;

pub mod smp;

pub mod sync;

pub mod task;

mod utils;

#[cfg(test)]
mod test_utils;
