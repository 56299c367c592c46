//! Building and running the set of reactor cores.
//!
//! ```no_run
//! use std::process::ExitCode;
//!
//! fn main() -> ExitCode {
//!     tessel::runtime::app::init_logging();
//!     tessel::runtime::app::run(tessel::runtime::Builder::new(), async {
//!         let cores = tessel::smp::invoke_on_all(|| async { tessel::smp::this_core() }).await?;
//!         tracing::info!(?cores, "hello from every core");
//!         Ok::<_, tessel::Error>(())
//!     })
//! }
//! ```
pub mod app;

mod builder;
pub use builder::{BackendKind, Builder};
pub(crate) use builder::RuntimeConfig;

#[allow(clippy::module_inception)]
mod runtime;
pub use runtime::Runtime;

mod spawn;
pub use spawn::{maybe_yield, schedule, spawn, spawn_in, stop, yield_now, YieldNow};
