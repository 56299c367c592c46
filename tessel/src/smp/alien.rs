use crate::context::{self, Shared};
use crate::error::{Error, Result};
use crate::future::guarded;
use crate::sched::SchedulingGroup;
use futures::channel::oneshot;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Submits work to the runtime from threads that are not reactor threads.
///
/// Items go through the target core's alien queue. When that queue is full
/// the submitting thread blocks until the core catches up, so never use a
/// handle from inside the runtime: use [`crate::smp::submit_to`] there.
#[derive(Clone)]
pub struct AlienHandle {
    shared: Arc<Shared>,
}

impl AlienHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn cores(&self) -> usize {
        self.shared.num_cores()
    }

    /// Runs `f` on `core` without waiting for it.
    pub fn run_on<F>(&self, core: usize, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.is_stopping() {
            return Err(Error::Shutdown);
        }
        let target = self.shared.core(core)?;
        target.push_alien(Box::new(f));
        Ok(())
    }

    /// Runs `f` on `core` and spawns the future it returns there. The
    /// receiver resolves with the output, or with the error that kept the
    /// future from completing.
    pub fn submit_to<F, Fut, T>(&self, core: usize, f: F) -> oneshot::Receiver<Result<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let item = move || match guarded(f) {
            Ok(fut) => context::with_reactor(|r| {
                let handle = r.spawn_local(SchedulingGroup::MAIN, fut);
                r.spawn_local(SchedulingGroup::MAIN, async move {
                    let _ = tx.send(handle.await);
                });
            }),
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        };

        // On failure the item and its sender are dropped, cancelling `rx`.
        if let Err(e) = self.run_on(core, item) {
            tracing::debug!(core, error = %e, "alien submission rejected");
        }
        rx
    }
}

impl fmt::Debug for AlienHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlienHandle")
            .field("cores", &self.cores())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::{sleep, smp};
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    assert_impl_all!(AlienHandle: Send, Sync, Clone);

    #[test]
    fn test_submit_from_foreign_thread() -> Result<()> {
        let rt = Builder::new().cores(2).try_build()?;
        let alien = rt.alien();

        let worker = std::thread::spawn(move || {
            let on_one = futures::executor::block_on(alien.submit_to(1, || async { smp::this_core() }));
            let on_zero = futures::executor::block_on(alien.submit_to(0, || async { smp::this_core() }));
            (on_one, on_zero)
        });

        rt.block_on(async {
            while !worker.is_finished() {
                sleep(Duration::from_millis(1)).await;
            }
        });

        let (on_one, on_zero) = worker
            .join()
            .map_err(|_| anyhow::anyhow!("alien thread panicked"))?;
        assert_eq!(on_one, Ok(Ok(1)));
        assert_eq!(on_zero, Ok(Ok(0)));
        Ok(())
    }

    #[test]
    fn test_run_on_rejects_unknown_core() -> Result<()> {
        let rt = Builder::new().cores(1).try_build()?;
        let alien = rt.alien();
        assert_eq!(
            alien.run_on(3, || {}),
            Err(Error::NoSuchCore { core: 3, cores: 1 })
        );

        // The sender is dropped with the rejected item.
        let rx = alien.submit_to(3, || async {});
        assert!(futures::executor::block_on(rx).is_err());
        Ok(())
    }

    #[test]
    fn test_run_on_executes_on_core() -> Result<()> {
        let rt = Builder::new().cores(2).try_build()?;
        let alien = rt.alien();
        let ran = Arc::new(AtomicUsize::new(usize::MAX));

        let r = Arc::clone(&ran);
        alien.run_on(1, move || r.store(smp::this_core(), Ordering::Release))?;

        rt.block_on(async {
            while ran.load(Ordering::Acquire) == usize::MAX {
                sleep(Duration::from_millis(1)).await;
            }
        });
        assert_eq!(ran.load(Ordering::Acquire), 1);
        Ok(())
    }
}
