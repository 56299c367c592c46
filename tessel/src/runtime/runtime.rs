use crate::context::{self, Shared};
use crate::error::{panic_payload_as_str, Error};
use crate::reactor::Reactor;
use crate::runtime::RuntimeConfig;
use crate::smp::AlienHandle;
use crate::utils::sys::raise_fd_ulimit;
use crate::utils::thread::pin_current_thread;
use anyhow::{anyhow, Context as _};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A running set of reactor cores.
///
/// Core 0 lives on the thread that built the runtime and only makes progress
/// inside [`Runtime::block_on`]. Every other core runs on a thread of its own
/// from [`Builder::try_build`](crate::runtime::Builder::try_build) until the
/// runtime is dropped or stopped.
///
/// Dropping the runtime stops every core, joins their threads and drops
/// whatever tasks were still pending.
pub struct Runtime {
    shared: Arc<Shared>,

    core0: Rc<Reactor>,

    threads: Vec<JoinHandle<()>>,

    // Core 0 is bound to the building thread.
    _not_send: PhantomData<Rc<()>>,
}

impl Runtime {
    pub(crate) fn try_new(cfg: RuntimeConfig) -> anyhow::Result<Runtime> {
        anyhow::ensure!(
            !context::is_installed(),
            "cannot build a tessel runtime: a reactor is already running on this thread"
        );

        match raise_fd_ulimit() {
            Ok(limit) => tracing::debug!(limit, "open file limit"),
            Err(e) => tracing::warn!(error = %e, "failed to raise the open file limit"),
        }

        let shared = Arc::new(Shared::try_new(&cfg)?);

        if let Some(cpus) = &cfg.cpus {
            pin_current_thread(cpus[0]).context("failed to pin core 0")?;
        }
        let core0 = Reactor::try_new(Arc::clone(&shared), 0).context("failed to create core 0")?;
        context::install(Rc::clone(&core0));

        let mut rt = Runtime {
            shared,
            core0,
            threads: Vec::with_capacity(cfg.cores.saturating_sub(1)),
            _not_send: PhantomData,
        };

        // Dropping `rt` on failure stops and joins whatever was started.
        rt.core0.start().context("failed to start core 0")?;
        rt.spawn_cores(&cfg)?;

        tracing::info!(cores = cfg.cores, backend = ?cfg.backend, "tessel runtime started");
        Ok(rt)
    }

    fn spawn_cores(&mut self, cfg: &RuntimeConfig) -> anyhow::Result<()> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(cfg.cores);

        for id in 1..cfg.cores {
            let name = (cfg.thread_name.0)();
            let mut builder = thread::Builder::new().name(name.clone());
            if let Some(size) = cfg.thread_stack_size {
                builder = builder.stack_size(size);
            }

            let shared = Arc::clone(&self.shared);
            let cpu = cfg.cpus.as_ref().map(|cpus| cpus[id]);
            let ready_tx = ready_tx.clone();

            let handle = builder
                .spawn(move || core_main(shared, id, cpu, ready_tx))
                .with_context(|| format!("failed to spawn thread {name} for core {id}"))?;
            self.threads.push(handle);
        }
        drop(ready_tx);

        for _ in 1..cfg.cores {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(anyhow!("a core thread exited during startup")),
            }
        }
        Ok(())
    }

    /// Runs `fut` on core 0 until it resolves, driving every task of the core
    /// meanwhile.
    ///
    /// # Panics
    ///
    /// Panics when the runtime stops before `fut` resolves. Use
    /// [`Runtime::try_block_on`] to handle that case.
    #[track_caller]
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        match self.try_block_on(fut) {
            Ok(v) => v,
            Err(e) => panic!("tessel runtime stopped before the future resolved: {e}"),
        }
    }

    /// Like [`Runtime::block_on`], failing with [`Error::Shutdown`] when the
    /// runtime stops first.
    pub fn try_block_on<F: Future>(&self, fut: F) -> crate::Result<F::Output> {
        if self.shared.is_stopping() {
            return Err(Error::Shutdown);
        }
        self.core0.block_on(fut)
    }

    /// A handle for threads outside the runtime to send work in.
    pub fn alien(&self) -> AlienHandle {
        AlienHandle::new(Arc::clone(&self.shared))
    }

    pub fn cores(&self) -> usize {
        self.shared.num_cores()
    }

    /// Asks every core to stop. Pending and later `block_on` calls fail
    /// with [`Error::Shutdown`]. Stopping cannot be undone.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }
}

fn core_main(
    shared: Arc<Shared>,
    id: usize,
    cpu: Option<usize>,
    ready: crossbeam_channel::Sender<anyhow::Result<()>>,
) {
    let reactor = match start_core(&shared, id, cpu) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(core = id, error = %e, "core failed to start");
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    drop(ready);

    reactor.run();
    reactor.teardown();
    context::uninstall();
}

fn start_core(shared: &Arc<Shared>, id: usize, cpu: Option<usize>) -> anyhow::Result<Rc<Reactor>> {
    if let Some(cpu) = cpu {
        pin_current_thread(cpu).with_context(|| format!("failed to pin core {id} to cpu {cpu}"))?;
    }

    let reactor = Reactor::try_new(Arc::clone(shared), id)
        .with_context(|| format!("failed to create core {id}"))?;
    context::install(Rc::clone(&reactor));

    if let Err(e) = reactor.start() {
        reactor.teardown();
        context::uninstall();
        return Err(e.context(format!("failed to start core {id}")));
    }
    Ok(reactor)
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shared.request_stop();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if let Err(payload) = handle.join() {
                tracing::error!(
                    thread = name,
                    panic = panic_payload_as_str(&*payload),
                    "core thread panicked"
                );
            }
        }

        self.core0.teardown();
        context::uninstall();
        tracing::info!("tessel runtime stopped");
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("cores", &self.cores())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::{smp, spawn};
    use anyhow::Result;
    use dashmap::DashMap;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_block_on_many_times() -> Result<()> {
        let rt = Builder::new().cores(1).try_build()?;
        assert_eq!(rt.block_on(async { 1 }), 1);

        // Tasks outlive the block_on that spawned them.
        let handle = rt.block_on(async { spawn(async { 2 }) });
        assert_eq!(rt.block_on(handle)?, 2);
        Ok(())
    }

    #[test]
    fn test_second_runtime_on_thread_fails() -> Result<()> {
        let rt = Builder::new().cores(1).try_build()?;
        let err = Builder::new().cores(1).try_build().err();
        assert!(err.is_some_and(|e| e.to_string().contains("already running")));

        drop(rt);
        let _again = Builder::new().cores(1).try_build()?;
        Ok(())
    }

    #[test]
    fn test_cores_run_on_named_threads() -> Result<()> {
        let rt = Builder::new()
            .cores(3)
            .thread_name_fn({
                let n = std::sync::atomic::AtomicUsize::new(1);
                move || format!("shard-{}", n.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
            })
            .try_build()?;
        assert_eq!(rt.cores(), 3);

        let names = rt.block_on(smp::invoke_on_others(|| async {
            thread::current().name().map(str::to_string)
        }))?;
        assert_eq!(
            names,
            vec![Some("shard-1".to_string()), Some("shard-2".to_string())]
        );
        Ok(())
    }

    #[test]
    fn test_every_core_owns_a_thread() -> Result<()> {
        let seen: Arc<DashMap<usize, thread::ThreadId>> = Arc::new(DashMap::new());
        let rt = Builder::new().cores(4).try_build()?;

        let s = Arc::clone(&seen);
        rt.block_on(smp::invoke_on_all(move || {
            let s = Arc::clone(&s);
            async move {
                s.insert(smp::this_core(), thread::current().id());
            }
        }))?;

        assert_eq!(seen.len(), 4);
        assert_eq!(*seen.get(&0).expect("core 0"), thread::current().id());
        let mut threads: Vec<_> = seen.iter().map(|e| *e.value()).collect();
        threads.sort_by_key(|id| format!("{id:?}"));
        threads.dedup();
        assert_eq!(threads.len(), 4);
        Ok(())
    }

    #[test]
    fn test_stop_fails_later_block_on() -> Result<()> {
        let rt = Builder::new().cores(2).try_build()?;
        rt.stop();
        assert!(rt.is_stopping());
        assert_eq!(rt.try_block_on(async {}), Err(Error::Shutdown));
        Ok(())
    }

    #[test]
    fn test_stop_from_task_interrupts_block_on() -> Result<()> {
        let rt = Builder::new().cores(2).try_build()?;
        let res = rt.try_block_on(async {
            crate::stop();
            crate::sleep(Duration::from_secs(60)).await
        });
        assert_eq!(res, Err(Error::Shutdown));
        Ok(())
    }

    #[test]
    fn test_drop_joins_core_threads() -> Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let rt = Builder::new().cores(2).try_build()?;

        let s = Arc::clone(&seen);
        rt.alien().run_on(1, move || s.lock().push(smp::this_core()))?;
        rt.block_on(crate::sleep(Duration::from_millis(20)));

        drop(rt);
        assert_eq!(*seen.lock(), vec![1]);
        Ok(())
    }
}
