//! The per-core event loop.
//!
//! Every iteration of [`Reactor::run_loop`] does three things:
//!
//! 1. Runs a slice of ready tasks, picking scheduling groups in virtual
//!    runtime order until the task quota expires.
//! 2. Polls every registered [`Poller`] once: cross-core queues, the alien
//!    queue, io queues, kernel completions, timers and signals.
//! 3. When nothing made progress for `idle_poll_time`, asks every poller to
//!    enter interrupt mode and blocks in the backend until a kernel event, a
//!    timer or a cross-core wakeup arrives.
use crate::context::{self, CoreHandle, Shared};
use crate::error::{Error, Result};
use crate::future::{failed, guarded, promise, Promise};
use crate::io::{DeviceId, IoQueue, IoSink};
use crate::memory;
use crate::metrics::{labels, MetricKind, MetricValue, Registration};
use crate::runtime::BackendKind;
use crate::sched::{self, SchedulingGroup, TaskQueueSet};
use crate::smp::SmpBacklog;
use crate::task::{
    FutureTask, JoinHandle, LambdaTask, RootWaker, Task, TaskId, TaskIdGuard, TaskKey, TaskSlots,
    TaskWaker, WakeOutcome, ROOT_TASK_ID,
};
use anyhow::Context as _;
use slab::Slab;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

pub(crate) mod backend;
pub(crate) use backend::ReactorBackend;

mod lowres;
pub use lowres::LowresClock;

pub mod net;

mod pollable;
pub use pollable::PollableFd;
pub(crate) use pollable::PollableFdState;

mod poller;
pub use poller::{register_poller, Poller};

pub mod preempt;
pub use preempt::need_preempt;

mod signals;
pub use signals::handle_signal;
pub(crate) use signals::Signals;

pub(crate) mod timer;
pub use timer::{sleep, sleep_until, timeout, with_timeout, Sleep, Timeout, Timer};

const METRICS_GROUP: &str = "reactor";

/// Resolves the promise behind a cross-thread request once its result is
/// back on the requesting core.
type Resolver = Box<dyn FnOnce(Result<Box<dyn Any + Send>>)>;

#[derive(Debug, Default)]
pub(crate) struct ReactorStats {
    pub(crate) tasks_processed: MetricValue,
    pub(crate) tasks_pending: MetricValue,
    pub(crate) tasks_run_over_quota: MetricValue,
    pub(crate) polls: MetricValue,
    pub(crate) sleeps: MetricValue,
}

pub(crate) struct Reactor {
    pub(crate) core: Arc<CoreHandle>,

    pub(crate) shared: Arc<Shared>,

    pub(crate) timers: RefCell<timer::TimerSet>,

    pub(crate) slots: RefCell<TaskSlots>,

    pub(crate) queues: RefCell<TaskQueueSet>,

    /// Waiting-task cell of every live future task, for backtraces.
    links: RefCell<HashMap<TaskId, Rc<Cell<Option<TaskId>>>>>,

    /// Cross-core and blocking-pool requests awaiting their reply.
    remote: RefCell<Slab<Resolver>>,

    /// Items for other cores that did not fit their ring yet, indexed by peer.
    pub(crate) smp_out: RefCell<Vec<SmpBacklog>>,

    pub(crate) backend: Box<dyn ReactorBackend>,

    /// Requests dispatched by the io queues, drained by the backend.
    pub(crate) sink: Rc<IoSink>,

    io_queues: RefCell<HashMap<DeviceId, Rc<IoQueue>>>,

    pollers: RefCell<Vec<Box<dyn Poller>>>,

    pub(crate) signals: RefCell<Signals>,

    lowres_timer: RefCell<Option<Timer>>,

    pub(crate) stats: ReactorStats,

    registrations: RefCell<Vec<Registration>>,
}

impl Reactor {
    pub(crate) fn try_new(shared: Arc<Shared>, id: usize) -> anyhow::Result<Rc<Self>> {
        let core = Arc::clone(shared.core(id)?);

        let backend: Box<dyn ReactorBackend> = match shared.cfg.backend {
            BackendKind::Epoll => Box::new(
                backend::EpollBackend::try_new(&core).context("failed to set up epoll backend")?,
            ),
            BackendKind::Uring => Box::new(
                backend::UringBackend::try_new(&shared.cfg, &core)
                    .context("failed to set up io_uring backend")?,
            ),
        };

        let peers = shared.num_cores();
        Ok(Rc::new(Self {
            core,
            timers: RefCell::new(timer::TimerSet::default()),
            slots: RefCell::new(TaskSlots::default()),
            queues: RefCell::new(TaskQueueSet::default()),
            links: RefCell::new(HashMap::new()),
            remote: RefCell::new(Slab::new()),
            smp_out: RefCell::new((0..peers).map(|_| SmpBacklog::default()).collect()),
            backend,
            sink: Rc::new(IoSink::new()),
            io_queues: RefCell::new(HashMap::new()),
            pollers: RefCell::new(Vec::new()),
            signals: RefCell::new(Signals::default()),
            lowres_timer: RefCell::new(None),
            stats: ReactorStats::default(),
            registrations: RefCell::new(Vec::new()),
            shared,
        }))
    }

    /// Second construction step, run once the reactor is installed in the
    /// thread context since timers and queues reach it through there.
    pub(crate) fn start(self: &Rc<Self>) -> anyhow::Result<()> {
        anyhow::ensure!(
            sched::ensure_local_queue(self, SchedulingGroup::MAIN),
            "main scheduling group is missing"
        );

        self.register_stats();

        for (device, cfg) in self.shared.cfg.io_queues() {
            let Some(group) = self.shared.fair_groups.get(&device) else {
                continue;
            };
            let queue = IoQueue::new(
                self.id(),
                device,
                cfg.clone(),
                Arc::clone(group),
                Rc::clone(&self.sink),
            );
            self.io_queues.borrow_mut().insert(device, Rc::new(queue));
        }

        poller::install_builtin_pollers(self);

        if self.id() == 0 {
            let granularity = self.shared.cfg.lowres_clock_granularity;
            LowresClock::refresh();
            let timer = Timer::new(LowresClock::refresh);
            timer.arm_periodic(granularity);
            *self.lowres_timer.borrow_mut() = Some(timer);

            if self.shared.cfg.handle_default_signals {
                signals::install_default_handlers(self)
                    .context("failed to install default signal handlers")?;
            }
        }

        tracing::debug!(core = self.id(), backend = ?self.shared.cfg.backend, "reactor started");
        Ok(())
    }

    fn register_stats(&self) {
        let shard = self.id().to_string();
        let series = [
            ("tasks_processed", MetricKind::Counter, &self.stats.tasks_processed),
            ("tasks_pending", MetricKind::Gauge, &self.stats.tasks_pending),
            ("tasks_run_over_quota", MetricKind::Counter, &self.stats.tasks_run_over_quota),
            ("polls", MetricKind::Counter, &self.stats.polls),
            ("sleeps", MetricKind::Counter, &self.stats.sleeps),
        ];

        let mut regs = self.registrations.borrow_mut();
        for (name, kind, value) in series {
            match self.shared.metrics.register(
                METRICS_GROUP,
                name,
                kind,
                labels([("shard", shard.clone())]),
                value.clone(),
            ) {
                Ok(reg) => regs.push(reg),
                Err(e) => tracing::warn!(error = %e, "reactor metric"),
            }
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.core.id()
    }

    // ---- tasks -------------------------------------------------------------

    pub(crate) fn spawn_local<F>(&self, group: SchedulingGroup, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = TaskId::next();
        let waiter = Rc::new(Cell::new(None));

        if let Err(e) = memory::on_alloc_point() {
            return JoinHandle::new(failed(e), id, waiter);
        }

        let (promise, deferred) = promise();
        let key = self.slots.borrow_mut().reserve();
        let waker = TaskWaker::new_waker(Arc::clone(&self.core), key);

        let task = Box::new(FutureTask::new(
            id,
            key,
            group,
            Box::pin(fut),
            promise,
            Rc::clone(&waiter),
            waker,
        ));

        self.links.borrow_mut().insert(id, Rc::clone(&waiter));
        self.repark(key, task);

        JoinHandle::new(deferred, id, waiter)
    }

    pub(crate) fn schedule_task(&self, task: Box<dyn Task>) {
        let group = task.scheduling_group();
        let key = self.slots.borrow_mut().insert_queued(task);
        self.enqueue(group, key);
    }

    pub(crate) fn schedule(&self, f: Box<dyn FnOnce()>) {
        let group = context::current_scheduling_group();
        self.schedule_task(Box::new(LambdaTask::new(f, group)));
    }

    /// Hands a task that returned pending back to its slot.
    pub(crate) fn repark(&self, key: TaskKey, task: Box<dyn Task>) {
        let outcome = self.slots.borrow_mut().repark(key, task);
        if let WakeOutcome::Enqueue(group) = outcome {
            self.enqueue(group, key);
        }
    }

    pub(crate) fn wake_local(&self, key: TaskKey) {
        let outcome = self.slots.borrow_mut().wake(key);
        if let WakeOutcome::Enqueue(group) = outcome {
            self.enqueue(group, key);
        }
    }

    fn enqueue(&self, group: SchedulingGroup, key: TaskKey) {
        if self.queues.borrow_mut().push(group, key) {
            return;
        }

        // First task of the group on this core, or the group is gone.
        let group = if sched::ensure_local_queue(self, group) {
            group
        } else {
            SchedulingGroup::MAIN
        };

        if !self.queues.borrow_mut().push(group, key)
            && !self.queues.borrow_mut().push(SchedulingGroup::MAIN, key)
        {
            tracing::error!(?key, "no run queue left for task");
        }
    }

    pub(crate) fn unlink_task(&self, id: TaskId) {
        self.links.borrow_mut().remove(&id);
    }

    pub(crate) fn backtrace_of(&self, id: TaskId) -> Vec<TaskId> {
        let links = self.links.borrow();
        let mut chain = vec![id];
        let mut cursor = id;

        while let Some(waiter) = links.get(&cursor).and_then(|cell| cell.get()) {
            if waiter.is_root() || chain.contains(&waiter) {
                break;
            }
            chain.push(waiter);
            cursor = waiter;
        }
        chain
    }

    fn drain_remote_wakes(&self) -> bool {
        let mut woke = false;
        while let Some(key) = self.core.pop_remote_wake() {
            self.wake_local(key);
            woke = true;
        }
        woke
    }

    // ---- cross-thread replies ----------------------------------------------

    /// Parks `promise` until a reply for the returned id comes back through
    /// [`Reactor::resolve_remote`].
    pub(crate) fn register_remote<T: Send + 'static>(&self, promise: Promise<T>) -> usize {
        self.register_callback(move |res: Result<T>| promise.set_result(res))
    }

    /// Like [`Reactor::register_remote`], runs `f` with the reply instead.
    pub(crate) fn register_callback<T, F>(&self, f: F) -> usize
    where
        T: Send + 'static,
        F: FnOnce(Result<T>) + 'static,
    {
        self.remote.borrow_mut().insert(Box::new(move |res| {
            let res = res.and_then(|any| {
                any.downcast::<T>().map(|v| *v).map_err(|_| {
                    Error::Other(Arc::new(anyhow::anyhow!("cross-core reply of the wrong type")))
                })
            });
            f(res);
        }))
    }

    pub(crate) fn resolve_remote(&self, id: usize, res: Result<Box<dyn Any + Send>>) {
        let resolver = self.remote.borrow_mut().try_remove(id);
        match resolver {
            Some(resolve) => resolve(res),
            None => tracing::warn!(id, "reply for an unknown cross-core request"),
        }
    }

    // ---- io ----------------------------------------------------------------

    /// The io queue serving `device` on this core, the default queue for
    /// devices without one of their own.
    pub(crate) fn io_queue(&self, device: DeviceId) -> Option<Rc<IoQueue>> {
        let queues = self.io_queues.borrow();
        queues
            .get(&device)
            .or_else(|| queues.get(&DeviceId::DEFAULT))
            .cloned()
    }

    pub(crate) fn io_queues(&self) -> Vec<Rc<IoQueue>> {
        self.io_queues.borrow().values().cloned().collect()
    }

    // ---- loop --------------------------------------------------------------

    /// Runs the loop with `fut` as the root future until it resolves.
    ///
    /// Returns [`Error::Shutdown`] if the runtime is stopped first.
    pub(crate) fn block_on<F: Future>(&self, fut: F) -> Result<F::Output> {
        let mut fut = std::pin::pin!(fut);
        let waker = RootWaker::new_waker(Arc::clone(&self.core));
        let mut cx = Context::from_waker(&waker);
        let mut out = None;

        self.core.wake_root();
        self.run_loop(|| {
            let _id = TaskIdGuard::enter(ROOT_TASK_ID);
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(v) => {
                    out = Some(v);
                    true
                }
                Poll::Pending => false,
            }
        });

        out.ok_or(Error::Shutdown)
    }

    /// Runs the loop until the runtime stops. Used by every core but 0.
    pub(crate) fn run(&self) {
        self.run_loop(|| false);
    }

    fn run_loop(&self, mut poll_root: impl FnMut() -> bool) {
        let idle_poll_time = self.shared.cfg.idle_poll_time;
        let mut idle_since: Option<Instant> = None;

        loop {
            if self.shared.is_stopping() {
                tracing::trace!(core = self.id(), "reactor loop stopping");
                return;
            }

            if self.core.take_root_woken() && poll_root() {
                return;
            }

            let mut busy = self.drain_remote_wakes();
            busy |= self.run_some_tasks();
            busy |= self.poll_pollers();

            if busy || !self.queues.borrow().is_empty() {
                idle_since = None;
                continue;
            }

            let since = *idle_since.get_or_insert_with(Instant::now);
            if since.elapsed() < idle_poll_time {
                std::hint::spin_loop();
                continue;
            }

            self.sleep();
            idle_since = None;
        }
    }

    fn run_some_tasks(&self) -> bool {
        if self.queues.borrow().is_empty() {
            return false;
        }

        let quota = self.shared.cfg.task_quota;
        let backlog = self.shared.cfg.max_task_backlog;
        let _slice = preempt::arm(quota);
        let mut total = 0u64;

        while !need_preempt() {
            let Some(group) = self.queues.borrow_mut().pick_group() else {
                break;
            };

            let prev = context::set_current_scheduling_group(group);
            let started = Instant::now();
            let mut ran = 0u64;

            while let Some(key) = self.queues.borrow_mut().pop_task(group) {
                let task = self.slots.borrow_mut().begin_run(key);
                if let Some(task) = task {
                    let t0 = Instant::now();
                    if let Err(e) = guarded(|| task.run_and_dispose()) {
                        tracing::error!(error = %e, "task panicked outside of a future");
                    }
                    self.slots.borrow_mut().finish_run(key);
                    ran += 1;

                    let took = t0.elapsed();
                    if took > quota {
                        self.stats.tasks_run_over_quota.add(1);
                        tracing::debug!(core = self.id(), ?took, ?quota, "task ran past its quota");
                    }
                }

                if need_preempt() || ran as usize >= backlog {
                    break;
                }
            }

            context::set_current_scheduling_group(prev);
            self.queues
                .borrow_mut()
                .finish_group(group, started.elapsed(), ran);
            total += ran;
        }

        self.stats.tasks_processed.add(total);
        self.stats
            .tasks_pending
            .set(self.queues.borrow().len() as u64);
        total > 0
    }

    fn take_pollers(&self) -> Vec<Box<dyn Poller>> {
        std::mem::take(&mut *self.pollers.borrow_mut())
    }

    /// Puts pollers back, after any registered while they were out.
    fn restore_pollers(&self, mut pollers: Vec<Box<dyn Poller>>) {
        let mut slot = self.pollers.borrow_mut();
        pollers.append(&mut slot);
        *slot = pollers;
    }

    pub(crate) fn add_poller(&self, poller: Box<dyn Poller>) {
        self.pollers.borrow_mut().push(poller);
    }

    fn poll_pollers(&self) -> bool {
        self.stats.polls.add(1);
        let mut pollers = self.take_pollers();
        let mut busy = false;
        for poller in pollers.iter_mut() {
            busy |= poller.poll();
        }
        self.restore_pollers(pollers);
        busy
    }

    fn sleep(&self) {
        if !self.core.enter_sleep() {
            return;
        }

        let mut pollers = self.take_pollers();
        let mut entered = 0;
        for poller in pollers.iter_mut() {
            if !poller.try_enter_interrupt_mode() {
                break;
            }
            entered += 1;
        }

        let can_sleep = entered == pollers.len()
            && !self.shared.has_pending_for(self.id())
            && self.queues.borrow().is_empty();

        if can_sleep {
            let deadline = self.timers.borrow().next_deadline();
            if let Err(e) = self.backend.arm_highres_timer(deadline) {
                fatal("failed to arm the highres timer", e);
            }

            self.stats.sleeps.add(1);
            if let Err(e) = self.backend.wait_and_process_events() {
                tracing::warn!(core = self.id(), error = %e, "kernel wait failed");
            }
        }

        for poller in pollers[..entered].iter_mut().rev() {
            poller.exit_interrupt_mode();
        }
        self.restore_pollers(pollers);
        self.core.exit_sleep();
    }

    /// Drops every task, timer and pending reply owned by this core. Runs on
    /// the reactor thread with the reactor still installed, since dropping
    /// futures reaches back into it.
    pub(crate) fn teardown(&self) {
        drop(self.take_pollers());
        drop(self.lowres_timer.borrow_mut().take());

        // Dropped futures may spawn or wake, so go until nothing is left.
        for _ in 0..4 {
            let keys = self.queues.borrow_mut().take_all();
            let tasks = self.slots.borrow_mut().take_all();
            let timers = self.timers.borrow_mut().take_all();
            let remote = std::mem::take(&mut *self.remote.borrow_mut());
            let backlog = std::mem::take(&mut *self.smp_out.borrow_mut());

            let idle = tasks.is_empty() && timers.is_empty() && remote.is_empty();
            drop((keys, tasks, timers, remote, backlog));
            if idle {
                break;
            }
        }

        self.links.borrow_mut().clear();
        self.io_queues.borrow_mut().clear();
        self.signals.borrow_mut().restore();
        self.registrations.borrow_mut().clear();
        tracing::debug!(core = self.id(), "reactor torn down");
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("core", &self.id())
            .field("tasks", &self.slots.borrow().len())
            .field("runnable", &self.queues.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .finish()
    }
}

/// Logs and aborts. For kernel setup failures the reactor cannot run without.
#[cold]
pub(crate) fn fatal(what: &str, err: impl fmt::Display) -> ! {
    tracing::error!(error = %err, "{what}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use crate::{spawn, yield_now};
    use anyhow::Result;
    use std::time::Duration;

    #[tessel::test]
    async fn test_tasks_run_in_spawn_order() -> Result<()> {
        let order = Rc::new(RefCell::new(Vec::new()));
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = Rc::clone(&order);
                spawn(async move { order.borrow_mut().push(i) })
            })
            .collect();

        for h in handles {
            h.await?;
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[tessel::test]
    async fn test_long_task_is_counted_over_quota() -> Result<()> {
        let before = context::with_reactor(|r| r.stats.tasks_run_over_quota.get());
        spawn(async {
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(3) {}
        })
        .await?;

        let after = context::with_reactor(|r| r.stats.tasks_run_over_quota.get());
        assert!(after > before);
        Ok(())
    }

    #[tessel::test]
    async fn test_reactor_sleeps_when_idle() -> Result<()> {
        let before = context::with_reactor(|r| r.stats.sleeps.get());
        sleep(Duration::from_millis(20)).await;
        let after = context::with_reactor(|r| r.stats.sleeps.get());
        assert!(after > before);
        Ok(())
    }

    #[tessel::test]
    async fn test_remote_wake_from_foreign_thread() -> Result<()> {
        let (tx, rx) = futures::channel::oneshot::channel::<u32>();
        let handle = spawn(async move { rx.await.unwrap_or(0) });
        yield_now().await;

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            let _ = tx.send(9);
        });

        assert_eq!(handle.await?, 9);
        Ok(())
    }

    #[tessel::test]
    async fn test_spawn_allocation_failure_fails_handle() -> Result<()> {
        memory::with_failure_injector(|inj| inj.fail_after(0));
        let handle = spawn(async { 1 });
        memory::with_failure_injector(|inj| inj.cancel());

        assert_eq!(handle.await, Err(Error::AllocationFailed));
        Ok(())
    }

    #[tessel::test]
    async fn test_preemption_interleaves_busy_tasks() -> Result<()> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let busy = |tag: u8, log: Rc<RefCell<Vec<u8>>>| async move {
            for _ in 0..3 {
                let start = Instant::now();
                while !need_preempt() && start.elapsed() < Duration::from_millis(5) {}
                log.borrow_mut().push(tag);
                crate::maybe_yield().await;
            }
        };

        let a = spawn(busy(1, Rc::clone(&log)));
        let b = spawn(busy(2, Rc::clone(&log)));
        a.await?;
        b.await?;

        let log = log.borrow();
        assert_eq!(log.len(), 6);
        // Neither task ran all of its rounds before the other started.
        assert_ne!(&log[..3], &[1, 1, 1]);
        Ok(())
    }
}
