use crate::io::{DeviceId, IoQueueConfig};
use crate::runtime::Runtime;
use crate::utils::thread::allowed_cpus;
use anyhow::Context as _;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Time a core spends running tasks before it polls for events again.
const TASK_QUOTA: Duration = Duration::from_micros(500);

/// Spin this long without work before sleeping in the kernel.
const IDLE_POLL_TIME: Duration = Duration::from_micros(200);

/// Tasks of one group run back to back at most this many times per pick.
const MAX_TASK_BACKLOG: usize = 1000;

const SMP_QUEUE_CAPACITY: usize = 128;

const SMP_BATCH_SIZE: usize = 16;

const ALIEN_QUEUE_CAPACITY: usize = 1024;

const LOWRES_CLOCK_GRANULARITY: Duration = Duration::from_millis(10);

const MAX_SCHEDULING_GROUPS: usize = 16;

const MAX_PRIORITY_CLASSES: usize = 32;

const SYSCALL_THREADS: usize = 2;

const URING_ENTRIES: u32 = 256;

/// Kernel interface the reactors wait on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// epoll with eventfd and timerfd. Disk io goes through the syscall pool.
    #[default]
    Epoll,

    /// io_uring, for readiness, socket io and disk io alike.
    Uring,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    // Core 0 runs on the thread calling `block_on`.
    let next = Arc::new(AtomicUsize::new(1));

    ThreadNameFn(Arc::new(move || {
        let id = next.fetch_add(1, Ordering::Relaxed);
        format!("tessel-{id}")
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and builds a [`Runtime`].
///
/// ```no_run
/// let rt = tessel::runtime::Builder::new()
///     .cores(4)
///     .task_quota(std::time::Duration::from_micros(250))
///     .try_build()?;
/// rt.block_on(async { /* ... */ });
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Reactor cores, one OS thread each. Defaults to one per cpu the
    /// process may run on.
    cores: Option<usize>,

    thread_name: ThreadNameFn,

    thread_stack_size: Option<usize>,

    /// Pins core `n` to the `n`th allowed cpu.
    pin_cores: bool,

    backend: BackendKind,

    task_quota: Duration,

    idle_poll_time: Duration,

    max_task_backlog: usize,

    /// Capacity of each cross-core ring, per direction and core pair.
    smp_queue_capacity: usize,

    /// Items a core takes from one ring before moving on to the next.
    smp_batch_size: usize,

    alien_queue_capacity: usize,

    lowres_clock_granularity: Duration,

    max_scheduling_groups: usize,

    max_priority_classes: usize,

    syscall_threads: usize,

    /// Submission queue size of each io_uring instance.
    uring_entries: u32,

    io_queues: BTreeMap<DeviceId, IoQueueConfig>,

    /// Stop the runtime on SIGINT and SIGTERM.
    handle_default_signals: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            cores: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            pin_cores: false,
            backend: BackendKind::default(),
            task_quota: TASK_QUOTA,
            idle_poll_time: IDLE_POLL_TIME,
            max_task_backlog: MAX_TASK_BACKLOG,
            smp_queue_capacity: SMP_QUEUE_CAPACITY,
            smp_batch_size: SMP_BATCH_SIZE,
            alien_queue_capacity: ALIEN_QUEUE_CAPACITY,
            lowres_clock_granularity: LOWRES_CLOCK_GRANULARITY,
            max_scheduling_groups: MAX_SCHEDULING_GROUPS,
            max_priority_classes: MAX_PRIORITY_CLASSES,
            syscall_threads: SYSCALL_THREADS,
            uring_entries: URING_ENTRIES,
            io_queues: BTreeMap::new(),
            handle_default_signals: true,
        }
    }

    #[track_caller]
    pub fn cores(mut self, val: usize) -> Self {
        assert!(val > 0, "cores must be greater than 0");
        self.cores = Some(val);
        self
    }

    /// Sets the name of every core thread but core 0, which keeps the name
    /// of the thread it is built on.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function generating the names of core threads. The default
    /// yields "tessel-{N}" where N is the core id.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) of core threads.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    pub fn pin_cores(mut self, val: bool) -> Self {
        self.pin_cores = val;
        self
    }

    pub fn backend(mut self, val: BackendKind) -> Self {
        self.backend = val;
        self
    }

    /// Sets the time slice after which running tasks are asked to yield,
    /// see [`crate::need_preempt`].
    #[track_caller]
    pub fn task_quota(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "task_quota must be greater than 0");
        self.task_quota = val;
        self
    }

    pub fn idle_poll_time(mut self, val: Duration) -> Self {
        self.idle_poll_time = val;
        self
    }

    #[track_caller]
    pub fn max_task_backlog(mut self, val: usize) -> Self {
        assert!(val > 0, "max_task_backlog must be greater than 0");
        self.max_task_backlog = val;
        self
    }

    #[track_caller]
    pub fn smp_queue_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "smp_queue_capacity must be greater than 0");
        self.smp_queue_capacity = val;
        self
    }

    #[track_caller]
    pub fn smp_batch_size(mut self, val: usize) -> Self {
        assert!(val > 0, "smp_batch_size must be greater than 0");
        self.smp_batch_size = val;
        self
    }

    #[track_caller]
    pub fn alien_queue_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "alien_queue_capacity must be greater than 0");
        self.alien_queue_capacity = val;
        self
    }

    #[track_caller]
    pub fn lowres_clock_granularity(mut self, val: Duration) -> Self {
        assert!(
            !val.is_zero(),
            "lowres_clock_granularity must be greater than 0"
        );
        self.lowres_clock_granularity = val;
        self
    }

    /// Bounds the scheduling group table, main group included.
    #[track_caller]
    pub fn max_scheduling_groups(mut self, val: usize) -> Self {
        assert!(val > 0, "max_scheduling_groups must be greater than 0");
        self.max_scheduling_groups = val;
        self
    }

    /// Bounds the io priority class table, default class included.
    #[track_caller]
    pub fn max_priority_classes(mut self, val: usize) -> Self {
        assert!(val > 0, "max_priority_classes must be greater than 0");
        self.max_priority_classes = val;
        self
    }

    #[track_caller]
    pub fn syscall_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "syscall_threads must be greater than 0");
        self.syscall_threads = val;
        self
    }

    #[track_caller]
    pub fn uring_entries(mut self, val: u32) -> Self {
        assert!(val.is_power_of_two(), "uring_entries must be a power of two");
        self.uring_entries = val;
        self
    }

    /// Gives `device` an io queue of its own on every core. Files on
    /// devices without one use the queue of [`DeviceId::DEFAULT`].
    #[track_caller]
    pub fn io_queue(mut self, device: DeviceId, cfg: IoQueueConfig) -> Self {
        assert!(cfg.max_request_count > 0, "max_request_count must be greater than 0");
        assert!(cfg.max_bytes_count > 0, "max_bytes_count must be greater than 0");
        assert!(
            cfg.max_request_length > 0,
            "max_request_length must be greater than 0"
        );
        self.io_queues.insert(device, cfg);
        self
    }

    pub fn handle_default_signals(mut self, val: bool) -> Self {
        self.handle_default_signals = val;
        self
    }

    /// Creates the configured [`Runtime`]. Core 0 is installed on the
    /// calling thread, the other cores are running once this returns.
    pub fn try_build(self) -> anyhow::Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;
        Runtime::try_new(cfg)
    }
}

/// A validated [`Builder`], shared by every core.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) cores: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    /// Cpu of every core when pinning, indexed by core id.
    pub(crate) cpus: Option<Vec<usize>>,
    pub(crate) backend: BackendKind,
    pub(crate) task_quota: Duration,
    pub(crate) idle_poll_time: Duration,
    pub(crate) max_task_backlog: usize,
    pub(crate) smp_queue_capacity: usize,
    pub(crate) smp_batch_size: usize,
    pub(crate) alien_queue_capacity: usize,
    pub(crate) lowres_clock_granularity: Duration,
    pub(crate) max_scheduling_groups: usize,
    pub(crate) max_priority_classes: usize,
    pub(crate) syscall_threads: usize,
    pub(crate) uring_entries: u32,
    io_queues: BTreeMap<DeviceId, IoQueueConfig>,
    pub(crate) handle_default_signals: bool,
}

impl RuntimeConfig {
    /// Every configured io queue, the default one included.
    pub(crate) fn io_queues(&self) -> impl Iterator<Item = (DeviceId, &IoQueueConfig)> + '_ {
        self.io_queues.iter().map(|(device, cfg)| (*device, cfg))
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.io_queues.contains_key(&DeviceId::DEFAULT),
            "the default io queue is missing"
        );
        if let Some(cpus) = &self.cpus {
            anyhow::ensure!(
                cpus.len() == self.cores,
                "cannot pin {} cores on {} allowed cpus",
                self.cores,
                cpus.len()
            );
        }
        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let allowed = allowed_cpus().context("failed to read the cpu affinity mask")?;
        let cores = builder.cores.unwrap_or(allowed.len().max(1));

        let cpus = builder
            .pin_cores
            .then(|| allowed.iter().copied().take(cores).collect::<Vec<_>>());

        let mut io_queues = builder.io_queues;
        io_queues
            .entry(DeviceId::DEFAULT)
            .or_insert_with(|| IoQueueConfig::named("default"));

        let cfg = RuntimeConfig {
            cores,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            cpus,
            backend: builder.backend,
            task_quota: builder.task_quota,
            idle_poll_time: builder.idle_poll_time,
            max_task_backlog: builder.max_task_backlog,
            smp_queue_capacity: builder.smp_queue_capacity,
            smp_batch_size: builder.smp_batch_size,
            alien_queue_capacity: builder.alien_queue_capacity,
            lowres_clock_granularity: builder.lowres_clock_granularity,
            max_scheduling_groups: builder.max_scheduling_groups,
            max_priority_classes: builder.max_priority_classes,
            syscall_threads: builder.syscall_threads,
            uring_entries: builder.uring_entries,
            io_queues,
            handle_default_signals: builder.handle_default_signals,
        };

        cfg.validate()?;
        Ok(cfg)
    }
}
