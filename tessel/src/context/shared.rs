use crate::context::CoreHandle;
use crate::error::{Error, Result};
use crate::io::fair_group::FairGroup;
use crate::io::priority_class::PriorityClassTable;
use crate::io::{DeviceId, SyscallPool};
use crate::metrics::MetricsRegistry;
use crate::runtime::RuntimeConfig;
use crate::sched::SchedulingGroupTable;
use crate::smp::SmpQueues;
use anyhow::Context as _;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The runtime root: process-wide state shared by every core.
///
/// Mutated rarely (group and class tables) under `parking_lot` locks, read
/// often. Lock order is table lock first, metrics registry second.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,

    pub(crate) cores: Vec<Arc<CoreHandle>>,

    pub(crate) smp: SmpQueues,

    pub(crate) groups: RwLock<SchedulingGroupTable>,

    pub(crate) classes: RwLock<PriorityClassTable>,

    /// One capacity pool per device, shared by the io queues of every core.
    pub(crate) fair_groups: HashMap<DeviceId, Arc<FairGroup>>,

    pub(crate) metrics: Arc<MetricsRegistry>,

    pub(crate) syscalls: SyscallPool,

    stop: AtomicBool,
}

impl Shared {
    pub(crate) fn try_new(cfg: &RuntimeConfig) -> anyhow::Result<Self> {
        let cores = (0..cfg.cores)
            .map(|id| {
                CoreHandle::try_new(id, cfg.alien_queue_capacity)
                    .map(Arc::new)
                    .with_context(|| format!("failed to create wake eventfd for core {id}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let fair_groups = cfg
            .io_queues()
            .map(|(device, io_cfg)| (device, Arc::new(FairGroup::new(io_cfg.name.clone(), io_cfg.fair_group_config()))))
            .collect();

        Ok(Self {
            cfg: cfg.clone(),
            smp: SmpQueues::new(cfg.cores, cfg.smp_queue_capacity),
            groups: RwLock::new(SchedulingGroupTable::new(cfg.max_scheduling_groups)),
            classes: RwLock::new(PriorityClassTable::new(cfg.max_priority_classes)),
            fair_groups,
            metrics: MetricsRegistry::new(),
            syscalls: SyscallPool::try_new(cfg.syscall_threads)
                .context("failed to start the blocking syscall pool")?,
            stop: AtomicBool::new(false),
            cores,
        })
    }

    pub(crate) fn core(&self, id: usize) -> Result<&Arc<CoreHandle>> {
        self.cores.get(id).ok_or(Error::NoSuchCore {
            core: id,
            cores: self.cores.len(),
        })
    }

    pub(crate) fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::debug!("runtime stop requested");
        }
        for core in &self.cores {
            core.wakeup();
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// True if anything is waiting to be processed by `core`.
    pub(crate) fn has_pending_for(&self, core: usize) -> bool {
        self.is_stopping()
            || self.cores.get(core).is_some_and(|c| c.has_pending())
            || self.smp.has_pending_for(core)
    }
}
