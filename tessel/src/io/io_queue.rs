use crate::context;
use crate::error::{Error, Result};
use crate::future::{failed, promise, Deferred, Promise};
use crate::io::fair_group::{FairGroup, FairGroupConfig, FairQueueTicket};
use crate::io::fair_queue::{ClassId, FairQueue, FairQueueEntryKey};
use crate::io::intent::{IntentLink, IoIntent};
use crate::io::priority_class::{ClassHandle, IoPriorityClass, METRICS_GROUP};
use crate::io::{DeviceId, IoCompletion, IoDone, IoRequest, IoSink};
use crate::metrics::{labels, MetricKind, MetricValue, Registration};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Capacity and cost model of one device.
///
/// A read costs `read_request_base_count` units of weight and the same
/// number of units per `1 << request_ticket_size_shift` bytes. Writes are
/// scaled by the two multipliers, expressed relative to that base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoQueueConfig {
    /// Mountpoint-like label of the queue's metric series.
    pub name: String,
    pub max_request_count: u32,
    pub max_bytes_count: u64,
    /// Requests above this length are split before queueing.
    pub max_request_length: usize,
    pub read_request_base_count: u32,
    pub disk_req_write_to_read_multiplier: u32,
    pub disk_bytes_write_to_read_multiplier: u32,
    pub request_ticket_size_shift: u32,
}

impl Default for IoQueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_request_count: 128,
            max_bytes_count: 16 << 20,
            max_request_length: 128 << 10,
            read_request_base_count: 128,
            disk_req_write_to_read_multiplier: 128,
            disk_bytes_write_to_read_multiplier: 128,
            request_ticket_size_shift: 9,
        }
    }
}

impl IoQueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn fair_group_config(&self) -> FairGroupConfig {
        let base = self.read_request_base_count as u64;
        let units = self.max_bytes_count >> self.request_ticket_size_shift;
        FairGroupConfig {
            max_weight: saturate(self.max_request_count as u64 * base),
            max_size: saturate(units * base),
        }
    }

    pub fn ticket_for(&self, req_len: usize, is_write: bool) -> FairQueueTicket {
        let (weight, per_unit) = if is_write {
            (
                self.disk_req_write_to_read_multiplier,
                self.disk_bytes_write_to_read_multiplier,
            )
        } else {
            (self.read_request_base_count, self.read_request_base_count)
        };
        let units = (req_len as u64) >> self.request_ticket_size_shift;
        FairQueueTicket::new(weight, saturate(units * per_unit as u64))
    }
}

fn saturate(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

#[derive(Debug, Default)]
pub(crate) struct ClassStats {
    pub(crate) total_requests: MetricValue,
    pub(crate) total_bytes: MetricValue,
    pub(crate) queue_length: MetricValue,
    pub(crate) total_delay_usec: MetricValue,
    pub(crate) starvation_time_usec: MetricValue,
}

#[derive(Debug)]
struct LocalClass {
    id: ClassId,
    handle: ClassHandle,
    shares: u32,
    executing: usize,
    // Set while requests wait and none of the class is in flight.
    starving_since: Option<Instant>,
    stats: ClassStats,
}

impl LocalClass {
    fn stop_starving(&mut self, now: Instant) {
        if let Some(since) = self.starving_since.take() {
            let waited = now.saturating_duration_since(since);
            self.stats.starvation_time_usec.add(waited.as_micros() as u64);
        }
    }
}

struct PendingRequest {
    req: IoRequest,
    promise: Promise<IoDone>,
    serial: u64,
    queued_at: Instant,
    _link: Option<IntentLink>,
}

struct Inner {
    fq: FairQueue<PendingRequest>,
    // Keyed by class serial, never by the reusable class id.
    classes: HashMap<u64, LocalClass>,
    free_ids: Vec<ClassId>,
    next_id: ClassId,
}

/// Admission control of one device on one core.
///
/// Requests are queued per priority class and dispatched into the core's
/// [`IoSink`] while the device's [`FairGroup`], shared with every other core,
/// has capacity left. A request holds its ticket until it completes.
pub(crate) struct IoQueue {
    core: usize,
    device: DeviceId,
    cfg: IoQueueConfig,
    group: Arc<FairGroup>,
    inner: RefCell<Inner>,
    sink: Rc<IoSink>,
}

impl IoQueue {
    pub(crate) fn new(
        core: usize,
        device: DeviceId,
        cfg: IoQueueConfig,
        group: Arc<FairGroup>,
        sink: Rc<IoSink>,
    ) -> Self {
        Self {
            core,
            device,
            cfg,
            inner: RefCell::new(Inner {
                fq: FairQueue::new(Arc::clone(&group)),
                classes: HashMap::new(),
                free_ids: Vec::new(),
                next_id: 0,
            }),
            group,
            sink,
        }
    }

    pub(crate) fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn max_request_length(&self) -> usize {
        self.cfg.max_request_length.max(1)
    }

    pub(crate) fn waiters(&self) -> usize {
        self.inner.borrow().fq.waiters()
    }

    pub(crate) fn executing(&self) -> usize {
        self.inner.borrow().fq.requests_currently_executing()
    }

    /// Queues `req` in `class`. Nothing reaches the sink before the next
    /// [`IoQueue::poll_io_queue`].
    pub(crate) fn queue_request(
        self: &Rc<Self>,
        class: IoPriorityClass,
        req: IoRequest,
        intent: Option<&IoIntent>,
    ) -> Deferred<IoDone> {
        if intent.is_some_and(IoIntent::is_cancelled) {
            return failed(Error::Cancelled);
        }

        let id = match self.local_class(class) {
            Ok(id) => id,
            Err(e) => return failed(e),
        };

        let ticket = self.cfg.ticket_for(req.len(), req.is_write());
        let (p, d) = promise();
        let link = intent.map(IoIntent::reserve);
        let index = link.as_ref().map(IntentLink::index);
        let now = Instant::now();

        let key = {
            let mut inner = self.inner.borrow_mut();
            let pending = PendingRequest {
                req,
                promise: p,
                serial: class.serial(),
                queued_at: now,
                _link: link,
            };
            match inner.fq.queue(id, ticket, pending) {
                Ok(key) => {
                    if let Some(local) = inner.classes.get_mut(&class.serial()) {
                        local.stats.queue_length.add(1);
                        if local.executing == 0 {
                            local.starving_since.get_or_insert(now);
                        }
                    }
                    key
                }
                Err(e) => {
                    drop(inner);
                    return failed(e);
                }
            }
        };

        if let (Some(intent), Some(index)) = (intent, index) {
            intent.bind(index, self, key);
        }
        d
    }

    /// The fair queue id serving `class` here, set up on first use.
    fn local_class(&self, class: IoPriorityClass) -> Result<ClassId> {
        if let Some(local) = self.inner.borrow().classes.get(&class.serial()) {
            return if local.handle.alive.load(Ordering::Acquire) {
                Ok(local.id)
            } else {
                Err(Error::NoSuchPriorityClass)
            };
        }

        let shared = context::with_shared(Arc::clone);
        let shard = self.core.to_string();

        // Write lock: the series get attached to the class entry, and its
        // name cannot change under us.
        let mut table = shared.classes.write();
        let handle = table.handle(class)?;
        let stats = ClassStats::default();
        let series = [
            ("total_requests", MetricKind::Counter, stats.total_requests.clone()),
            ("total_bytes", MetricKind::Counter, stats.total_bytes.clone()),
            ("queue_length", MetricKind::Gauge, stats.queue_length.clone()),
            ("total_delay_usec", MetricKind::Counter, stats.total_delay_usec.clone()),
            ("starvation_time_usec", MetricKind::Counter, stats.starvation_time_usec.clone()),
        ];

        let mut regs: Vec<Registration> = Vec::with_capacity(series.len());
        for (name, kind, value) in series {
            match shared.metrics.register(
                METRICS_GROUP,
                name,
                kind,
                labels([
                    ("class", handle.name.clone()),
                    ("mountpoint", self.cfg.name.clone()),
                    ("shard", shard.clone()),
                ]),
                value,
            ) {
                Ok(reg) => regs.push(reg),
                Err(e) => tracing::warn!(class = %handle.name, error = %e, "io queue metric"),
            }
        }
        table.attach(class, regs)?;
        drop(table);

        let mut inner = self.inner.borrow_mut();
        let id = match inner.free_ids.pop() {
            Some(id) => id,
            None => {
                inner.next_id += 1;
                inner.next_id - 1
            }
        };
        let shares = handle.shares.load(Ordering::Relaxed);
        inner.fq.register_priority_class(id, shares);
        tracing::debug!(core = self.core, device = ?self.device, class = %handle.name, id, "io class attached");

        inner.classes.insert(
            handle.serial,
            LocalClass {
                id,
                handle,
                shares,
                executing: 0,
                starving_since: None,
                stats,
            },
        );
        Ok(id)
    }

    /// Picks up share changes and drops unregistered classes once drained.
    fn sync_classes(inner: &mut Inner) {
        let Inner {
            fq,
            classes,
            free_ids,
            ..
        } = inner;

        classes.retain(|_, local| {
            if !local.handle.alive.load(Ordering::Acquire) {
                if fq.class_waiters(local.id) > 0 || local.executing > 0 {
                    return true;
                }
                fq.unregister_priority_class(local.id);
                free_ids.push(local.id);
                return false;
            }

            let shares = local.handle.shares.load(Ordering::Relaxed);
            if shares != local.shares && fq.update_shares(local.id, shares).is_ok() {
                local.shares = shares;
            }
            true
        });
    }

    /// Moves every request the group has room for into the sink.
    pub(crate) fn poll_io_queue(self: &Rc<Self>) -> usize {
        let mut dispatched: SmallVec<[(FairQueueTicket, PendingRequest); 16]> = SmallVec::new();
        {
            let mut inner = self.inner.borrow_mut();
            Self::sync_classes(&mut inner);
            if inner.fq.waiters() == 0 {
                return 0;
            }
            inner
                .fq
                .dispatch_requests(|ticket, pending| dispatched.push((ticket, pending)));

            let now = Instant::now();
            for (_, pending) in &dispatched {
                if let Some(local) = inner.classes.get_mut(&pending.serial) {
                    let delay = now.saturating_duration_since(pending.queued_at);
                    local.stats.queue_length.sub(1);
                    local.stats.total_delay_usec.add(delay.as_micros() as u64);
                    local.executing += 1;
                    local.stop_starving(now);
                }
            }
        }

        let n = dispatched.len();
        for (ticket, pending) in dispatched {
            // Dropping the link detaches the request from its intent.
            let PendingRequest {
                req,
                promise,
                serial,
                ..
            } = pending;
            self.sink.submit(
                req,
                Box::new(QueuedCompletion {
                    queue: Rc::downgrade(self),
                    group: Arc::clone(&self.group),
                    ticket,
                    serial,
                    promise,
                }),
            );
        }
        n
    }

    fn finish(&self, ticket: FairQueueTicket, serial: u64, res: &Result<IoDone>) {
        let mut inner = self.inner.borrow_mut();
        inner.fq.notify_request_finished(ticket);

        let Some(id) = inner.classes.get(&serial).map(|l| l.id) else {
            return;
        };
        let starving = inner.fq.class_waiters(id) > 0;
        if let Some(local) = inner.classes.get_mut(&serial) {
            local.executing = local.executing.saturating_sub(1);
            local.stats.total_requests.add(1);
            if let Ok(done) = res {
                local.stats.total_bytes.add(done.bytes as u64);
            }
            if local.executing == 0 && starving {
                local.starving_since.get_or_insert_with(Instant::now);
            }
        }
    }

    /// Removes a queued request and fails it. False if it already left.
    pub(crate) fn cancel_request(&self, key: FairQueueEntryKey) -> bool {
        let pending = {
            let mut inner = self.inner.borrow_mut();
            let Some(pending) = inner.fq.notify_request_cancelled(key) else {
                return false;
            };
            let left = inner.fq.class_waiters(key.class);
            if let Some(local) = inner.classes.get_mut(&pending.serial) {
                local.stats.queue_length.sub(1);
                if left == 0 {
                    local.starving_since = None;
                }
            }
            pending
        };
        pending.promise.set_error(Error::Cancelled);
        true
    }

    /// Sleeping is only safe while this core has a completion of its own
    /// coming back, or nothing queued. Capacity released by other cores
    /// does not wake it.
    pub(crate) fn can_sleep(&self) -> bool {
        let inner = self.inner.borrow();
        inner.fq.waiters() == 0 || inner.fq.requests_currently_executing() > 0
    }
}

impl fmt::Debug for IoQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("IoQueue")
            .field("core", &self.core)
            .field("device", &self.device)
            .field("name", &self.cfg.name)
            .field("waiters", &inner.fq.waiters())
            .field("executing", &inner.fq.requests_currently_executing())
            .finish()
    }
}

struct QueuedCompletion {
    queue: Weak<IoQueue>,
    group: Arc<FairGroup>,
    ticket: FairQueueTicket,
    serial: u64,
    promise: Promise<IoDone>,
}

impl IoCompletion for QueuedCompletion {
    fn complete_with(self: Box<Self>, res: Result<IoDone>) {
        match self.queue.upgrade() {
            Some(queue) => queue.finish(self.ticket, self.serial, &res),
            // The queue went away at teardown, the capacity is still owed.
            None => self.group.release(self.ticket),
        }
        self.promise.set_result(res);
    }
}

#[cfg(test)]
mod tests;
