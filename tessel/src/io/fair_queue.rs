use crate::error::{Error, Result};
use crate::io::fair_group::{FairGroup, FairQueueTicket};
use crate::memory;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Index of a priority class inside one fair queue.
pub type ClassId = usize;

/// Accumulated cost is charged as `normalized * SHARES_FACTOR / shares`.
const SHARES_FACTOR: u128 = 1000;

/// Past this point every class cost is rebased towards zero.
const REBASE_THRESHOLD: u64 = 1 << 62;

/// Locates one queued entry, used to cancel it before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FairQueueEntryKey {
    pub class: ClassId,
    seq: u64,
}

#[derive(Debug)]
struct ClassState<E> {
    shares: u32,
    accumulated: u64,
    queue: BTreeMap<u64, (FairQueueTicket, E)>,
}

impl<E> ClassState<E> {
    fn cost(&self, ticket: &FairQueueTicket, capacity: &FairQueueTicket) -> u64 {
        let norm = ticket.normalize(capacity) as u128;
        (norm * SHARES_FACTOR / self.shares.max(1) as u128).min(u64::MAX as u128) as u64
    }
}

/// Weighted fair dispatch of queued requests against a shared [`FairGroup`].
///
/// Within a class requests leave in FIFO order. Across classes the one with
/// the smallest accumulated cost goes next, ties broken by the lower class id.
/// A class becoming active again after idling starts no lower than the cost
/// of the last dispatch, so idle time is not banked as credit.
///
/// Dispatch stops at the first head request that does not fit the group's
/// remaining capacity, nothing behind it is allowed to jump the line.
#[derive(Debug)]
pub struct FairQueue<E> {
    group: Arc<FairGroup>,
    classes: Vec<Option<ClassState<E>>>,
    active: BTreeSet<(u64, ClassId)>,
    last_accumulated: u64,
    next_seq: u64,
    resources_waiting: FairQueueTicket,
    resources_executing: FairQueueTicket,
    requests_queued: usize,
    requests_executing: usize,
}

impl<E> FairQueue<E> {
    pub fn new(group: Arc<FairGroup>) -> Self {
        Self {
            group,
            classes: Vec::new(),
            active: BTreeSet::new(),
            last_accumulated: 0,
            next_seq: 0,
            resources_waiting: FairQueueTicket::default(),
            resources_executing: FairQueueTicket::default(),
            requests_queued: 0,
            requests_executing: 0,
        }
    }

    pub fn group(&self) -> &Arc<FairGroup> {
        &self.group
    }

    #[track_caller]
    pub fn register_priority_class(&mut self, id: ClassId, shares: u32) {
        if self.classes.len() <= id {
            self.classes.resize_with(id + 1, || None);
        }

        assert!(
            self.classes[id].is_none(),
            "priority class {id} registered twice"
        );

        self.classes[id] = Some(ClassState {
            shares: shares.max(1),
            accumulated: self.last_accumulated,
            queue: BTreeMap::new(),
        });
    }

    #[track_caller]
    pub fn unregister_priority_class(&mut self, id: ClassId) {
        let Some(Some(class)) = self.classes.get(id) else {
            panic!("priority class {id} is not registered");
        };
        assert!(
            class.queue.is_empty(),
            "priority class {id} unregistered with queued requests"
        );

        self.classes[id] = None;
    }

    pub fn is_registered(&self, id: ClassId) -> bool {
        matches!(self.classes.get(id), Some(Some(_)))
    }

    pub fn update_shares(&mut self, id: ClassId, shares: u32) -> Result<()> {
        let class = self.class_mut(id)?;
        class.shares = shares.max(1);
        Ok(())
    }

    pub fn shares(&self, id: ClassId) -> Option<u32> {
        self.classes.get(id)?.as_ref().map(|c| c.shares)
    }

    fn class_mut(&mut self, id: ClassId) -> Result<&mut ClassState<E>> {
        self.classes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchPriorityClass)
    }

    /// Queues `entry` in class `id`. Tickets larger than the group capacity are
    /// clamped to it so they can still be dispatched, alone.
    pub fn queue(&mut self, id: ClassId, ticket: FairQueueTicket, entry: E) -> Result<FairQueueEntryKey> {
        let capacity = self.group.capacity();
        let ticket = ticket.clamp_to(&capacity);
        let last_accumulated = self.last_accumulated;
        let seq = self.next_seq;

        let class = self
            .classes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchPriorityClass)?;
        memory::on_alloc_point()?;

        let was_idle = class.queue.is_empty();
        class.queue.insert(seq, (ticket, entry));

        if was_idle {
            class.accumulated = class.accumulated.max(last_accumulated);
            let accumulated = class.accumulated;
            self.active.insert((accumulated, id));
        }

        self.next_seq += 1;
        self.resources_waiting += ticket;
        self.requests_queued += 1;

        Ok(FairQueueEntryKey { class: id, seq })
    }

    /// Removes a queued entry before it was dispatched.
    pub fn notify_request_cancelled(&mut self, key: FairQueueEntryKey) -> Option<E> {
        let class = self.classes.get_mut(key.class)?.as_mut()?;
        let (ticket, entry) = class.queue.remove(&key.seq)?;

        if class.queue.is_empty() {
            let accumulated = class.accumulated;
            self.active.remove(&(accumulated, key.class));
        }

        self.resources_waiting -= ticket;
        self.requests_queued -= 1;
        Some(entry)
    }

    /// Dispatches as many requests as the group capacity allows, handing each
    /// to `cb` with the ticket it holds. The ticket must be returned through
    /// [`FairQueue::notify_request_finished`] once the request completes.
    pub fn dispatch_requests(&mut self, mut cb: impl FnMut(FairQueueTicket, E)) -> usize {
        let capacity = self.group.capacity();
        let mut dispatched = 0;

        while let Some(&(accumulated, id)) = self.active.first() {
            let Some(class) = self.classes[id].as_mut() else {
                self.active.remove(&(accumulated, id));
                continue;
            };

            let Some((&seq, &(ticket, _))) = class.queue.first_key_value() else {
                self.active.remove(&(accumulated, id));
                continue;
            };

            if !self.group.try_grab(ticket) {
                break;
            }

            self.active.remove(&(accumulated, id));
            let Some((ticket, entry)) = class.queue.remove(&seq) else {
                unreachable!("head entry vanished");
            };

            self.last_accumulated = self.last_accumulated.max(accumulated);
            class.accumulated = accumulated.saturating_add(class.cost(&ticket, &capacity));
            if !class.queue.is_empty() {
                self.active.insert((class.accumulated, id));
            }

            self.resources_waiting -= ticket;
            self.resources_executing += ticket;
            self.requests_queued -= 1;
            self.requests_executing += 1;
            dispatched += 1;

            cb(ticket, entry);
        }

        if self.last_accumulated > REBASE_THRESHOLD {
            self.rebase();
        }

        dispatched
    }

    pub fn notify_request_finished(&mut self, ticket: FairQueueTicket) {
        self.group.release(ticket);
        self.resources_executing -= ticket;
        self.requests_executing = self.requests_executing.saturating_sub(1);
    }

    fn rebase(&mut self) {
        let base = self.last_accumulated;
        self.last_accumulated = 0;
        self.active = std::mem::take(&mut self.active)
            .into_iter()
            .map(|(acc, id)| (acc.saturating_sub(base), id))
            .collect();

        for class in self.classes.iter_mut().flatten() {
            class.accumulated = class.accumulated.saturating_sub(base);
        }
    }

    pub fn waiters(&self) -> usize {
        self.requests_queued
    }

    pub fn class_waiters(&self, id: ClassId) -> usize {
        self.classes
            .get(id)
            .and_then(Option::as_ref)
            .map_or(0, |c| c.queue.len())
    }

    pub fn requests_currently_executing(&self) -> usize {
        self.requests_executing
    }

    pub fn resources_currently_waiting(&self) -> FairQueueTicket {
        self.resources_waiting
    }

    pub fn resources_currently_executing(&self) -> FairQueueTicket {
        self.resources_executing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fair_group::FairGroupConfig;
    use crate::memory::with_failure_injector;
    use rstest::rstest;

    fn queue_with_capacity(max_weight: u32) -> FairQueue<(ClassId, usize)> {
        let group = FairGroup::new(
            "disk",
            FairGroupConfig {
                max_weight,
                max_size: u32::MAX,
            },
        );
        FairQueue::new(Arc::new(group))
    }

    fn unit() -> FairQueueTicket {
        FairQueueTicket::new(1, 0)
    }

    /// Dispatch everything, completing requests in dispatch order one at a
    /// time, and return the dispatch order.
    fn drain_in_order(fq: &mut FairQueue<(ClassId, usize)>) -> Vec<(ClassId, usize)> {
        let mut order = Vec::new();
        let mut inflight = std::collections::VecDeque::new();

        loop {
            fq.dispatch_requests(|ticket, e| {
                order.push(e);
                inflight.push_back(ticket);
            });

            match inflight.pop_front() {
                Some(ticket) => fq.notify_request_finished(ticket),
                None => break,
            }
        }

        order
    }

    #[test]
    fn test_equal_shares_alternate() {
        let mut fq = queue_with_capacity(2);
        fq.register_priority_class(0, 100);
        fq.register_priority_class(1, 100);

        for i in 0..10 {
            fq.queue(0, unit(), (0, i)).unwrap();
            fq.queue(1, unit(), (1, i)).unwrap();
        }

        let order = drain_in_order(&mut fq);
        assert_eq!(order.len(), 20);

        // Every window of two dispatches serves both classes.
        for pair in order.chunks(2) {
            assert_ne!(pair[0].0, pair[1].0, "order: {order:?}");
        }

        // FIFO inside each class.
        for class in 0..2 {
            let seen: Vec<usize> = order.iter().filter(|e| e.0 == class).map(|e| e.1).collect();
            assert_eq!(seen, (0..10).collect::<Vec<_>>());
        }
    }

    #[rstest]
    #[case::double(100, 200)]
    #[case::quadruple(100, 400)]
    fn test_shares_proportional_service(#[case] low: u32, #[case] high: u32) {
        let mut fq = queue_with_capacity(1);
        fq.register_priority_class(0, low);
        fq.register_priority_class(1, high);

        let n = 300;
        for i in 0..n {
            fq.queue(0, unit(), (0, i)).unwrap();
            fq.queue(1, unit(), (1, i)).unwrap();
        }

        // Look at the contended prefix, before the high share class drains.
        let order = drain_in_order(&mut fq);
        let window = &order[..n];
        let high_served = window.iter().filter(|e| e.0 == 1).count() as f64;
        let low_served = window.iter().filter(|e| e.0 == 0).count() as f64;

        let ratio = high_served / low_served;
        let expected = high as f64 / low as f64;
        assert!(
            (ratio - expected).abs() / expected < 0.1,
            "ratio {ratio} expected {expected}"
        );
    }

    #[test]
    fn test_outstanding_never_exceeds_capacity() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        let group = Arc::new(FairGroup::new(
            "disk",
            FairGroupConfig {
                max_weight: 16,
                max_size: 4096,
            },
        ));
        let mut fq = FairQueue::new(Arc::clone(&group));
        for id in 0..3 {
            fq.register_priority_class(id, rng.u32(1..1000));
        }

        let mut inflight: Vec<FairQueueTicket> = Vec::new();
        for step in 0..5_000 {
            match rng.u8(0..3) {
                0 | 1 => {
                    let ticket = FairQueueTicket::new(rng.u32(1..6), rng.u32(0..3000));
                    fq.queue(rng.usize(0..3), ticket, (0, step)).unwrap();
                }
                _ if !inflight.is_empty() => {
                    let t = inflight.swap_remove(rng.usize(0..inflight.len()));
                    fq.notify_request_finished(t);
                }
                _ => {}
            }

            fq.dispatch_requests(|t, _| inflight.push(t));

            let sum = inflight.iter().fold(FairQueueTicket::default(), |a, t| a + *t);
            assert!(sum.fits(&group.capacity()), "{sum:?} at step {step}");
            assert_eq!(sum, group.outstanding());
        }
    }

    #[test]
    fn test_head_of_line_blocks_class() {
        let mut fq = queue_with_capacity(4);
        fq.register_priority_class(0, 1);

        fq.queue(0, FairQueueTicket::new(3, 0), (0, 0)).unwrap();
        fq.queue(0, FairQueueTicket::new(3, 0), (0, 1)).unwrap();
        fq.queue(0, FairQueueTicket::new(1, 0), (0, 2)).unwrap();

        let mut got = Vec::new();
        fq.dispatch_requests(|_, e| got.push(e));
        // The small request queued last does not overtake the blocked head.
        assert_eq!(got, vec![(0, 0)]);
        assert_eq!(fq.waiters(), 2);
    }

    #[test]
    fn test_oversized_ticket_is_clamped() {
        let mut fq = queue_with_capacity(2);
        fq.register_priority_class(0, 1);
        fq.queue(0, FairQueueTicket::new(100, 0), (0, 0)).unwrap();

        let mut tickets = Vec::new();
        fq.dispatch_requests(|t, _| tickets.push(t));
        assert_eq!(tickets, vec![FairQueueTicket::new(2, 0)]);
    }

    #[test]
    fn test_no_classes_no_dispatch() {
        let mut fq = queue_with_capacity(2);
        assert_eq!(fq.dispatch_requests(|_, _| unreachable!()), 0);
        assert_eq!(fq.queue(0, unit(), (0, 0)), Err(Error::NoSuchPriorityClass));
    }

    #[test]
    fn test_idle_class_does_not_bank_credit() {
        let mut fq = queue_with_capacity(1);
        fq.register_priority_class(0, 1);
        fq.register_priority_class(1, 1);

        // Class 0 runs alone for a while.
        for i in 0..50 {
            fq.queue(0, unit(), (0, i)).unwrap();
        }
        drain_in_order(&mut fq);

        // Class 1 wakes up, it must not monopolize the queue.
        for i in 0..10 {
            fq.queue(0, unit(), (0, 100 + i)).unwrap();
            fq.queue(1, unit(), (1, i)).unwrap();
        }
        let order = drain_in_order(&mut fq);
        let first_half = &order[..10];
        assert!(first_half.iter().any(|e| e.0 == 0), "order: {order:?}");
        assert!(first_half.iter().any(|e| e.0 == 1), "order: {order:?}");
    }

    #[test]
    fn test_cancel_removes_entry() {
        let mut fq = queue_with_capacity(1);
        fq.register_priority_class(0, 1);

        let a = fq.queue(0, unit(), (0, 0)).unwrap();
        let _b = fq.queue(0, unit(), (0, 1)).unwrap();

        assert_eq!(fq.notify_request_cancelled(a), Some((0, 0)));
        assert_eq!(fq.notify_request_cancelled(a), None);
        assert_eq!(fq.waiters(), 1);
        assert_eq!(drain_in_order(&mut fq), vec![(0, 1)]);
        assert_eq!(fq.resources_currently_waiting(), FairQueueTicket::default());
    }

    #[test]
    fn test_allocation_failure_leaves_queue_intact() {
        let mut fq = queue_with_capacity(4);
        fq.register_priority_class(0, 1);

        let mut n = 0;
        loop {
            with_failure_injector(|inj| inj.fail_after(n));
            let mut ok = 0;
            for i in 0..4 {
                if fq.queue(0, unit(), (0, i)).is_ok() {
                    ok += 1;
                }
            }
            let failed = with_failure_injector(|inj| {
                inj.cancel();
                inj.failed()
            });

            assert_eq!(fq.waiters(), ok);
            assert_eq!(drain_in_order(&mut fq).len(), ok);
            assert_eq!(fq.waiters(), 0);
            assert_eq!(fq.group().outstanding(), FairQueueTicket::default());

            if !failed {
                break;
            }
            n += 1;
        }
        assert_eq!(n, 4);
    }
}
