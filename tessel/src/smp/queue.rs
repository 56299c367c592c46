use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use std::fmt;

/// A type erased piece of work executed on another core.
pub(crate) type SmpItem = Box<dyn FnOnce() + Send + 'static>;

/// The rings between one ordered pair of cores.
///
/// `requests` carries work from the source core to the destination core,
/// `completions` carries replies the other way. Each ring has exactly one
/// producer thread and one consumer thread, which keeps every ring FIFO.
pub(crate) struct SmpMessageQueue {
    pub(crate) requests: ArrayQueue<SmpItem>,
    pub(crate) completions: ArrayQueue<SmpItem>,
}

impl SmpMessageQueue {
    fn new(capacity: usize) -> Self {
        Self {
            requests: ArrayQueue::new(capacity),
            completions: ArrayQueue::new(capacity),
        }
    }
}

/// Every [`SmpMessageQueue`] of the runtime, indexed by `(from, to)`.
pub(crate) struct SmpQueues {
    cores: usize,
    pairs: Vec<CachePadded<SmpMessageQueue>>,
}

impl SmpQueues {
    pub(crate) fn new(cores: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            cores,
            pairs: (0..cores * cores)
                .map(|_| CachePadded::new(SmpMessageQueue::new(capacity)))
                .collect(),
        }
    }

    pub(crate) fn pair(&self, from: usize, to: usize) -> &SmpMessageQueue {
        &self.pairs[from * self.cores + to]
    }

    /// True if some ring holds work `core` has to process.
    pub(crate) fn has_pending_for(&self, core: usize) -> bool {
        if core >= self.cores {
            return false;
        }
        (0..self.cores).any(|peer| {
            !self.pair(peer, core).requests.is_empty()
                || !self.pair(core, peer).completions.is_empty()
        })
    }
}

impl fmt::Debug for SmpQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmpQueues")
            .field("cores", &self.cores)
            .field(
                "queued",
                &self
                    .pairs
                    .iter()
                    .map(|p| p.requests.len() + p.completions.len())
                    .sum::<usize>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(SmpQueues: Send, Sync);

    #[test]
    fn test_pending_tracks_direction() {
        let queues = SmpQueues::new(3, 2);
        assert!(!queues.has_pending_for(1));

        // A request from 0 to 2 is work for core 2 only.
        let _ = queues.pair(0, 2).requests.push(Box::new(|| {}));
        assert!(queues.has_pending_for(2));
        assert!(!queues.has_pending_for(0));

        // Its completion travels back to core 0.
        let _ = queues.pair(0, 2).requests.pop();
        let _ = queues.pair(0, 2).completions.push(Box::new(|| {}));
        assert!(queues.has_pending_for(0));
        assert!(!queues.has_pending_for(2));
    }

    #[test]
    fn test_rings_are_bounded() {
        let queues = SmpQueues::new(2, 2);
        let ring = &queues.pair(1, 0).requests;
        assert!(ring.push(Box::new(|| {})).is_ok());
        assert!(ring.push(Box::new(|| {})).is_ok());
        assert!(ring.push(Box::new(|| {})).is_err());
    }
}
