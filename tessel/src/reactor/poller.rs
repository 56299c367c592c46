use crate::context;
use crate::future::guarded;
use crate::reactor::{signals, timer, LowresClock, Reactor};
use crate::smp;
use std::rc::{Rc, Weak};
use std::time::Instant;

/// A source of work the reactor checks once per loop iteration.
///
/// `poll` must not block. When the reactor is about to sleep it asks every
/// poller to enter interrupt mode: a poller that can't guarantee a kernel
/// wakeup for its next piece of work returns false and the reactor keeps
/// polling instead.
pub trait Poller {
    /// Processes what is ready. Returns true if any work was done.
    fn poll(&mut self) -> bool;

    fn try_enter_interrupt_mode(&mut self) -> bool {
        true
    }

    fn exit_interrupt_mode(&mut self) {}

    fn name(&self) -> &'static str;
}

/// Adds a poller to the reactor of the current core. It runs until the
/// runtime shuts down.
///
/// # Panics
///
/// Panics when called outside of a reactor thread.
#[track_caller]
pub fn register_poller(poller: impl Poller + 'static) {
    context::with_reactor(|r| r.add_poller(Box::new(poller)));
}

pub(crate) fn install_builtin_pollers(reactor: &Rc<Reactor>) {
    let weak = Rc::downgrade(reactor);
    let batch = reactor.shared.cfg.smp_batch_size;

    reactor.add_poller(Box::new(SmpPoller(weak.clone())));
    reactor.add_poller(Box::new(AlienPoller {
        reactor: weak.clone(),
        batch,
    }));
    reactor.add_poller(Box::new(IoQueuePoller(weak.clone())));
    reactor.add_poller(Box::new(BackendPoller(weak.clone())));
    reactor.add_poller(Box::new(TimerPoller(weak.clone())));

    if reactor.id() == 0 {
        reactor.add_poller(Box::new(SignalPoller(weak.clone())));
        reactor.add_poller(Box::new(LowresPoller {
            granularity: reactor.shared.cfg.lowres_clock_granularity,
        }));
    }
}

fn with<R>(reactor: &Weak<Reactor>, default: R, f: impl FnOnce(&Reactor) -> R) -> R {
    match reactor.upgrade() {
        Some(r) => f(&r),
        None => default,
    }
}

struct SmpPoller(Weak<Reactor>);

impl Poller for SmpPoller {
    fn poll(&mut self) -> bool {
        with(&self.0, false, smp::poll_queues)
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        // Items parked in a backlog need another push attempt.
        with(&self.0, true, |r| !smp::has_backlog(r))
    }

    fn name(&self) -> &'static str {
        "smp"
    }
}

struct AlienPoller {
    reactor: Weak<Reactor>,
    batch: usize,
}

impl Poller for AlienPoller {
    fn poll(&mut self) -> bool {
        let Some(core) = self.reactor.upgrade().map(|r| r.core.clone()) else {
            return false;
        };

        let mut ran = 0;
        while ran < self.batch {
            let Some(item) = core.pop_alien() else {
                break;
            };
            if let Err(e) = guarded(item) {
                tracing::error!(core = core.id(), error = %e, "alien item failed");
            }
            ran += 1;
        }
        ran > 0
    }

    fn name(&self) -> &'static str {
        "alien"
    }
}

struct IoQueuePoller(Weak<Reactor>);

impl Poller for IoQueuePoller {
    fn poll(&mut self) -> bool {
        with(&self.0, false, |r| {
            r.io_queues()
                .iter()
                .fold(false, |busy, q| q.poll_io_queue() > 0 || busy)
        })
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        // Capacity held by other cores frees up without waking this one.
        with(&self.0, true, |r| r.io_queues().iter().all(|q| q.can_sleep()))
    }

    fn name(&self) -> &'static str {
        "io-queues"
    }
}

struct BackendPoller(Weak<Reactor>);

impl Poller for BackendPoller {
    fn poll(&mut self) -> bool {
        with(&self.0, false, |r| {
            let submitted = r.backend.kernel_submit_work(&r.sink);
            let reaped = r.backend.reap_kernel_completions();
            submitted || reaped
        })
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        with(&self.0, true, |r| {
            r.backend.kernel_submit_work(&r.sink);
            r.sink.is_empty()
        })
    }

    fn name(&self) -> &'static str {
        "backend"
    }
}

struct TimerPoller(Weak<Reactor>);

impl Poller for TimerPoller {
    fn poll(&mut self) -> bool {
        let due = with(&self.0, Vec::new(), |r| {
            r.timers.borrow_mut().expire(Instant::now())
        });
        // Fired with no borrow held: wakers and callbacks re-enter the set.
        timer::fire(due) > 0
    }

    fn name(&self) -> &'static str {
        "timers"
    }
}

struct SignalPoller(Weak<Reactor>);

impl Poller for SignalPoller {
    fn poll(&mut self) -> bool {
        with(&self.0, false, |r| signals::dispatch_pending(r) > 0)
    }

    fn name(&self) -> &'static str {
        "signals"
    }
}

struct LowresPoller {
    granularity: std::time::Duration,
}

impl Poller for LowresPoller {
    fn poll(&mut self) -> bool {
        LowresClock::refresh_if_stale(self.granularity);
        false
    }

    fn name(&self) -> &'static str {
        "lowres-clock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use crate::yield_now;
    use anyhow::Result;
    use std::cell::Cell;

    struct Counting(Rc<Cell<u32>>);

    impl Poller for Counting {
        fn poll(&mut self) -> bool {
            self.0.set(self.0.get() + 1);
            false
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tessel::test]
    async fn test_registered_poller_runs_every_iteration() -> Result<()> {
        let polls = Rc::new(Cell::new(0));
        register_poller(Counting(Rc::clone(&polls)));

        for _ in 0..10 {
            yield_now().await;
        }
        assert!(polls.get() >= 5, "polled {} times", polls.get());
        Ok(())
    }

    struct NeverSleeps(Rc<Cell<u32>>);

    impl Poller for NeverSleeps {
        fn poll(&mut self) -> bool {
            false
        }

        fn try_enter_interrupt_mode(&mut self) -> bool {
            self.0.set(self.0.get() + 1);
            false
        }

        fn name(&self) -> &'static str {
            "never-sleeps"
        }
    }

    #[tessel::test]
    async fn test_poller_can_veto_sleep() -> Result<()> {
        let asked = Rc::new(Cell::new(0));
        register_poller(NeverSleeps(Rc::clone(&asked)));

        let sleeps = context::with_reactor(|r| r.stats.sleeps.get());
        crate::sleep(std::time::Duration::from_millis(10)).await;

        assert!(asked.get() > 0);
        assert_eq!(context::with_reactor(|r| r.stats.sleeps.get()), sleeps);
        Ok(())
    }
}
