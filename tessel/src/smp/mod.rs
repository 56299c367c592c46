//! Cross-core messaging.
//!
//! Every ordered pair of cores shares a pair of bounded rings. Work submitted
//! with [`submit_to`] travels to the target core as a request item, runs there
//! as a task of the caller's scheduling group, and its result comes back as a
//! completion item that resolves the caller's [`Deferred`].
//!
//! Items that find their ring full wait in a per-peer backlog owned by the
//! sending reactor, behind which later items queue up, so order between any
//! two cores is submission order. Nothing orders items from different sources.
use crate::context;
use crate::error::Result;
use crate::future::{failed, guarded, promise, Deferred};
use crate::memory;
use crate::reactor::Reactor;
use crate::utils::prefetch::prefetch_read;
use smallvec::SmallVec;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;

mod alien;
pub use alien::AlienHandle;

mod queue;
pub(crate) use queue::{SmpItem, SmpQueues};

/// Items for one peer that did not fit its ring yet.
#[derive(Default)]
pub(crate) struct SmpBacklog {
    requests: VecDeque<SmpItem>,
    completions: VecDeque<SmpItem>,
}

impl SmpBacklog {
    fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.completions.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Request,
    Completion,
}

/// Queues `item` for `peer`, behind anything already waiting in the backlog.
fn send(r: &Reactor, peer: usize, dir: Direction, item: SmpItem) {
    let me = r.id();
    let ring = match dir {
        Direction::Request => &r.shared.smp.pair(me, peer).requests,
        Direction::Completion => &r.shared.smp.pair(peer, me).completions,
    };

    {
        let mut out = r.smp_out.borrow_mut();
        let Some(backlog) = out.get_mut(peer) else {
            tracing::warn!(core = me, peer, "item for a core that is gone");
            return;
        };
        let backlog = match dir {
            Direction::Request => &mut backlog.requests,
            Direction::Completion => &mut backlog.completions,
        };

        if !backlog.is_empty() {
            backlog.push_back(item);
        } else if let Err(item) = ring.push(item) {
            tracing::trace!(core = me, peer, "smp ring full, item backlogged");
            backlog.push_back(item);
        }
    }

    if let Ok(target) = r.shared.core(peer) {
        target.wakeup();
    }
}

fn flush_backlogs(r: &Reactor) -> bool {
    let me = r.id();
    let mut moved = false;
    let mut out = r.smp_out.borrow_mut();

    for (peer, backlog) in out.iter_mut().enumerate() {
        if backlog.is_empty() {
            continue;
        }
        let pair_out = r.shared.smp.pair(me, peer);
        let pair_in = r.shared.smp.pair(peer, me);

        let mut pushed = false;
        for (queue, ring) in [
            (&mut backlog.requests, &pair_out.requests),
            (&mut backlog.completions, &pair_in.completions),
        ] {
            while let Some(item) = queue.pop_front() {
                if let Err(item) = ring.push(item) {
                    queue.push_front(item);
                    break;
                }
                pushed = true;
            }
        }

        if pushed {
            moved = true;
            if let Ok(target) = r.shared.core(peer) {
                target.wakeup();
            }
        }
    }
    moved
}

/// True while something waits in a backlog of this core.
pub(crate) fn has_backlog(r: &Reactor) -> bool {
    r.smp_out.borrow().iter().any(|b| !b.is_empty())
}

/// Moves backlogged items into their rings, then runs at most one batch from
/// every incoming ring. Items run with no reactor borrow held.
pub(crate) fn poll_queues(r: &Reactor) -> bool {
    let mut busy = flush_backlogs(r);
    let me = r.id();
    let batch_size = r.shared.cfg.smp_batch_size;

    for peer in (0..r.shared.num_cores()).filter(|&peer| peer != me) {
        for ring in [
            &r.shared.smp.pair(peer, me).requests,
            &r.shared.smp.pair(me, peer).completions,
        ] {
            let mut batch: SmallVec<[SmpItem; 16]> = SmallVec::new();
            while batch.len() < batch_size {
                match ring.pop() {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }
            busy |= !batch.is_empty();
            process(me, batch);
        }
    }
    busy
}

fn process(core: usize, batch: SmallVec<[SmpItem; 16]>) {
    let mut items = batch.into_iter().peekable();
    while let Some(item) = items.next() {
        if let Some(next) = items.peek() {
            prefetch_read(&**next);
        }
        if let Err(e) = guarded(item) {
            tracing::error!(core, error = %e, "smp item panicked");
        }
    }
}

type Reply = Result<Box<dyn Any + Send>>;

/// Runs `f` on `core` and resolves with the output of the future it returns.
///
/// `f` runs on the target core and its future becomes a task there, in the
/// scheduling group of the caller. Submitting to the current core spawns the
/// task locally.
///
/// # Panics
///
/// Panics when called outside of a reactor thread.
#[track_caller]
pub fn submit_to<F, Fut, T>(core: usize, f: F) -> Deferred<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + 'static,
    T: Send + 'static,
{
    context::with_reactor(|r| {
        if let Err(e) = r.shared.core(core) {
            return failed(e);
        }
        if let Err(e) = memory::on_alloc_point() {
            return failed(e);
        }

        let group = context::current_scheduling_group();
        if core == r.id() {
            let (p, d) = promise();
            match guarded(f) {
                Ok(fut) => {
                    let handle = r.spawn_local(group, fut);
                    r.spawn_local(group, async move { p.set_result(handle.await) });
                }
                Err(e) => p.set_error(e),
            }
            return d;
        }

        let (p, d) = promise::<T>();
        let id = r.register_remote(p);
        let origin = r.id();

        let request: SmpItem = Box::new(move || {
            let reply = move |res: Reply| -> SmpItem {
                Box::new(move || context::with_reactor(|o| o.resolve_remote(id, res)))
            };

            context::with_reactor(|target| match guarded(f) {
                Ok(fut) => {
                    let handle = target.spawn_local(group, fut);
                    target.spawn_local(group, async move {
                        let res = handle.await.map(|v| Box::new(v) as Box<dyn Any + Send>);
                        context::with_reactor(|t| send(t, origin, Direction::Completion, reply(res)));
                    });
                }
                Err(e) => send(target, origin, Direction::Completion, reply(Err(e))),
            });
        });

        send(r, core, Direction::Request, request);
        d
    })
}

/// Runs `f` on every core. Results are ordered by core id; the first failure
/// is returned after every core has finished.
pub async fn invoke_on_all<F, Fut, T>(f: F) -> Result<Vec<T>>
where
    F: Fn() -> Fut + Send + Clone + 'static,
    Fut: Future<Output = T> + 'static,
    T: Send + 'static,
{
    let cores: Vec<usize> = (0..count()).collect();
    invoke_on(cores, f).await
}

/// Like [`invoke_on_all`], skipping the current core.
pub async fn invoke_on_others<F, Fut, T>(f: F) -> Result<Vec<T>>
where
    F: Fn() -> Fut + Send + Clone + 'static,
    Fut: Future<Output = T> + 'static,
    T: Send + 'static,
{
    let me = this_core();
    let cores: Vec<usize> = (0..count()).filter(|&c| c != me).collect();
    invoke_on(cores, f).await
}

async fn invoke_on<F, Fut, T>(cores: Vec<usize>, f: F) -> Result<Vec<T>>
where
    F: Fn() -> Fut + Send + Clone + 'static,
    Fut: Future<Output = T> + 'static,
    T: Send + 'static,
{
    let pending: Vec<_> = cores.into_iter().map(|c| submit_to(c, f.clone())).collect();
    futures::future::join_all(pending)
        .await
        .into_iter()
        .collect()
}

/// Number of cores of the running runtime.
#[track_caller]
pub fn count() -> usize {
    context::with_shared(|s| s.num_cores())
}

/// Id of the core running the caller.
#[track_caller]
pub fn this_core() -> usize {
    context::with_reactor(|r| r.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use crate::error::Error;
    use crate::runtime::Builder;
    use crate::sched::{create_scheduling_group, current_scheduling_group, destroy_scheduling_group};
    use crate::{sleep, spawn_in};
    use anyhow::Result;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tessel::test(cores = 2)]
    async fn test_submit_to_runs_on_target() -> Result<()> {
        assert_eq!(submit_to(1, || async { this_core() }).await?, 1);
        assert_eq!(submit_to(0, || async { this_core() }).await?, 0);
        Ok(())
    }

    #[tessel::test(cores = 2)]
    async fn test_unknown_core_fails() -> Result<()> {
        assert_eq!(
            submit_to(7, || async {}).await,
            Err(Error::NoSuchCore { core: 7, cores: 2 })
        );
        Ok(())
    }

    #[tessel::test(cores = 3)]
    async fn test_invoke_on_all_orders_by_core() -> Result<()> {
        assert_eq!(invoke_on_all(|| async { this_core() * 10 }).await?, vec![0, 10, 20]);
        assert_eq!(invoke_on_others(|| async { this_core() }).await?, vec![1, 2]);
        Ok(())
    }

    #[tessel::test(cores = 2)]
    async fn test_remote_panic_resolves_with_panicked() -> Result<()> {
        let res = submit_to(1, || async { panic!("boom") }).await;
        assert!(matches!(res, Err(Error::Panicked(_))), "{res:?}");

        let res = submit_to(1, || -> std::future::Ready<()> { panic!("before the future") }).await;
        assert!(matches!(res, Err(Error::Panicked(_))), "{res:?}");
        Ok(())
    }

    #[tessel::test(cores = 2)]
    async fn test_remote_task_inherits_group() -> Result<()> {
        let g = create_scheduling_group("smp-remote", 200)?;
        let seen = spawn_in(g, async {
            submit_to(1, || async { current_scheduling_group() }).await
        })
        .await??;
        assert_eq!(seen, g);
        destroy_scheduling_group(g)?;
        Ok(())
    }

    #[test]
    fn test_full_rings_keep_submission_order() -> Result<()> {
        let rt = Builder::new()
            .cores(2)
            .smp_queue_capacity(2)
            .try_build()?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let order = Arc::clone(&seen);
        rt.block_on(async move {
            let pending: Vec<_> = (0..200)
                .map(|i| {
                    let seen = Arc::clone(&order);
                    submit_to(1, move || async move { seen.lock().push(i) })
                })
                .collect();
            futures::future::join_all(pending)
                .await
                .into_iter()
                .collect::<crate::Result<Vec<()>>>()
        })?;

        assert_eq!(*seen.lock(), (0..200).collect::<Vec<_>>());
        Ok(())
    }

    #[tessel::test(cores = 2)]
    async fn test_sleeping_core_is_woken() -> Result<()> {
        // Give core 1 time to go to sleep.
        sleep(Duration::from_millis(20)).await;
        let before = context::with_shared(|s| s.cores[1].wakeups());
        submit_to(1, || async {}).await?;
        let after = context::with_shared(|s| s.cores[1].wakeups());
        assert!(after > before);
        Ok(())
    }
}
