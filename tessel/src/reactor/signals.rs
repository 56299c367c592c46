//! Signal delivery through a signalfd owned by core 0.
//!
//! Handled signals are blocked on every reactor thread, so the kernel queues
//! them for the signalfd instead of interrupting whatever thread happens to
//! run. Handlers run as ordinary reactor work on core 0.
use crate::context;
use crate::error::{Error, Result};
use crate::future::guarded;
use crate::reactor::{fatal, Reactor};
use crate::smp;
use crate::utils::sys::{block_signals, read_signal, restore_signal_mask, signal_fd, update_signal_fd};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

type Handler = Box<dyn FnMut()>;

/// Per-core signal state. Only core 0 ever holds a signalfd and handlers.
#[derive(Default)]
pub(crate) struct Signals {
    fd: Option<OwnedFd>,
    // A handler is taken out of its slot while it runs.
    handlers: HashMap<i32, Option<Handler>>,
    old_mask: Option<libc::sigset_t>,
}

impl Signals {
    pub(crate) fn has_fd(&self) -> bool {
        self.fd.is_some()
    }

    /// Blocks `signo` for this thread, remembering the mask to restore.
    pub(crate) fn block(&mut self, signo: i32) -> io::Result<()> {
        let old = block_signals(&[signo])?;
        self.old_mask.get_or_insert(old);
        Ok(())
    }

    /// Returns the new signalfd when this is the first handled signal.
    fn install(&mut self, signo: i32, handler: Handler) -> io::Result<Option<RawFd>> {
        self.block(signo)?;
        self.handlers.insert(signo, Some(handler));

        let signals: Vec<i32> = self.handlers.keys().copied().collect();
        match &self.fd {
            Some(fd) => {
                update_signal_fd(fd.as_raw_fd(), &signals)?;
                Ok(None)
            }
            None => {
                let fd = signal_fd(&signals)?;
                let raw = fd.as_raw_fd();
                self.fd = Some(fd);
                Ok(Some(raw))
            }
        }
    }

    fn next_pending(&self) -> Option<i32> {
        let fd = self.fd.as_ref()?;
        match read_signal(fd.as_raw_fd()) {
            Ok(signo) => signo,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read signalfd");
                None
            }
        }
    }

    /// Puts back the thread's signal mask from before the first `block`.
    pub(crate) fn restore(&mut self) {
        self.handlers.clear();
        self.fd = None;
        if let Some(old) = self.old_mask.take() {
            if let Err(e) = restore_signal_mask(&old) {
                tracing::warn!(error = %e, "failed to restore signal mask");
            }
        }
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handled: Vec<_> = self.handlers.keys().collect();
        handled.sort();
        f.debug_struct("Signals")
            .field("fd", &self.fd.as_ref().map(AsRawFd::as_raw_fd))
            .field("handled", &handled)
            .finish()
    }
}

fn install_on(r: &Reactor, signo: i32, handler: Handler) -> io::Result<()> {
    let fresh = r.signals.borrow_mut().install(signo, handler)?;
    if let Some(fd) = fresh {
        r.backend.start_handling_signals(fd)?;
    }
    tracing::debug!(signo, "signal handler installed");
    Ok(())
}

/// Runs `handler` on core 0 every time `signo` is delivered to the process.
/// Replaces any handler previously installed for `signo`.
///
/// A signal directed at a thread outside the runtime that has not blocked
/// `signo` still takes that thread's default action.
pub async fn handle_signal<F>(signo: i32, handler: F) -> Result<()>
where
    F: FnMut() + Send + 'static,
{
    if matches!(signo, libc::SIGKILL | libc::SIGSTOP) || !(1..=libc::SIGRTMAX()).contains(&signo) {
        return Err(Error::SignalNotHandled(signo));
    }

    smp::invoke_on_others(move || async move {
        context::with_reactor(|r| {
            if let Err(e) = r.signals.borrow_mut().block(signo) {
                fatal("failed to block signal", e);
            }
        })
    })
    .await?;

    smp::submit_to(0, move || async move {
        context::with_reactor(|r| install_on(r, signo, Box::new(handler)))
    })
    .await?
    .map_err(Error::from)
}

/// Runs the handlers of every signal the signalfd has queued. Returns how
/// many signals were read.
pub(crate) fn dispatch_pending(r: &Reactor) -> usize {
    let mut n = 0;
    loop {
        let Some(signo) = r.signals.borrow().next_pending() else {
            return n;
        };
        n += 1;

        let handler = r
            .signals
            .borrow_mut()
            .handlers
            .get_mut(&signo)
            .and_then(Option::take);
        let Some(mut handler) = handler else {
            tracing::debug!(signo, "signal without a handler");
            continue;
        };

        // The handler may install other handlers, so no borrow is held.
        if let Err(e) = guarded(|| handler()) {
            tracing::error!(signo, error = %e, "signal handler panicked");
        }

        // Unless it was replaced meanwhile.
        let mut signals = r.signals.borrow_mut();
        if let Some(slot) = signals.handlers.get_mut(&signo) {
            slot.get_or_insert(handler);
        }
    }
}

/// SIGINT and SIGTERM stop the runtime. Called while core 0 starts.
pub(crate) fn install_default_handlers(r: &Rc<Reactor>) -> io::Result<()> {
    for signo in [libc::SIGINT, libc::SIGTERM] {
        let shared = Arc::clone(&r.shared);
        install_on(
            r,
            signo,
            Box::new(move || {
                tracing::info!(signo, "signal received, stopping runtime");
                shared.request_stop();
            }),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use crate::sleep;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn raise_here(signo: i32) {
        unsafe { libc::pthread_kill(libc::pthread_self(), signo) };
    }

    fn is_blocked(signo: i32) -> bool {
        let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), set.as_mut_ptr());
            libc::sigismember(set.as_ptr(), signo) == 1
        }
    }

    async fn wait_for(count: &AtomicUsize, n: usize) {
        let start = Instant::now();
        while count.load(Ordering::Acquire) < n && start.elapsed() < Duration::from_secs(2) {
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tessel::test]
    async fn test_handler_runs_on_delivery() -> Result<()> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        handle_signal(libc::SIGUSR1, move || {
            h.fetch_add(1, Ordering::AcqRel);
        })
        .await?;
        assert!(is_blocked(libc::SIGUSR1));

        raise_here(libc::SIGUSR1);
        wait_for(&hits, 1).await;
        assert_eq!(hits.load(Ordering::Acquire), 1);

        raise_here(libc::SIGUSR1);
        wait_for(&hits, 2).await;
        assert_eq!(hits.load(Ordering::Acquire), 2);
        Ok(())
    }

    #[tessel::test(cores = 2)]
    async fn test_signal_is_blocked_on_every_core() -> Result<()> {
        handle_signal(libc::SIGUSR2, || {}).await?;
        let blocked = smp::submit_to(1, || async { is_blocked(libc::SIGUSR2) }).await?;
        assert!(blocked);
        Ok(())
    }

    #[tessel::test]
    async fn test_unblockable_signals_are_rejected() -> Result<()> {
        assert_eq!(
            handle_signal(libc::SIGKILL, || {}).await,
            Err(Error::SignalNotHandled(libc::SIGKILL))
        );
        assert_eq!(
            handle_signal(0, || {}).await,
            Err(Error::SignalNotHandled(0))
        );
        Ok(())
    }

    #[test]
    fn test_restore_unblocks() -> Result<()> {
        std::thread::spawn(|| -> Result<()> {
            let mut signals = Signals::default();
            assert!(!is_blocked(libc::SIGWINCH));
            signals.block(libc::SIGWINCH)?;
            assert!(is_blocked(libc::SIGWINCH));
            signals.restore();
            assert!(!is_blocked(libc::SIGWINCH));
            Ok(())
        })
        .join()
        .map_err(|_| anyhow::anyhow!("signal thread panicked"))?
    }
}
