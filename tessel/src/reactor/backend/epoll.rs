use crate::context::{self, CoreHandle};
use crate::error::{Error, Result};
use crate::future::Deferred;
use crate::io::{IoCompletion, IoDone, IoRequest, IoSink};
use crate::reactor::backend::{drain_timer, ReactorBackend};
use crate::reactor::pollable::{PollableFdState, EV_IN, EV_OUT};
use crate::utils::sys::TimerFd;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Instant;

const WAKE_TOKEN: u64 = u64::MAX;
const TIMER_TOKEN: u64 = u64::MAX - 1;
const SIGNAL_TOKEN: u64 = u64::MAX - 2;

const MAX_EVENTS: usize = 128;

/// Readiness based backend: level triggered epoll for descriptors, a timerfd
/// for the highres timer and the blocking syscall pool for disk requests.
///
/// Interest is only installed while a task waits. Once an event fires, the
/// fd leaves the interest set unless another direction is still requested,
/// so idle descriptors never keep the loop spinning.
pub(crate) struct EpollBackend {
    epoll: OwnedFd,
    timer: TimerFd,
    fds: RefCell<HashMap<RawFd, Weak<PollableFdState>>>,
    events: RefCell<Vec<libc::epoll_event>>,
}

impl EpollBackend {
    pub(crate) fn try_new(core: &CoreHandle) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let backend = Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            timer: TimerFd::new()?,
            fds: RefCell::new(HashMap::new()),
            events: RefCell::new(vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS]),
        };

        backend.ctl(libc::EPOLL_CTL_ADD, core.wake_fd(), EV_IN, WAKE_TOKEN)?;
        backend.ctl(libc::EPOLL_CTL_ADD, backend.timer.as_raw_fd(), EV_IN, TIMER_TOKEN)?;
        Ok(backend)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Makes the installed interest of `state` match what tasks request.
    fn sync_interest(&self, state: &Rc<PollableFdState>) -> io::Result<()> {
        let fd = state.raw_fd();
        let wanted = state.requested.get();

        if wanted == state.installed.get() && state.registered.get() == (wanted != 0) {
            return Ok(());
        }

        match (state.registered.get(), wanted) {
            (false, 0) => {}
            (false, _) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, wanted, fd as u64)?;
                state.registered.set(true);
                self.fds.borrow_mut().insert(fd, Rc::downgrade(state));
            }
            (true, 0) => {
                self.ctl(libc::EPOLL_CTL_DEL, fd, 0, fd as u64)?;
                state.registered.set(false);
            }
            (true, _) => self.ctl(libc::EPOLL_CTL_MOD, fd, wanted, fd as u64)?,
        }

        state.installed.set(wanted);
        Ok(())
    }

    fn wait_for(&self, state: &Rc<PollableFdState>, event: u32) -> Deferred<()> {
        let (deferred, install) = state.wait_for(event);
        if install {
            if let Err(e) = self.sync_interest(state) {
                // Surface the failure through the next syscall on the fd.
                tracing::warn!(fd = state.raw_fd(), error = %e, "epoll_ctl failed");
                state.complete(libc::EPOLLERR as u32);
            }
        }
        deferred
    }

    /// One `epoll_wait` call. Returns the number of descriptor events.
    fn process(&self, timeout_ms: libc::c_int) -> io::Result<usize> {
        let ready: SmallVec<[(Rc<PollableFdState>, u32); 16]> = {
            let mut events = self.events.borrow_mut();
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::Interrupted => Ok(0),
                    _ => Err(err),
                };
            }

            let fds = self.fds.borrow();
            events[..n as usize]
                .iter()
                .filter_map(|ev| match ev.u64 {
                    WAKE_TOKEN | SIGNAL_TOKEN => None,
                    TIMER_TOKEN => {
                        drain_timer(&self.timer);
                        None
                    }
                    token => fds
                        .get(&(token as RawFd))
                        .and_then(Weak::upgrade)
                        .map(|state| (state, ev.events)),
                })
                .collect()
        };

        // Promise completion wakes tasks, no borrow may be held.
        for (state, events) in &ready {
            state.complete(*events);
            if let Err(e) = self.sync_interest(state) {
                tracing::warn!(fd = state.raw_fd(), error = %e, "epoll_ctl failed");
            }
        }
        Ok(ready.len())
    }

    fn submit_disk(&self, req: IoRequest, completion: Box<dyn IoCompletion>) {
        context::with_reactor(|r| {
            let core = std::sync::Arc::clone(&r.core);
            let id = r.register_callback(move |res: Result<io::Result<IoDone>>| {
                completion.complete_with(res.and_then(|io| io.map_err(Error::from)));
            });
            r.shared.syscalls.submit(core, id, move || req.perform());
        });
    }
}

impl ReactorBackend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn reap_kernel_completions(&self) -> bool {
        match self.process(0) {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::warn!(error = %e, "epoll_wait failed");
                false
            }
        }
    }

    fn kernel_submit_work(&self, sink: &IoSink) -> bool {
        sink.drain(|req, completion| self.submit_disk(req, completion)) > 0
    }

    fn wait_and_process_events(&self) -> io::Result<()> {
        self.process(-1).map(drop)
    }

    fn arm_highres_timer(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.timer.arm(deadline)
    }

    fn start_handling_signals(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, EV_IN, SIGNAL_TOKEN)
    }

    fn readable(&self, fd: &Rc<PollableFdState>) -> Deferred<()> {
        self.wait_for(fd, EV_IN)
    }

    fn writeable(&self, fd: &Rc<PollableFdState>) -> Deferred<()> {
        self.wait_for(fd, EV_OUT)
    }

    fn forget(&self, fd: &PollableFdState) {
        let raw = fd.raw_fd();
        if fd.registered.replace(false) {
            if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, raw, 0, raw as u64) {
                tracing::warn!(fd = raw, error = %e, "epoll_ctl failed to remove fd");
            }
        }
        self.fds.borrow_mut().remove(&raw);
        fd.installed.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{capture_logs, poll_once};
    use anyhow::Result;
    use std::sync::Arc;

    fn pipe() -> Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }

    #[test]
    fn test_interest_follows_waiters() -> Result<()> {
        let core = Arc::new(CoreHandle::try_new(0, 4)?);
        let backend = EpollBackend::try_new(&core)?;
        let (r, w) = pipe()?;
        let state = Rc::new(PollableFdState::new(r));

        let mut d = backend.readable(&state);
        assert!(state.registered.get());
        assert_eq!(state.installed.get(), EV_IN);
        assert_eq!(backend.process(0)?, 0);
        assert!(poll_once(&mut d).is_pending());

        let ret = unsafe { libc::write(w.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(ret, 1);

        assert_eq!(backend.process(0)?, 1);
        assert!(poll_once(&mut d).is_ready());
        // Nobody else waits, the fd left the interest set.
        assert!(!state.registered.get());

        backend.forget(&state);
        assert!(backend.fds.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_forget_logs_failed_removal() -> Result<()> {
        let core = Arc::new(CoreHandle::try_new(0, 4)?);
        let backend = EpollBackend::try_new(&core)?;
        let (r, _w) = pipe()?;
        let state = Rc::new(PollableFdState::new(r));

        // Claims an installation the kernel never saw.
        state.registered.set(true);
        state.installed.set(EV_IN);

        let ((), logs) = capture_logs(|| backend.forget(&state));
        assert!(logs.contains("epoll_ctl failed to remove fd"), "{logs}");
        assert!(!state.registered.get());
        assert_eq!(state.installed.get(), 0);
        Ok(())
    }

    #[test]
    fn test_draining_an_idle_timer_is_quiet() -> Result<()> {
        let core = Arc::new(CoreHandle::try_new(0, 4)?);
        let backend = EpollBackend::try_new(&core)?;

        let ((), logs) = capture_logs(|| drain_timer(&backend.timer));
        assert!(!logs.contains("failed to drain"), "{logs}");
        Ok(())
    }

    #[test]
    fn test_wake_fd_interrupts_wait() -> Result<()> {
        let core = Arc::new(CoreHandle::try_new(0, 4)?);
        let backend = EpollBackend::try_new(&core)?;
        core.take_root_woken();

        assert!(core.enter_sleep());
        let waker = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                core.wakeup();
            })
        };

        backend.wait_and_process_events()?;
        core.exit_sleep();
        waker
            .join()
            .map_err(|_| anyhow::anyhow!("waker thread panicked"))?;
        assert_eq!(core.wakeups(), 1);
        Ok(())
    }

    #[test]
    fn test_timer_interrupts_wait() -> Result<()> {
        let core = Arc::new(CoreHandle::try_new(0, 4)?);
        let backend = EpollBackend::try_new(&core)?;

        let start = Instant::now();
        backend.arm_highres_timer(Some(start + std::time::Duration::from_millis(10)))?;
        backend.wait_and_process_events()?;
        assert!(start.elapsed() >= std::time::Duration::from_millis(10));
        Ok(())
    }
}
