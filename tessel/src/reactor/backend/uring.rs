use crate::context::CoreHandle;
use crate::error::Error;
use crate::future::{promise, Deferred, Promise};
use crate::io::{IoCompletion, IoDone, IoRequest, IoSink};
use crate::reactor::backend::{drain_timer, IoFuture, ReactorBackend};
use crate::reactor::pollable::{PollableFdState, EV_IN, EV_OUT};
use crate::runtime::RuntimeConfig;
use crate::utils::io_uring::CompletionFlags;
use crate::utils::sys::TimerFd;
use io_uring::{opcode, squeue::Entry, types, EnterFlags, IoUring};
use slab::Slab;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Reads and writes at the file position, for sockets and pipes.
const CURRENT_POSITION: u64 = u64::MAX;

enum Op {
    /// Poll on one of the backend's own descriptors.
    Internal(Internal),
    Ready {
        state: Weak<PollableFdState>,
        events: u32,
    },
    Stream {
        promise: Promise<(usize, Vec<u8>)>,
        buf: Vec<u8>,
        // Keeps the descriptor open until the kernel lets go of it.
        state: Rc<PollableFdState>,
    },
    Disk {
        buf: Vec<u8>,
        _fd: Arc<OwnedFd>,
        completion: Box<dyn IoCompletion>,
    },
    Cancel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Internal {
    Wake,
    Timer,
    Signal,
}

struct Cqe {
    key: usize,
    result: i32,
    flags: CompletionFlags,
}

/// Completion based backend on a per-core io_uring.
///
/// Stream reads and writes and every disk request become SQEs of their own.
/// Readiness waits use one-shot `PollAdd`s, which also watch the backend's
/// internal descriptors: the wake eventfd, the highres timerfd and the
/// signalfd. Those are re-armed lazily right before the reactor blocks.
///
/// Buffers live in the op table until the kernel posts the completion, so a
/// dropped future never leaves the kernel writing into freed memory.
pub(crate) struct UringBackend {
    ring: RefCell<IoUring>,
    ops: RefCell<Slab<Op>>,
    /// Entries that did not fit the submission queue.
    backlog: RefCell<VecDeque<Entry>>,
    timer: TimerFd,
    wake_fd: RawFd,
    signal_fd: Cell<Option<RawFd>>,
    armed: Cell<[bool; 3]>,
}

impl UringBackend {
    pub(crate) fn try_new(cfg: &RuntimeConfig, core: &CoreHandle) -> io::Result<Self> {
        let entries = cfg.uring_entries;
        let ring = IoUring::builder()
            // Every SQE of a batch gets a CQE, even after one fails.
            .setup_submit_all()
            // Completions are only processed when we enter the kernel.
            .setup_coop_taskrun()
            .setup_taskrun_flag()
            .build(entries)
            .or_else(|e| {
                tracing::debug!(error = %e, "io_uring setup flags unsupported, using defaults");
                IoUring::new(entries)
            })?;

        if !ring.params().is_feature_nodrop() {
            tracing::warn!(
                core = core.id(),
                "IORING_FEAT_NODROP missing, completions are lost when the CQ ring overflows"
            );
        }

        Ok(Self {
            ring: RefCell::new(ring),
            ops: RefCell::new(Slab::with_capacity(entries as usize)),
            backlog: RefCell::new(VecDeque::new()),
            timer: TimerFd::new()?,
            wake_fd: core.wake_fd(),
            signal_fd: Cell::new(None),
            armed: Cell::new([false; 3]),
        })
    }

    /// True if this kernel lets us create an io_uring at all.
    pub(crate) fn is_supported() -> bool {
        static SUPPORTED: OnceLock<bool> = OnceLock::new();
        *SUPPORTED.get_or_init(|| IoUring::new(2).is_ok())
    }

    fn push(&self, op: Op, entry: Entry) -> usize {
        let key = self.ops.borrow_mut().insert(op);
        let entry = entry.user_data(key as u64);

        let mut ring = self.ring.borrow_mut();
        let mut backlog = self.backlog.borrow_mut();
        if !backlog.is_empty() {
            backlog.push_back(entry);
            return key;
        }

        // Safety: every buffer and descriptor referenced by `entry` is owned
        // by the op stored under `key` until its completion is processed.
        if unsafe { ring.submission().push(&entry) }.is_err() {
            backlog.push_back(entry);
        }
        key
    }

    fn flush_backlog(&self) {
        let mut ring = self.ring.borrow_mut();
        let mut backlog = self.backlog.borrow_mut();
        let mut sq = ring.submission();

        while let Some(entry) = backlog.front() {
            // Safety: see `push`.
            if unsafe { sq.push(entry) }.is_err() {
                break;
            }
            backlog.pop_front();
        }
    }

    fn submit(&self) -> bool {
        self.flush_backlog();
        let mut ring = self.ring.borrow_mut();
        if ring.submission().is_empty() {
            return false;
        }

        match ring.submit() {
            Ok(n) => n > 0,
            // CQ ring full or out of memory, retried after the next reap.
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBUSY | libc::EAGAIN | libc::EINTR)) => {
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "io_uring submit failed");
                false
            }
        }
    }

    fn internal_fd(&self, which: Internal) -> Option<RawFd> {
        match which {
            Internal::Wake => Some(self.wake_fd),
            Internal::Timer => Some(self.timer.as_raw_fd()),
            Internal::Signal => self.signal_fd.get(),
        }
    }

    fn set_armed(&self, which: Internal, armed: bool) {
        let mut all = self.armed.get();
        all[which as usize] = armed;
        self.armed.set(all);
    }

    fn arm_internal(&self) {
        for which in [Internal::Wake, Internal::Timer, Internal::Signal] {
            if self.armed.get()[which as usize] {
                continue;
            }
            let Some(fd) = self.internal_fd(which) else {
                continue;
            };
            let entry = opcode::PollAdd::new(types::Fd(fd), EV_IN).build();
            self.push(Op::Internal(which), entry);
            self.set_armed(which, true);
        }
    }

    fn wait_for(&self, state: &Rc<PollableFdState>, event: u32) -> Deferred<()> {
        let (deferred, install) = state.wait_for(event);
        if install {
            let entry = opcode::PollAdd::new(types::Fd(state.raw_fd()), event).build();
            let key = self.push(
                Op::Ready {
                    state: Rc::downgrade(state),
                    events: event,
                },
                entry,
            );
            state.installed.set(state.installed.get() | event);
            state.ops.borrow_mut().push(key as u64);
        }
        deferred
    }

    fn stream_op(&self, state: Rc<PollableFdState>, mut buf: Vec<u8>, write: bool) -> Deferred<(usize, Vec<u8>)> {
        let (p, d) = promise();
        let fd = types::Fd(state.raw_fd());
        let len = buf.len().min(u32::MAX as usize) as u32;
        let entry = if write {
            opcode::Write::new(fd, buf.as_ptr(), len)
                .offset(CURRENT_POSITION)
                .build()
        } else {
            opcode::Read::new(fd, buf.as_mut_ptr(), len)
                .offset(CURRENT_POSITION)
                .build()
        };

        let ops = Rc::clone(&state);
        // The Vec's heap allocation does not move with the Vec.
        let key = self.push(
            Op::Stream {
                promise: p,
                buf,
                state,
            },
            entry,
        );
        ops.ops.borrow_mut().push(key as u64);
        d
    }

    fn submit_disk(&self, req: IoRequest, completion: Box<dyn IoCompletion>) {
        let (entry, fd, buf) = match req {
            IoRequest::Read { fd, pos, mut buf } => {
                let len = buf.len().min(u32::MAX as usize) as u32;
                let entry = opcode::Read::new(types::Fd(fd.as_raw_fd()), buf.as_mut_ptr(), len)
                    .offset(pos)
                    .build();
                (entry, fd, buf)
            }
            IoRequest::Write { fd, pos, buf } => {
                let len = buf.len().min(u32::MAX as usize) as u32;
                let entry = opcode::Write::new(types::Fd(fd.as_raw_fd()), buf.as_ptr(), len)
                    .offset(pos)
                    .build();
                (entry, fd, buf)
            }
            IoRequest::Fsync { fd } => {
                let entry = opcode::Fsync::new(types::Fd(fd.as_raw_fd())).build();
                (entry, fd, Vec::new())
            }
        };

        self.push(
            Op::Disk {
                buf,
                _fd: fd,
                completion,
            },
            entry,
        );
    }

    fn reap(&self) -> usize {
        let cqes: SmallVec<[Cqe; 32]> = {
            let mut ring = self.ring.borrow_mut();
            if ring.completion().is_empty() && ring.submission().taskrun() {
                // Deferred task work only runs when we enter with GETEVENTS.
                let res = unsafe {
                    ring.submitter()
                        .enter::<libc::sigset_t>(0, 0, EnterFlags::GETEVENTS.bits(), None)
                };
                if let Err(e) = res {
                    if e.kind() != io::ErrorKind::Interrupted {
                        tracing::warn!(error = %e, "io_uring_enter failed to run task work");
                    }
                }
            }
            ring.completion()
                .map(|cqe| Cqe {
                    key: cqe.user_data() as usize,
                    result: cqe.result(),
                    flags: cqe.flags().into(),
                })
                .collect()
        };

        let n = cqes.len();
        for cqe in cqes {
            // Completion handlers wake tasks, so no borrow is held here.
            self.complete(cqe);
        }
        n
    }

    fn complete(&self, cqe: Cqe) {
        if cqe.flags.contains(CompletionFlags::MORE) {
            tracing::warn!(key = cqe.key, "unexpected multishot completion");
            return;
        }

        let Some(op) = self.ops.borrow_mut().try_remove(cqe.key) else {
            tracing::warn!(key = cqe.key, "completion for an unknown op");
            return;
        };

        match op {
            Op::Internal(which) => {
                self.set_armed(which, false);
                if which == Internal::Timer {
                    drain_timer(&self.timer);
                }
            }
            Op::Ready { state, events } => {
                let Some(state) = state.upgrade() else {
                    return;
                };
                state.ops.borrow_mut().retain(|k| *k != cqe.key as u64);
                state.installed.set(state.installed.get() & !events);
                match cqe.result {
                    r if r >= 0 => state.complete(r as u32),
                    r if r == -libc::ECANCELED => {}
                    _ => state.complete(libc::EPOLLERR as u32),
                }
            }
            Op::Stream {
                promise,
                buf,
                state,
            } => {
                state.ops.borrow_mut().retain(|k| *k != cqe.key as u64);
                match cqe.result {
                    r if r >= 0 => promise.set_value((r as usize, buf)),
                    r => promise.set_error(Error::from_errno(-r)),
                }
            }
            Op::Disk {
                buf, completion, ..
            } => {
                let res = match cqe.result {
                    r if r >= 0 => Ok(IoDone {
                        bytes: r as usize,
                        buf,
                    }),
                    r => Err(Error::from_errno(-r)),
                };
                completion.complete_with(res);
            }
            Op::Cancel => {}
        }
    }
}

impl ReactorBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn reap_kernel_completions(&self) -> bool {
        self.reap() > 0
    }

    fn kernel_submit_work(&self, sink: &IoSink) -> bool {
        let dispatched = sink.drain(|req, completion| self.submit_disk(req, completion));
        self.submit() || dispatched > 0
    }

    fn wait_and_process_events(&self) -> io::Result<()> {
        self.arm_internal();
        self.flush_backlog();

        let res = self.ring.borrow_mut().submit_and_wait(1);
        match res {
            Ok(_) => {}
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINTR | libc::EBUSY)) => {}
            Err(e) => return Err(e),
        }
        self.reap();
        Ok(())
    }

    fn arm_highres_timer(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.timer.arm(deadline)
    }

    fn start_handling_signals(&self, fd: RawFd) -> io::Result<()> {
        self.signal_fd.set(Some(fd));
        Ok(())
    }

    fn readable(&self, fd: &Rc<PollableFdState>) -> Deferred<()> {
        self.wait_for(fd, EV_IN)
    }

    fn writeable(&self, fd: &Rc<PollableFdState>) -> Deferred<()> {
        self.wait_for(fd, EV_OUT)
    }

    fn forget(&self, fd: &PollableFdState) {
        let keys = std::mem::take(&mut *fd.ops.borrow_mut());
        for key in keys {
            self.push(Op::Cancel, opcode::AsyncCancel::new(key).build());
        }
        fd.installed.set(0);
    }

    fn read_some(&self, fd: Rc<PollableFdState>, buf: Vec<u8>) -> IoFuture<(usize, Vec<u8>)> {
        Box::pin(self.stream_op(fd, buf, false))
    }

    fn write_some(&self, fd: Rc<PollableFdState>, buf: Vec<u8>) -> IoFuture<(usize, Vec<u8>)> {
        Box::pin(self.stream_op(fd, buf, true))
    }
}

impl Drop for UringBackend {
    fn drop(&mut self) {
        // Ask the kernel to let go of every buffer still in flight.
        let keys: Vec<u64> = self.ops.borrow().iter().map(|(k, _)| k as u64).collect();
        let mut dropped = 0;
        for key in keys {
            let entry = opcode::AsyncCancel::new(key).build().user_data(u64::MAX);
            if unsafe { self.ring.get_mut().submission().push(&entry) }.is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, "submission queue full, not every op was cancelled");
        }
        if let Err(e) = self.ring.get_mut().submit() {
            tracing::warn!(error = %e, "failed to submit cancellations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::test_utils::{poll_once, RecordingCompletion};
    use anyhow::Result;
    use std::os::fd::FromRawFd;

    fn backend() -> Result<Option<UringBackend>> {
        if !UringBackend::is_supported() {
            return Ok(None);
        }
        let cfg = RuntimeConfig::try_from(Builder::new().cores(1))?;
        let core = CoreHandle::try_new(0, 4)?;
        Ok(Some(UringBackend::try_new(&cfg, &core)?))
    }

    fn pipe() -> Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }

    fn drive(backend: &UringBackend, sink: &IoSink) {
        backend.kernel_submit_work(sink);
        let start = Instant::now();
        while !backend.reap_kernel_completions()
            && start.elapsed() < std::time::Duration::from_secs(1)
        {
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_poll_add_reports_readiness() -> Result<()> {
        let Some(backend) = backend()? else {
            return Ok(());
        };
        let (r, w) = pipe()?;
        let state = Rc::new(PollableFdState::new(r));

        let mut d = backend.readable(&state);
        assert_eq!(state.ops.borrow().len(), 1);
        assert!(poll_once(&mut d).is_pending());

        let ret = unsafe { libc::write(w.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(ret, 1);
        drive(&backend, &IoSink::new());

        assert!(poll_once(&mut d).is_ready());
        assert!(state.ops.borrow().is_empty());
        assert_eq!(state.installed.get(), 0);
        Ok(())
    }

    #[test]
    fn test_disk_requests_complete() -> Result<()> {
        let Some(backend) = backend()? else {
            return Ok(());
        };
        let file = Arc::new(OwnedFd::from(tempfile::tempfile()?));
        let sink = IoSink::new();
        let done = RecordingCompletion::default();

        sink.submit(
            IoRequest::Write {
                fd: Arc::clone(&file),
                pos: 0,
                buf: b"uring".to_vec(),
            },
            Box::new(done.clone()),
        );
        drive(&backend, &sink);
        assert_eq!(done.bytes(), vec![5]);

        sink.submit(
            IoRequest::Read {
                fd: Arc::clone(&file),
                pos: 1,
                buf: vec![0; 4],
            },
            Box::new(done.clone()),
        );
        drive(&backend, &sink);
        assert_eq!(done.bytes(), vec![5, 4]);
        assert_eq!(done.last_buf().as_deref(), Some(&b"ring"[..]));
        Ok(())
    }

    #[test]
    fn test_forget_cancels_pending_poll() -> Result<()> {
        let Some(backend) = backend()? else {
            return Ok(());
        };
        let (r, _w) = pipe()?;
        let state = Rc::new(PollableFdState::new(r));

        let mut d = backend.readable(&state);
        backend.kernel_submit_work(&IoSink::new());
        backend.forget(&state);
        drive(&backend, &IoSink::new());

        // Cancelled, so the waiter is never completed.
        assert!(poll_once(&mut d).is_pending());
        assert!(state.ops.borrow().is_empty());
        Ok(())
    }
}
