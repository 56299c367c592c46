use crate::context;
use crate::error::{Error, Result};
use crate::future::{promise, ready, Deferred, Promise};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

pub(crate) const EV_IN: u32 = libc::EPOLLIN as u32;
pub(crate) const EV_OUT: u32 = libc::EPOLLOUT as u32;
const EV_FAIL: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Readiness bookkeeping of one file descriptor.
///
/// `requested` holds the events some task waits for, `installed` the events
/// the backend currently watches and `known` readiness reported by the kernel
/// that no task consumed yet. At most one task waits for each direction.
pub(crate) struct PollableFdState {
    fd: OwnedFd,
    pub(crate) requested: Cell<u32>,
    pub(crate) installed: Cell<u32>,
    pub(crate) known: Cell<u32>,
    /// Set while the fd is part of the backend's interest set.
    pub(crate) registered: Cell<bool>,
    /// Backend operations in flight against this fd.
    pub(crate) ops: RefCell<SmallVec<[u64; 2]>>,
    pollin: RefCell<Option<Promise<()>>>,
    pollout: RefCell<Option<Promise<()>>>,
}

impl PollableFdState {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            requested: Cell::new(0),
            installed: Cell::new(0),
            known: Cell::new(0),
            registered: Cell::new(false),
            ops: RefCell::new(SmallVec::new()),
            pollin: RefCell::new(None),
            pollout: RefCell::new(None),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Readiness for `event`: ready at once if the kernel already reported it,
    /// otherwise a promise completed by [`PollableFdState::complete`]. The
    /// caller installs interest with the backend when `needs_install` is set.
    pub(crate) fn wait_for(&self, event: u32) -> (Deferred<()>, bool) {
        if self.known.get() & event != 0 {
            self.known.set(self.known.get() & !event);
            return (ready(()), false);
        }

        let (p, d) = promise();
        let slot = if event == EV_IN { &self.pollin } else { &self.pollout };
        if slot.borrow_mut().replace(p).is_some() {
            tracing::debug!(fd = self.raw_fd(), event, "second waiter replaced the first");
        }

        self.requested.set(self.requested.get() | event);
        (d, self.installed.get() & event == 0)
    }

    /// Delivers kernel readiness. Errors and hangups wake both directions so
    /// the next syscall reports them.
    pub(crate) fn complete(&self, mut events: u32) {
        if events & EV_FAIL != 0 {
            events |= EV_IN | EV_OUT;
        }

        for (event, slot) in [(EV_IN, &self.pollin), (EV_OUT, &self.pollout)] {
            if events & event == 0 {
                continue;
            }
            let waiter = slot.borrow_mut().take();
            match waiter {
                Some(p) => p.set_value(()),
                None => self.known.set(self.known.get() | event),
            }
        }
        self.requested.set(self.requested.get() & !events);
    }

    pub(crate) fn forget_readiness(&self, event: u32) {
        self.known.set(self.known.get() & !event);
    }
}

impl fmt::Debug for PollableFdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollableFdState")
            .field("fd", &self.raw_fd())
            .field("requested", &self.requested.get())
            .field("installed", &self.installed.get())
            .field("known", &self.known.get())
            .finish()
    }
}

/// A non-blocking file descriptor driven by the reactor backend.
///
/// Buffers are passed by value so they stay valid while the kernel owns them;
/// every operation hands its buffer back.
pub struct PollableFd {
    state: Rc<PollableFdState>,
}

impl PollableFd {
    /// Takes ownership of `fd` and switches it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            state: Rc::new(PollableFdState::new(fd)),
        })
    }

    pub(crate) fn state(&self) -> &Rc<PollableFdState> {
        &self.state
    }

    pub async fn readable(&self) -> Result<()> {
        context::with_reactor(|r| r.backend.readable(&self.state)).await
    }

    pub async fn writeable(&self) -> Result<()> {
        context::with_reactor(|r| r.backend.writeable(&self.state)).await
    }

    /// Reads at most `buf.len()` bytes. Zero means end of stream.
    pub async fn read_some(&self, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
        let state = Rc::clone(&self.state);
        context::with_reactor(|r| r.backend.read_some(state, buf)).await
    }

    pub async fn write_some(&self, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
        let state = Rc::clone(&self.state);
        context::with_reactor(|r| r.backend.write_some(state, buf)).await
    }

    /// Writes the whole buffer, handing back the emptied allocation.
    pub async fn write_all(&self, mut buf: Vec<u8>) -> Result<Vec<u8>> {
        while !buf.is_empty() {
            let (n, mut rest) = self.write_some(buf).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            rest.drain(..n);
            buf = rest;
        }
        Ok(buf)
    }

    pub async fn accept(&self) -> Result<(PollableFd, SocketAddr)> {
        let state = Rc::clone(&self.state);
        let (fd, addr) = context::with_reactor(|r| r.backend.accept(state)).await?;
        Ok((PollableFd::new(fd)?, addr))
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        let state = Rc::clone(&self.state);
        context::with_reactor(|r| r.backend.connect(state, addr)).await
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let how = match how {
            Shutdown::Read => nix::sys::socket::Shutdown::Read,
            Shutdown::Write => nix::sys::socket::Shutdown::Write,
            Shutdown::Both => nix::sys::socket::Shutdown::Both,
        };
        nix::sys::socket::shutdown(self.state.raw_fd(), how)
            .map_err(Error::from)
    }

    /// Closes the descriptor. Dropping does the same.
    pub fn close(self) {}
}

impl AsRawFd for PollableFd {
    fn as_raw_fd(&self) -> RawFd {
        self.state.raw_fd()
    }
}

impl Drop for PollableFd {
    fn drop(&mut self) {
        // The backend lets go of the fd before it closes.
        context::try_with_reactor(|r| r.backend.forget(&self.state));
    }
}

impl fmt::Debug for PollableFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PollableFd").field(&self.state.raw_fd()).finish()
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
