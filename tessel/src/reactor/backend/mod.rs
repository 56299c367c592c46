//! Kernel interfaces of the reactor.
//!
//! A backend owns everything the reactor blocks on: descriptor readiness,
//! the highres timer, the core's wake eventfd and (on core 0) the signalfd.
//! It also performs the disk requests the io queues dispatch into the
//! reactor's [`IoSink`].
use crate::context;
use crate::error::{Error, Result};
use crate::future::Deferred;
use crate::io::IoSink;
use crate::reactor::pollable::{PollableFdState, EV_IN, EV_OUT};
use crate::utils::sys::TimerFd;
use futures::future::LocalBoxFuture;
use nix::errno::Errno;
use nix::sys::socket::{self, SockFlag, SockaddrLike, SockaddrStorage};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

mod epoll;
pub(crate) use epoll::EpollBackend;

mod uring;
pub(crate) use uring::UringBackend;

pub(crate) type IoFuture<T> = LocalBoxFuture<'static, Result<T>>;

/// Consumes the expirations of the highres timer. Readiness may be stale,
/// leaving nothing to read.
fn drain_timer(timer: &TimerFd) {
    match timer.drain() {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => tracing::warn!(error = %e, "failed to drain the highres timer"),
    }
}

pub(crate) trait ReactorBackend {
    fn name(&self) -> &'static str;

    /// Collects finished kernel work without blocking. True if anything
    /// completed.
    fn reap_kernel_completions(&self) -> bool;

    /// Hands queued work to the kernel, including the disk requests waiting
    /// in `sink`. True if anything was submitted.
    fn kernel_submit_work(&self, sink: &IoSink) -> bool;

    /// Blocks until a descriptor, the highres timer, a signal or the wake fd
    /// needs attention, then processes what arrived.
    fn wait_and_process_events(&self) -> io::Result<()>;

    fn arm_highres_timer(&self, deadline: Option<Instant>) -> io::Result<()>;

    /// Includes the signalfd in the set of things a sleeping reactor wakes
    /// up for.
    fn start_handling_signals(&self, fd: RawFd) -> io::Result<()>;

    fn readable(&self, fd: &Rc<PollableFdState>) -> Deferred<()>;

    fn writeable(&self, fd: &Rc<PollableFdState>) -> Deferred<()>;

    /// Drops every reference to `fd` before it is closed.
    fn forget(&self, fd: &PollableFdState);

    fn read_some(&self, fd: Rc<PollableFdState>, buf: Vec<u8>) -> IoFuture<(usize, Vec<u8>)> {
        Box::pin(read_when_ready(fd, buf))
    }

    fn write_some(&self, fd: Rc<PollableFdState>, buf: Vec<u8>) -> IoFuture<(usize, Vec<u8>)> {
        Box::pin(write_when_ready(fd, buf))
    }

    fn accept(&self, fd: Rc<PollableFdState>) -> IoFuture<(OwnedFd, SocketAddr)> {
        Box::pin(accept_when_ready(fd))
    }

    fn connect(&self, fd: Rc<PollableFdState>, addr: SocketAddr) -> IoFuture<()> {
        Box::pin(connect_when_ready(fd, addr))
    }
}

fn readable(fd: &Rc<PollableFdState>) -> Deferred<()> {
    context::with_reactor(|r| r.backend.readable(fd))
}

fn writeable(fd: &Rc<PollableFdState>) -> Deferred<()> {
    context::with_reactor(|r| r.backend.writeable(fd))
}

fn io_result(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

async fn read_when_ready(fd: Rc<PollableFdState>, mut buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
    loop {
        let ret = unsafe { libc::read(fd.raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        match io_result(ret) {
            Ok(n) => return Ok((n, buf)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                fd.forget_readiness(EV_IN);
                readable(&fd).await?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn write_when_ready(fd: Rc<PollableFdState>, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
    loop {
        let ret = unsafe { libc::write(fd.raw_fd(), buf.as_ptr().cast(), buf.len()) };
        match io_result(ret) {
            Ok(n) => return Ok((n, buf)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                fd.forget_readiness(EV_OUT);
                writeable(&fd).await?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn accept_when_ready(fd: Rc<PollableFdState>) -> Result<(OwnedFd, SocketAddr)> {
    loop {
        match socket::accept4(fd.raw_fd(), SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(raw) => {
                let conn = unsafe { OwnedFd::from_raw_fd(raw) };
                let peer = socket::getpeername::<SockaddrStorage>(raw)?;
                return Ok((conn, to_socket_addr(&peer)?));
            }
            Err(Errno::EAGAIN) => {
                fd.forget_readiness(EV_IN);
                readable(&fd).await?;
            }
            Err(Errno::EINTR | Errno::ECONNABORTED) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn connect_when_ready(fd: Rc<PollableFdState>, addr: SocketAddr) -> Result<()> {
    let sockaddr = SockaddrStorage::from(addr);
    match socket::connect(fd.raw_fd(), &sockaddr) {
        Ok(()) => return Ok(()),
        Err(Errno::EINPROGRESS | Errno::EINTR) => {}
        Err(e) => return Err(e.into()),
    }

    writeable(&fd).await?;

    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    match err {
        0 => Ok(()),
        errno => Err(Error::from_errno(errno)),
    }
}

pub(crate) fn to_socket_addr(addr: &SockaddrStorage) -> io::Result<SocketAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Ok(SocketAddr::V4(SocketAddrV4::from(*v4)));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Ok(SocketAddr::V6(SocketAddrV6::from(*v6)));
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported address family {:?}", addr.family()),
    ))
}
