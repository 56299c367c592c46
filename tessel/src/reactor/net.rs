//! Minimal TCP on top of [`PollableFd`].
use crate::error::{Error, Result};
use crate::reactor::backend::to_socket_addr;
use crate::reactor::PollableFd;
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, sockopt,
};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

const LISTEN_BACKLOG: i32 = 1024;

fn stream_socket(addr: &SocketAddr) -> Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(Error::from)
}

fn local_addr_of(fd: RawFd) -> Result<SocketAddr> {
    let addr = socket::getsockname::<SockaddrStorage>(fd)?;
    Ok(to_socket_addr(&addr)?)
}

pub struct TcpListener {
    fd: PollableFd,
}

impl TcpListener {
    /// Binds with `SO_REUSEADDR`. Port 0 picks a free port, see
    /// [`TcpListener::local_addr`].
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let fd = stream_socket(&addr)?;
        socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
        socket::listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;

        tracing::debug!(%addr, "listening");
        Ok(Self {
            fd: PollableFd::new(fd)?,
        })
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (fd, peer) = self.fd.accept().await?;
        Ok((TcpStream { fd }, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        local_addr_of(self.fd.as_raw_fd())
    }
}

pub struct TcpStream {
    fd: PollableFd,
}

impl TcpStream {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let fd = PollableFd::new(stream_socket(&addr)?)?;
        fd.connect(addr).await?;
        Ok(Self { fd })
    }

    pub async fn read_some(&self, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
        self.fd.read_some(buf).await
    }

    pub async fn write_all(&self, buf: Vec<u8>) -> Result<Vec<u8>> {
        self.fd.write_all(buf).await
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.fd.shutdown(how)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let addr = socket::getpeername::<SockaddrStorage>(self.fd.as_raw_fd())?;
        Ok(to_socket_addr(&addr)?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        local_addr_of(self.fd.as_raw_fd())
    }
}
