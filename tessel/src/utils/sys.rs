//! Thin wrappers over the file descriptor based kernel notification
//! primitives the reactor sleeps on.
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub(crate) fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Non-blocking eventfd used to kick a sleeping reactor.
#[derive(Debug)]
pub(crate) struct EventFd(OwnedFd);

impl EventFd {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // Safety: fd was just returned by the kernel and is owned by nobody else.
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub(crate) fn signal(&self) -> io::Result<()> {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };

        match ret {
            // Counter saturated, the reader has a wakeup pending anyway.
            -1 if io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN) => Ok(()),
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }

    /// Resets the counter, returning how many signals were coalesced.
    pub(crate) fn drain(&self) -> io::Result<u64> {
        read_u64(self.0.as_raw_fd())
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// High resolution one-shot timer on `CLOCK_MONOTONIC`, the clock backing
/// `std::time::Instant` on Linux.
#[derive(Debug)]
pub(crate) struct TimerFd(OwnedFd);

impl TimerFd {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = cvt(unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        })?;
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Arms the timer for `deadline`, or disarms it with `None`.
    pub(crate) fn arm(&self, deadline: Option<Instant>) -> io::Result<()> {
        let value = match deadline {
            // A zero it_value disarms, so an expired deadline fires in 1ns.
            Some(deadline) => duration_to_timespec(
                deadline
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_nanos(1)),
            ),
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };

        cvt(unsafe { libc::timerfd_settime(self.0.as_raw_fd(), 0, &spec, std::ptr::null_mut()) })?;
        Ok(())
    }

    pub(crate) fn drain(&self) -> io::Result<u64> {
        read_u64(self.0.as_raw_fd())
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

fn read_u64(fd: RawFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    let ret = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };

    match ret {
        -1 if io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN) => Ok(0),
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(value),
    }
}

pub(crate) fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

pub(crate) fn sigset(signals: &[i32]) -> io::Result<libc::sigset_t> {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    cvt(unsafe { libc::sigemptyset(set.as_mut_ptr()) })?;
    for &signo in signals {
        cvt(unsafe { libc::sigaddset(set.as_mut_ptr(), signo) })?;
    }
    // Safety: initialized by sigemptyset.
    Ok(unsafe { set.assume_init() })
}

/// Blocks `signals` for the calling thread, returning the previous mask.
/// Threads spawned afterwards inherit the mask.
pub(crate) fn block_signals(signals: &[i32]) -> io::Result<libc::sigset_t> {
    let set = sigset(signals)?;
    let mut old = MaybeUninit::<libc::sigset_t>::uninit();
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, old.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok(unsafe { old.assume_init() })
}

pub(crate) fn restore_signal_mask(old: &libc::sigset_t) -> io::Result<()> {
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, old, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

/// Non-blocking signalfd delivering `signals`, which must already be blocked.
pub(crate) fn signal_fd(signals: &[i32]) -> io::Result<OwnedFd> {
    let set = sigset(signals)?;
    let fd = cvt(unsafe { libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Replaces the set of signals delivered through an existing signalfd.
pub(crate) fn update_signal_fd(fd: RawFd, signals: &[i32]) -> io::Result<()> {
    let set = sigset(signals)?;
    cvt(unsafe { libc::signalfd(fd, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) })?;
    Ok(())
}

/// Reads one pending signal number from a signalfd.
pub(crate) fn read_signal(fd: RawFd) -> io::Result<Option<i32>> {
    let mut info = MaybeUninit::<libc::signalfd_siginfo>::zeroed();
    let size = std::mem::size_of::<libc::signalfd_siginfo>();
    let ret = unsafe { libc::read(fd, info.as_mut_ptr() as *mut libc::c_void, size) };

    match ret {
        -1 if io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN) => Ok(None),
        -1 => Err(io::Error::last_os_error()),
        n if n as usize == size => Ok(Some(unsafe { info.assume_init() }.ssi_signo as i32)),
        _ => Ok(None),
    }
}

/// Raising the soft `RLIMIT_NOFILE` to the hard limit keeps busy servers from
/// failing accept calls with EMFILE long before the system limit.
pub(crate) fn raise_fd_ulimit() -> io::Result<u64> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    cvt(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) })?;

    if lim.rlim_cur < lim.rlim_max {
        let raised = libc::rlimit {
            rlim_cur: lim.rlim_max,
            rlim_max: lim.rlim_max,
        };
        cvt(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) })?;
        return Ok(raised.rlim_cur as u64);
    }

    Ok(lim.rlim_cur as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_eventfd_coalesces_signals() -> Result<()> {
        let efd = EventFd::new()?;
        assert_eq!(efd.drain()?, 0);

        efd.signal()?;
        efd.signal()?;
        assert_eq!(efd.drain()?, 2);
        assert_eq!(efd.drain()?, 0);
        Ok(())
    }

    #[test]
    fn test_timerfd_fires_after_deadline() -> Result<()> {
        let tfd = TimerFd::new()?;
        let start = Instant::now();
        tfd.arm(Some(start + Duration::from_millis(5)))?;

        while tfd.drain()? == 0 {
            std::thread::yield_now();
        }
        assert!(start.elapsed() >= Duration::from_millis(5));

        tfd.arm(None)?;
        Ok(())
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(get_page_size().is_power_of_two());
    }
}
