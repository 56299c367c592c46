use crate::error::Result;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

/// A disk request the backend performs on behalf of an io queue.
///
/// Buffers travel with the request and come back in [`IoDone`], the kernel
/// never sees memory the caller still owns.
#[derive(Debug)]
pub(crate) enum IoRequest {
    Read {
        fd: Arc<OwnedFd>,
        pos: u64,
        buf: Vec<u8>,
    },
    Write {
        fd: Arc<OwnedFd>,
        pos: u64,
        buf: Vec<u8>,
    },
    Fsync {
        fd: Arc<OwnedFd>,
    },
}

impl IoRequest {
    pub(crate) fn len(&self) -> usize {
        match self {
            IoRequest::Read { buf, .. } | IoRequest::Write { buf, .. } => buf.len(),
            IoRequest::Fsync { .. } => 0,
        }
    }

    pub(crate) fn is_write(&self) -> bool {
        matches!(self, IoRequest::Write { .. } | IoRequest::Fsync { .. })
    }

    /// Runs the request with a blocking syscall. Used by backends without
    /// asynchronous disk io, from the syscall pool.
    pub(crate) fn perform(self) -> io::Result<IoDone> {
        match self {
            IoRequest::Read { fd, pos, mut buf } => {
                let bytes = nix::sys::uio::pread(&*fd, &mut buf, pos as libc::off_t)?;
                Ok(IoDone { bytes, buf })
            }
            IoRequest::Write { fd, pos, buf } => {
                let bytes = nix::sys::uio::pwrite(&*fd, &buf, pos as libc::off_t)?;
                Ok(IoDone { bytes, buf })
            }
            IoRequest::Fsync { fd } => {
                nix::unistd::fsync(fd.as_raw_fd())?;
                Ok(IoDone {
                    bytes: 0,
                    buf: Vec::new(),
                })
            }
        }
    }
}

/// A finished disk request.
#[derive(Debug)]
pub(crate) struct IoDone {
    pub(crate) bytes: usize,
    pub(crate) buf: Vec<u8>,
}

/// Receives the outcome of one dispatched request, on the core that
/// dispatched it.
pub(crate) trait IoCompletion {
    fn complete_with(self: Box<Self>, res: Result<IoDone>);
}

/// Requests dispatched by the io queues of a core, waiting for the backend.
#[derive(Default)]
pub(crate) struct IoSink {
    pending: RefCell<VecDeque<(IoRequest, Box<dyn IoCompletion>)>>,
}

impl IoSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn submit(&self, req: IoRequest, completion: Box<dyn IoCompletion>) {
        self.pending.borrow_mut().push_back((req, completion));
    }

    /// Hands every queued request to `f`, oldest first. Requests submitted
    /// by `f` itself wait for the next drain.
    pub(crate) fn drain(&self, mut f: impl FnMut(IoRequest, Box<dyn IoCompletion>)) -> usize {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let n = pending.len();
        for (req, completion) in pending {
            f(req, completion);
        }
        n
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.borrow().len()
    }
}

impl fmt::Debug for IoSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSink").field("pending", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingCompletion;
    use anyhow::Result;

    #[test]
    fn test_drain_is_fifo() {
        let sink = IoSink::new();
        let file = Arc::new(OwnedFd::from(tempfile::tempfile().expect("tempfile")));
        for pos in [0, 4096, 8192] {
            sink.submit(
                IoRequest::Read {
                    fd: Arc::clone(&file),
                    pos,
                    buf: vec![0; 8],
                },
                Box::new(RecordingCompletion::default()),
            );
        }

        let mut seen = Vec::new();
        let n = sink.drain(|req, _| {
            if let IoRequest::Read { pos, .. } = req {
                seen.push(pos);
            }
        });
        assert_eq!(n, 3);
        assert_eq!(seen, vec![0, 4096, 8192]);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_perform_reads_back_writes() -> Result<()> {
        let file = Arc::new(OwnedFd::from(tempfile::tempfile()?));
        let wrote = IoRequest::Write {
            fd: Arc::clone(&file),
            pos: 3,
            buf: b"tessel".to_vec(),
        }
        .perform()?;
        assert_eq!(wrote.bytes, 6);

        IoRequest::Fsync { fd: Arc::clone(&file) }.perform()?;

        let read = IoRequest::Read {
            fd: Arc::clone(&file),
            pos: 0,
            buf: vec![0xff; 16],
        }
        .perform()?;
        assert_eq!(read.bytes, 9);
        assert_eq!(&read.buf[..9], b"\0\0\0tessel");
        Ok(())
    }
}
