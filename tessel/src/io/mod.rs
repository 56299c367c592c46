//! Disk io with fair admission control.
//!
//! Every core owns one io queue per configured device. The
//! queues of one device share a [`FairGroup`] holding its capacity, and
//! dispatch to the reactor backend in weighted fair order across
//! [`IoPriorityClass`]es.
use crate::context;
use crate::error::{Error, Result};
use crate::future::{failed, promise, Deferred};
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

pub mod fair_group;
pub use fair_group::{FairGroup, FairGroupConfig, FairQueueTicket};

pub mod fair_queue;
pub use fair_queue::{FairQueue, FairQueueEntryKey};

mod intent;
pub use intent::IoIntent;

mod io_queue;
pub(crate) use io_queue::IoQueue;
pub use io_queue::IoQueueConfig;

pub(crate) mod priority_class;
pub use priority_class::{register_priority_class, IoPriorityClass};

mod sink;
pub(crate) use sink::{IoCompletion, IoDone, IoRequest, IoSink};

mod syscall_pool;
pub(crate) use syscall_pool::SyscallPool;

/// Identifies the device behind a file, as `st_dev` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// Files on devices without a queue of their own use this one.
    pub const DEFAULT: DeviceId = DeviceId(0);

    pub fn of(file: &File) -> std::io::Result<Self> {
        Ok(DeviceId(file.metadata()?.dev()))
    }

    pub fn of_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(DeviceId(std::fs::metadata(path)?.dev()))
    }
}

/// Runs `f` on a syscall pool thread. For blocking calls that have no
/// asynchronous counterpart.
///
/// # Panics
///
/// Panics when called outside of a reactor thread.
#[track_caller]
pub fn blocking<F, T>(f: F) -> Deferred<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    context::with_reactor(|r| {
        let (p, d) = promise();
        let id = r.register_remote(p);
        r.shared.syscalls.submit(Arc::clone(&r.core), id, f);
        d
    })
}

/// A file whose reads and writes go through the io queue of its device.
#[derive(Debug, Clone)]
pub struct DiskFile {
    fd: Arc<OwnedFd>,
    device: DeviceId,
}

impl DiskFile {
    pub fn from_std(file: File) -> Result<Self> {
        let device = DeviceId::of(&file)?;
        Ok(Self {
            fd: Arc::new(OwnedFd::from(file)),
            device,
        })
    }

    /// Opens an existing file for reading and writing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = blocking(move || OpenOptions::new().read(true).write(true).open(path)).await??;
        Self::from_std(file)
    }

    /// Creates, or truncates, a file for reading and writing.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = blocking(move || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
        })
        .await??;
        Self::from_std(file)
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn submit(&self, class: IoPriorityClass, req: IoRequest, intent: Option<&IoIntent>) -> Deferred<IoDone> {
        context::with_reactor(|r| match r.io_queue(self.device) {
            Some(queue) => queue.queue_request(class, req, intent),
            None => failed(Error::Other(Arc::new(anyhow::anyhow!(
                "no io queue for device {:?}",
                self.device
            )))),
        })
    }

    fn max_request_length(&self) -> usize {
        context::with_reactor(|r| r.io_queue(self.device).map(|q| q.max_request_length()))
            .unwrap_or(usize::MAX)
    }

    /// Reads up to `len` bytes at `pos`. The result is shorter than `len`
    /// only at end of file.
    ///
    /// Reads longer than the queue's maximum request length are split; all
    /// parts are queued before the first one is awaited.
    pub async fn read_at(
        &self,
        pos: u64,
        len: usize,
        class: IoPriorityClass,
        intent: Option<&IoIntent>,
    ) -> Result<Vec<u8>> {
        let max = self.max_request_length();
        let parts: Vec<_> = (0..len)
            .step_by(max)
            .map(|off| {
                let part = max.min(len - off);
                let req = IoRequest::Read {
                    fd: Arc::clone(&self.fd),
                    pos: pos + off as u64,
                    buf: vec![0; part],
                };
                (part, self.submit(class, req, intent))
            })
            .collect();

        let (lens, pending): (Vec<_>, Vec<_>) = parts.into_iter().unzip();
        let mut out = Vec::with_capacity(len);
        for (part, done) in lens.into_iter().zip(futures::future::join_all(pending).await) {
            let done = done?;
            out.extend_from_slice(&done.buf[..done.bytes.min(part)]);
            if done.bytes < part {
                break;
            }
        }
        Ok(out)
    }

    /// Writes `buf` at `pos`, split like [`DiskFile::read_at`]. Returns the
    /// number of bytes written.
    pub async fn write_at(
        &self,
        pos: u64,
        buf: &[u8],
        class: IoPriorityClass,
        intent: Option<&IoIntent>,
    ) -> Result<usize> {
        let max = self.max_request_length();
        let parts: Vec<_> = buf
            .chunks(max)
            .enumerate()
            .map(|(i, chunk)| {
                let req = IoRequest::Write {
                    fd: Arc::clone(&self.fd),
                    pos: pos + (i * max) as u64,
                    buf: chunk.to_vec(),
                };
                (chunk.len(), self.submit(class, req, intent))
            })
            .collect();

        let (lens, pending): (Vec<_>, Vec<_>) = parts.into_iter().unzip();
        let mut written = 0;
        for (part, done) in lens.into_iter().zip(futures::future::join_all(pending).await) {
            let done = done?;
            written += done.bytes;
            if done.bytes < part {
                break;
            }
        }
        Ok(written)
    }

    pub async fn fsync(&self, class: IoPriorityClass, intent: Option<&IoIntent>) -> Result<()> {
        let req = IoRequest::Fsync {
            fd: Arc::clone(&self.fd),
        };
        self.submit(class, req, intent).await.map(drop)
    }

    pub async fn size(&self) -> Result<u64> {
        let fd = Arc::clone(&self.fd);
        let len = blocking(move || {
            let file = File::from(fd.try_clone()?);
            file.metadata().map(|m| m.len())
        })
        .await??;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use anyhow::Result;

    #[tessel::test]
    async fn test_write_then_read_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = DiskFile::create(dir.path().join("data")).await?;
        let class = IoPriorityClass::default_class();

        assert_eq!(file.write_at(0, b"hello tessel", class, None).await?, 12);
        file.fsync(class, None).await?;
        assert_eq!(file.size().await?, 12);

        assert_eq!(file.read_at(6, 6, class, None).await?, b"tessel");
        // Short at end of file.
        assert_eq!(file.read_at(6, 100, class, None).await?, b"tessel");
        Ok(())
    }

    #[tessel::test]
    async fn test_open_missing_file_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = DiskFile::open(dir.path().join("missing")).await.err();
        assert_eq!(
            err.and_then(|e| e.raw_os_error()),
            Some(libc::ENOENT)
        );
        Ok(())
    }

    #[test]
    fn test_runtime_config_splits_large_requests() -> Result<()> {
        let mut cfg = IoQueueConfig::named("small");
        cfg.max_request_length = 4096;
        let rt = crate::runtime::Builder::new()
            .cores(1)
            .io_queue(DeviceId::DEFAULT, cfg)
            .try_build()?;

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let read = rt.block_on(async move {
            let file = DiskFile::from_std(tempfile::tempfile()?)?;
            let class = IoPriorityClass::default_class();
            assert_eq!(file.write_at(0, &data, class, None).await?, data.len());
            let read = file.read_at(0, data.len(), class, None).await?;
            Ok::<_, crate::Error>(read)
        })?;
        assert_eq!(read, expected);
        Ok(())
    }

    #[tessel::test]
    async fn test_blocking_runs_off_reactor() -> Result<()> {
        let me = std::thread::current().id();
        let there = blocking(|| std::thread::current().id()).await?;
        assert_ne!(me, there);
        Ok(())
    }
}
