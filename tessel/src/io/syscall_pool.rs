use crate::context::{self, CoreHandle};
use crate::future::guarded;
use crossbeam_channel::{unbounded, Sender};
use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Threads running blocking syscalls for the reactors.
///
/// A job's result travels back through the submitting core's alien queue and
/// resolves the reply registered under `id` there.
pub(crate) struct SyscallPool {
    tx: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl SyscallPool {
    pub(crate) fn try_new(threads: usize) -> io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();

        let threads = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("tessel-syscall-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            tx: Some(tx),
            threads,
        })
    }

    pub(crate) fn submit<T, F>(&self, core: Arc<CoreHandle>, id: usize, f: F)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let job: Job = Box::new(move || {
            let res = guarded(f).map(|v| Box::new(v) as Box<dyn Any + Send>);
            core.push_alien(Box::new(move || {
                context::with_reactor(|r| r.resolve_remote(id, res));
            }));
        });

        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        if tx.send(job).is_err() {
            // The reply slot is freed at teardown.
            tracing::warn!(id, "syscall pool is gone, request dropped");
        }
    }
}

impl Drop for SyscallPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        let me = thread::current().id();
        for t in self.threads.drain(..) {
            if t.thread().id() == me {
                continue;
            }
            if t.join().is_err() {
                tracing::warn!("syscall thread panicked");
            }
        }
    }
}

impl fmt::Debug for SyscallPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallPool")
            .field("threads", &self.threads.len())
            .finish()
    }
}
