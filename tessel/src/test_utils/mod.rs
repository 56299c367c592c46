use crate::error::Result;
use crate::io::{IoCompletion, IoDone};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::pin::pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// Counts how often the paired waker was woken.
#[derive(Debug, Default)]
pub(crate) struct WakerData {
    wake_count: AtomicUsize,
}

impl WakerData {
    pub(crate) fn get_count(&self) -> usize {
        self.wake_count.load(Ordering::Relaxed)
    }
}

impl Wake for WakerData {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_count.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn mock_waker() -> (Waker, Arc<WakerData>) {
    let data = Arc::new(WakerData::default());
    (Waker::from(Arc::clone(&data)), data)
}

/// Polls `fut` once with a waker that goes nowhere. Pass `&mut fut` to keep
/// polling the same future afterwards.
pub(crate) fn poll_once<F: Future>(fut: F) -> Poll<F::Output> {
    let (waker, _) = mock_waker();
    let mut cx = Context::from_waker(&waker);
    pin!(fut).poll(&mut cx)
}

/// Records every result handed to it. Clones share the record.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingCompletion {
    results: Rc<RefCell<Vec<Result<IoDone>>>>,
}

impl RecordingCompletion {
    /// Byte counts of the successful completions, in completion order.
    pub(crate) fn bytes(&self) -> Vec<usize> {
        self.results
            .borrow()
            .iter()
            .filter_map(|r| r.as_ref().ok().map(|d| d.bytes))
            .collect()
    }

    pub(crate) fn last_buf(&self) -> Option<Vec<u8>> {
        self.results
            .borrow()
            .iter()
            .rev()
            .find_map(|r| r.as_ref().ok())
            .map(|d| d.buf[..d.bytes.min(d.buf.len())].to_vec())
    }

    pub(crate) fn errors(&self) -> usize {
        self.results.borrow().iter().filter(|r| r.is_err()).count()
    }
}

impl IoCompletion for RecordingCompletion {
    fn complete_with(self: Box<Self>, res: Result<IoDone>) {
        self.results.borrow_mut().push(res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::promise;

    #[test]
    fn test_mock_waker_counts_wakes() {
        let (waker, data) = mock_waker();
        waker.wake_by_ref();
        let clone = waker.clone();
        clone.wake();
        drop(waker);
        assert_eq!(data.get_count(), 2);
    }

    #[test]
    fn test_poll_once_by_reference() {
        let (p, mut d) = promise::<u8>();
        assert!(poll_once(&mut d).is_pending());
        p.set_value(4);
        assert_eq!(poll_once(&mut d), Poll::Ready(Ok(4)));
    }
}

struct LogBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` under a fmt subscriber local to this thread and returns what it
/// logged alongside its result.
pub(crate) fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&buf);
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(move || LogBuf(Arc::clone(&writer)))
        .finish();

    let out = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buf.lock()).into_owned();
    (out, logs)
}
