use std::io;
use std::sync::Arc;

/// Failures carried inside futures.
///
/// Errors are `Clone` because a single failure is frequently fanned out to
/// many waiters at once (a broken semaphore fails every queued waiter, a
/// cancelled intent fails every linked request).
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The producing side was dropped without ever setting a value.
    #[error("broken promise")]
    BrokenPromise,

    #[error("timed out")]
    TimedOut,

    #[error("gate closed")]
    GateClosed,

    #[error("abort requested")]
    AbortRequested,

    /// An io request linked to an intent was cancelled before dispatch.
    #[error("operation cancelled")]
    Cancelled,

    #[error("semaphore broken: {0}")]
    SemaphoreBroken(String),

    #[error("condition variable broken")]
    ConditionVariableBroken,

    /// Raised by the allocation checkpoints, usually through failure injection.
    #[error("allocation failed")]
    AllocationFailed,

    #[error("priority class table is full (max {max})")]
    TooManyPriorityClasses { max: usize },

    #[error("scheduling group table is full (max {max})")]
    TooManySchedulingGroups { max: usize },

    #[error("no such scheduling group")]
    NoSuchSchedulingGroup,

    #[error("no such priority class")]
    NoSuchPriorityClass,

    /// Scheduling group and priority class names label metric series and
    /// must be unique.
    #[error("name already in use: {0}")]
    NameInUse(String),

    #[error("core {core} does not exist, runtime has {cores} cores")]
    NoSuchCore { core: usize, cores: usize },

    #[error("metric series already registered: {0}")]
    DuplicateMetric(String),

    #[error("signal {0} is not handled by this runtime")]
    SignalNotHandled(i32),

    /// The runtime is shutting down and can no longer accept work.
    #[error("runtime is shutting down")]
    Shutdown,

    /// A task or continuation panicked; the payload message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A catch-all for any other type of unexpected error.
    #[error("unexpected error: {0}")]
    Other(Arc<anyhow::Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TimedOut => true,
            Error::Io(e) => e
                .raw_os_error()
                .is_some_and(|errno| matches!(errno, libc::EAGAIN | libc::EINTR)),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Shutdown)
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn from_errno(errno: i32) -> Self {
        Error::Io(Arc::new(io::Error::from_raw_os_error(errno)))
    }

    pub(crate) fn last_os_error() -> Self {
        Error::Io(Arc::new(io::Error::last_os_error()))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SemaphoreBroken(a), Self::SemaphoreBroken(b)) => a == b,
            (Self::TooManyPriorityClasses { max: a }, Self::TooManyPriorityClasses { max: b }) => {
                a == b
            }
            (
                Self::TooManySchedulingGroups { max: a },
                Self::TooManySchedulingGroups { max: b },
            ) => a == b,
            (
                Self::NoSuchCore { core: a, cores: x },
                Self::NoSuchCore { core: b, cores: y },
            ) => a == b && x == y,
            (Self::DuplicateMetric(a), Self::DuplicateMetric(b)) => a == b,
            (Self::NameInUse(a), Self::NameInUse(b)) => a == b,
            (Self::SignalNotHandled(a), Self::SignalNotHandled(b)) => a == b,
            (Self::Panicked(a), Self::Panicked(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::Other(a), Self::Other(b)) => a.to_string() == b.to_string(),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<nix::Error> for Error {
    fn from(errno: nix::Error) -> Self {
        Error::from_errno(errno as i32)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(Arc::new(e))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => match Arc::try_unwrap(inner) {
                Ok(inner) => inner,
                Err(shared) => io::Error::new(shared.kind(), shared.to_string()),
            },
            Error::TimedOut => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            _ => io::Error::other(e.to_string()),
        }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_payload_as_str(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
