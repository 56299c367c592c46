pub(crate) mod io_uring;

pub(crate) mod prefetch;

pub(crate) mod sys;

pub(crate) mod thread;
