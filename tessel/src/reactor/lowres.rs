use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

// Nanoseconds since EPOCH as of the last refresh.
static NOW_NS: AtomicU64 = AtomicU64::new(0);

/// Cheap monotonic clock with the granularity of the runtime's lowres tick.
///
/// Core 0 refreshes a process-wide snapshot from a periodic timer and from
/// its poll loop; every core reads it with one atomic load. Readings never go
/// backwards and lag the real clock by at most about one granularity while
/// the runtime runs.
#[derive(Debug, Clone, Copy)]
pub struct LowresClock;

impl LowresClock {
    pub fn now() -> Instant {
        epoch() + Duration::from_nanos(NOW_NS.load(Ordering::Acquire))
    }

    pub(crate) fn refresh() {
        let ns = epoch().elapsed().as_nanos() as u64;
        NOW_NS.fetch_max(ns, Ordering::AcqRel);
    }

    pub(crate) fn refresh_if_stale(granularity: Duration) {
        let last = NOW_NS.load(Ordering::Acquire);
        let ns = epoch().elapsed().as_nanos() as u64;
        if ns.saturating_sub(last) >= granularity.as_nanos() as u64 {
            NOW_NS.fetch_max(ns, Ordering::AcqRel);
        }
    }
}

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}
