use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed point used by [`FairQueueTicket::normalize`]: a ticket that is
/// exactly the group capacity along one axis normalizes to this value.
pub const NORMALIZE_SCALE: u64 = 1 << 20;

/// The cost of one request, charged against a [`FairGroup`] while the request
/// is executing. `weight` counts requests, `size` counts bytes (both scaled by
/// the io queue cost function).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FairQueueTicket {
    weight: u32,
    size: u32,
}

impl FairQueueTicket {
    pub const fn new(weight: u32, size: u32) -> Self {
        Self { weight, size }
    }

    pub const fn weight(&self) -> u32 {
        self.weight
    }

    pub const fn size(&self) -> u32 {
        self.size
    }

    pub const fn is_non_zero(&self) -> bool {
        self.weight > 0 || self.size > 0
    }

    /// True if both axes are within `cap`.
    pub const fn fits(&self, cap: &FairQueueTicket) -> bool {
        self.weight <= cap.weight && self.size <= cap.size
    }

    /// Scalar cost relative to `cap`: the sum of both axes expressed as
    /// fractions of the capacity, in [`NORMALIZE_SCALE`] fixed point.
    pub fn normalize(&self, cap: &FairQueueTicket) -> u64 {
        fn axis(v: u32, cap: u32) -> u64 {
            if cap == 0 {
                return 0;
            }
            ((v as u128 * NORMALIZE_SCALE as u128) / cap as u128) as u64
        }

        axis(self.weight, cap.weight) + axis(self.size, cap.size)
    }

    /// A ticket no axis of which exceeds `cap`.
    pub fn clamp_to(&self, cap: &FairQueueTicket) -> Self {
        Self {
            weight: self.weight.min(cap.weight),
            size: self.size.min(cap.size),
        }
    }

    fn pack(&self) -> u64 {
        ((self.weight as u64) << 32) | self.size as u64
    }

    fn unpack(v: u64) -> Self {
        Self {
            weight: (v >> 32) as u32,
            size: v as u32,
        }
    }
}

impl fmt::Debug for FairQueueTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.weight, self.size)
    }
}

impl Add for FairQueueTicket {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            weight: self.weight.saturating_add(rhs.weight),
            size: self.size.saturating_add(rhs.size),
        }
    }
}

impl AddAssign for FairQueueTicket {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for FairQueueTicket {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            weight: self.weight.saturating_sub(rhs.weight),
            size: self.size.saturating_sub(rhs.size),
        }
    }
}

impl SubAssign for FairQueueTicket {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FairGroupConfig {
    pub max_weight: u32,
    pub max_size: u32,
}

/// Capacity shared by every fair queue drawing from one physical resource.
///
/// Queues on different cores grab and release capacity concurrently, the
/// outstanding `(weight, size)` pair is packed in a single atomic so a grab is
/// all-or-nothing on both axes.
#[derive(Debug)]
pub struct FairGroup {
    name: String,
    capacity: FairQueueTicket,
    outstanding: AtomicU64,
}

impl FairGroup {
    #[track_caller]
    pub fn new(name: impl Into<String>, cfg: FairGroupConfig) -> Self {
        assert!(
            cfg.max_weight > 0 || cfg.max_size > 0,
            "fair group capacity must be non zero"
        );

        Self {
            name: name.into(),
            capacity: FairQueueTicket::new(cfg.max_weight, cfg.max_size),
            outstanding: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> FairQueueTicket {
        self.capacity
    }

    pub fn outstanding(&self) -> FairQueueTicket {
        FairQueueTicket::unpack(self.outstanding.load(Ordering::Acquire))
    }

    /// Reserves `ticket` if the group has room for it on both axes.
    pub fn try_grab(&self, ticket: FairQueueTicket) -> bool {
        let mut current = self.outstanding.load(Ordering::Acquire);

        loop {
            let next = FairQueueTicket::unpack(current) + ticket;
            if !next.fits(&self.capacity) {
                return false;
            }

            match self.outstanding.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns capacity previously reserved with [`FairGroup::try_grab`].
    pub fn release(&self, ticket: FairQueueTicket) {
        let prev = FairQueueTicket::unpack(self.outstanding.fetch_sub(ticket.pack(), Ordering::AcqRel));
        debug_assert!(
            ticket.fits(&prev),
            "released {ticket:?} but only {prev:?} was outstanding"
        );
    }
}
