/// Hints the CPU to pull the cache line holding `ptr` ahead of use.
#[inline(always)]
pub(crate) fn prefetch_read<T: ?Sized>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    // Safety: prefetch never faults, even on invalid addresses.
    unsafe {
        use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch::<_MM_HINT_T0>(ptr as *const i8);
    }

    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}
