//! Shared monotonic timebase.
//!
//! Every component that timestamps or expires state uses this clock so that
//! calibrated sample timestamps, flush-cycle eviction, and anomaly refractory
//! windows all live in the same nanosecond domain.

/// Returns the current monotonic clock value in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does
    // not require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}
