//! Process-wide diagnostic gauges.
//!
//! Gauges are advisory: they feed reporting, never allocation decisions, and
//! concurrent updates may interleave so a reader sees a momentarily
//! inconsistent total.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Saturating byte gauge.
///
/// An increment and the matching decrement can land in either order under
/// contention, so the raw value is kept signed and a momentary negative
/// reads as zero.
pub struct Gauge(AtomicIsize);

fn to_delta(bytes: usize) -> isize {
    // A delta beyond isize::MAX could only come from corrupt accounting;
    // saturate rather than wrap.
    bytes.min(isize::MAX as usize) as isize
}

impl Gauge {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    pub fn add(&self, bytes: usize) {
        self.0.fetch_add(to_delta(bytes), Ordering::Relaxed);
    }

    pub fn sub(&self, bytes: usize) {
        self.0.fetch_sub(to_delta(bytes), Ordering::Relaxed);
    }

    pub fn value(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0) as usize
    }
}

// Every byte of address space currently mapped by the heap: arena chunks,
// huge mappings, base pages, and chunks parked in the recycle cache.
// Maintained by the VM shim; reported by stats() as `mapped_total`.
crate::sync::loom_static! {
    pub static TOTAL_MAPPED: Gauge = Gauge::new();
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_clamps_transient_negative() {
        let g = Gauge::new();
        g.sub(4096);
        assert_eq!(g.value(), 0);
        g.add(8192);
        assert_eq!(g.value(), 4096);
    }

    #[test]
    fn test_gauge_saturates_absurd_delta() {
        let g = Gauge::new();
        g.add(usize::MAX);
        assert_eq!(g.value(), isize::MAX as usize);
    }
}
