//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent and cross-counter snapshots may transiently
//! disagree (active = allocations − deallocations can briefly be off by
//! one while a free is in flight). Diagnostic display only — never use
//! these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

use super::size_class::SizeClass;

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers always go through
/// `load()`/`get()`, which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn dec(&self) {
        self.sub(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Bytes currently mapped (or heap-allocated) for chunk backing stores,
// across every allocator instance in the process.
crate::sync::static_atomic! {
    pub static MAPPED_BYTES: Counter = Counter::new();
}

// Live thread caches across every allocator instance.
crate::sync::static_atomic! {
    pub static THREAD_CACHES: Counter = Counter::new();
}

/// Per-arena allocation counters, one lane per size class.
///
/// `active` counts are derived (allocations − deallocations) and clamped at
/// zero by [`Counter`] semantics.
pub struct ArenaMetrics {
    allocations: [Counter; SizeClass::COUNT],
    deallocations: [Counter; SizeClass::COUNT],
    pub used_bytes: Counter,
}

impl ArenaMetrics {
    pub fn new() -> Self {
        Self {
            allocations: std::array::from_fn(|_| Counter::new()),
            deallocations: std::array::from_fn(|_| Counter::new()),
            used_bytes: Counter::new(),
        }
    }

    #[inline]
    pub fn record_alloc(&self, class: SizeClass, bytes: usize) {
        self.allocations[class as usize].inc();
        self.used_bytes.add(bytes);
    }

    #[inline]
    pub fn record_free(&self, class: SizeClass, bytes: usize) {
        self.deallocations[class as usize].inc();
        self.used_bytes.sub(bytes);
    }

    pub fn snapshot(&self) -> ArenaMetricsSnapshot {
        let allocations = std::array::from_fn(|i| self.allocations[i].get());
        let deallocations = std::array::from_fn(|i| self.deallocations[i].get());
        let active =
            std::array::from_fn(|i| allocations[i].saturating_sub(deallocations[i]));
        ArenaMetricsSnapshot {
            allocations,
            deallocations,
            active,
            used_bytes: self.used_bytes.get(),
        }
    }
}

impl Default for ArenaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of one arena's counters, indexable by [`SizeClass`].
#[derive(Clone, Debug, Default)]
pub struct ArenaMetricsSnapshot {
    pub allocations: [usize; SizeClass::COUNT],
    pub deallocations: [usize; SizeClass::COUNT],
    pub active: [usize; SizeClass::COUNT],
    pub used_bytes: usize,
}

impl ArenaMetricsSnapshot {
    #[inline]
    pub fn allocations_of(&self, class: SizeClass) -> usize {
        self.allocations[class as usize]
    }

    #[inline]
    pub fn deallocations_of(&self, class: SizeClass) -> usize {
        self.deallocations[class as usize]
    }

    #[inline]
    pub fn active_of(&self, class: SizeClass) -> usize {
        self.active[class as usize]
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_below_zero() {
        let c = Counter::new();
        c.sub(10);
        assert_eq!(c.get(), 0);
        c.add(15);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_arena_metrics_active_lane() {
        let m = ArenaMetrics::new();
        m.record_alloc(SizeClass::Small, 512);
        m.record_alloc(SizeClass::Small, 512);
        m.record_free(SizeClass::Small, 512);
        let snap = m.snapshot();
        assert_eq!(snap.allocations_of(SizeClass::Small), 2);
        assert_eq!(snap.deallocations_of(SizeClass::Small), 1);
        assert_eq!(snap.active_of(SizeClass::Small), 1);
        assert_eq!(snap.used_bytes, 512);
        assert_eq!(snap.active_of(SizeClass::Normal), 0);
    }
}
