//! Size classing: maps a requested capacity to the normalized capacity the
//! pool actually hands out, and to the allocation path that serves it.
//!
//! Tiny requests (< 512 B) are stepped in 16-byte quanta and served from
//! subpages. Small requests (512 B up to the page size) round to the next
//! power of two, also subpage-served. Normal requests round to the next
//! power of two and consume page runs from the buddy tree. Huge requests
//! exceed the chunk size and bypass pooling entirely.

/// Smallest capacity the pool hands out. A zero-byte request maps here.
pub const MIN_TINY: usize = 16;

/// Exclusive upper bound of the tiny range.
pub const TINY_LIMIT: usize = 512;

/// Quantum of tiny size steps.
const TINY_STEP: usize = 16;

/// Number of tiny size indices (`norm >> 4` for norm in 16..512; index 0 is
/// never produced but keeps the indexing branch-free).
pub const N_TINY: usize = TINY_LIMIT / TINY_STEP;

/// Largest capacity a buffer may ever reach, shared by normalization and
/// the growth policy.
pub const MAX_BUFFER_CAPACITY: usize = i32::MAX as usize;

/// Allocation category for one normalized capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SizeClass {
    Tiny = 0,
    Small = 1,
    Normal = 2,
    Huge = 3,
}

impl SizeClass {
    pub const COUNT: usize = 4;
}

/// Per-allocator size-class calculator. Pure and total: no state beyond the
/// page/chunk geometry fixed at construction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SizeClasses {
    page_size: usize,
    page_shift: u32,
    chunk_size: usize,
}

impl SizeClasses {
    pub fn new(page_size: usize, chunk_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two() && page_size >= TINY_LIMIT * 2);
        debug_assert!(chunk_size.is_power_of_two() && chunk_size >= page_size);
        Self {
            page_size,
            page_shift: page_size.trailing_zeros(),
            chunk_size,
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of small size indices (powers of two in `[512, page_size)`).
    #[inline]
    pub fn n_small(&self) -> usize {
        (self.page_shift - TINY_LIMIT.trailing_zeros()) as usize
    }

    /// Round a requested capacity up to the nearest size the pool can serve.
    ///
    /// Guarantees `normalize(req) >= req` and idempotence. Huge capacities
    /// pass through unchanged — they are allocated individually and any
    /// rounding would only waste memory.
    #[inline]
    pub fn normalize(&self, req_capacity: usize) -> usize {
        if req_capacity > self.chunk_size {
            return req_capacity;
        }
        if req_capacity >= TINY_LIMIT {
            // Power-of-two steps; cannot overflow because req <= chunk_size.
            return req_capacity.next_power_of_two();
        }
        // Tiny: 16-byte quanta, floor at MIN_TINY (covers req == 0).
        ((req_capacity + TINY_STEP - 1) & !(TINY_STEP - 1)).max(MIN_TINY)
    }

    /// Classify a normalized capacity.
    #[inline]
    pub fn class_of(&self, norm_capacity: usize) -> SizeClass {
        if norm_capacity > self.chunk_size {
            SizeClass::Huge
        } else if norm_capacity >= self.page_size {
            SizeClass::Normal
        } else if norm_capacity >= TINY_LIMIT {
            SizeClass::Small
        } else {
            SizeClass::Tiny
        }
    }

    /// Subpage-pool index for a tiny normalized capacity.
    #[inline]
    pub fn tiny_index(norm_capacity: usize) -> usize {
        debug_assert!(norm_capacity >= MIN_TINY && norm_capacity < TINY_LIMIT);
        debug_assert!(norm_capacity.is_multiple_of(TINY_STEP));
        norm_capacity >> 4
    }

    /// Subpage-pool index for a small normalized capacity.
    #[inline]
    pub fn small_index(norm_capacity: usize) -> usize {
        debug_assert!(norm_capacity >= TINY_LIMIT && norm_capacity.is_power_of_two());
        (norm_capacity.trailing_zeros() - TINY_LIMIT.trailing_zeros()) as usize
    }

    /// Cache-lane index for a normal capacity: 0 for one page, 1 for two
    /// pages, and so on in power-of-two steps.
    #[inline]
    pub fn normal_index(&self, norm_capacity: usize) -> usize {
        debug_assert!(norm_capacity >= self.page_size && norm_capacity.is_power_of_two());
        (norm_capacity.trailing_zeros() - self.page_shift) as usize
    }

    /// Buddy-tree depth whose runs have exactly `norm_capacity` bytes.
    #[inline]
    pub fn depth_for(&self, norm_capacity: usize) -> u32 {
        debug_assert!(norm_capacity.is_power_of_two() && norm_capacity <= self.chunk_size);
        self.chunk_size.trailing_zeros() - norm_capacity.trailing_zeros()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn classes() -> SizeClasses {
        SizeClasses::new(8192, 16 * 1024 * 1024)
    }

    #[test]
    fn test_zero_request_maps_to_min_tiny() {
        let sc = classes();
        assert_eq!(sc.normalize(0), MIN_TINY);
        assert_eq!(sc.class_of(MIN_TINY), SizeClass::Tiny);
    }

    #[test]
    fn test_tiny_steps_by_sixteen() {
        let sc = classes();
        assert_eq!(sc.normalize(1), 16);
        assert_eq!(sc.normalize(16), 16);
        assert_eq!(sc.normalize(17), 32);
        assert_eq!(sc.normalize(100), 112);
        assert_eq!(sc.normalize(496), 496);
        assert_eq!(sc.normalize(497), 512);
    }

    #[test]
    fn test_class_boundaries() {
        let sc = classes();
        assert_eq!(sc.class_of(sc.normalize(511)), SizeClass::Small);
        assert_eq!(sc.class_of(sc.normalize(512)), SizeClass::Small);
        assert_eq!(sc.class_of(sc.normalize(8191)), SizeClass::Normal);
        assert_eq!(sc.class_of(sc.normalize(8192)), SizeClass::Normal);
        assert_eq!(sc.class_of(sc.normalize(16 * 1024 * 1024)), SizeClass::Normal);
        assert_eq!(
            sc.class_of(sc.normalize(16 * 1024 * 1024 + 1)),
            SizeClass::Huge
        );
    }

    #[test]
    fn test_round_trip_properties() {
        let sc = classes();
        // normalize >= req and idempotent, across the whole pooled range.
        let mut req = 0usize;
        while req <= sc.chunk_size() {
            let norm = sc.normalize(req);
            assert!(norm >= req, "normalize({req}) = {norm} shrank");
            assert_eq!(sc.normalize(norm), norm, "normalize not idempotent at {req}");
            assert_eq!(sc.class_of(norm), sc.class_of(sc.normalize(norm)));
            // Stride through interesting neighbourhoods instead of all 16M.
            req = if req < 4096 { req + 1 } else { req * 2 - req / 3 };
        }
    }

    #[test]
    fn test_indices() {
        let sc = classes();
        assert_eq!(SizeClasses::tiny_index(16), 1);
        assert_eq!(SizeClasses::tiny_index(496), 31);
        assert_eq!(SizeClasses::small_index(512), 0);
        assert_eq!(SizeClasses::small_index(4096), 3);
        assert_eq!(sc.n_small(), 4);
        assert_eq!(sc.normal_index(8192), 0);
        assert_eq!(sc.normal_index(32768), 2);
    }

    #[test]
    fn test_depth_for_runs() {
        let sc = classes();
        // Whole chunk is depth 0, single page is the deepest run level.
        assert_eq!(sc.depth_for(16 * 1024 * 1024), 0);
        assert_eq!(sc.depth_for(8 * 1024 * 1024), 1);
        assert_eq!(sc.depth_for(8192), 11);
    }
}
