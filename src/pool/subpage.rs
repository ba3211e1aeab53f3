use fixedbitset::FixedBitSet;

/// One chunk leaf page sliced into `page_size / elem_size` equal elements
/// for tiny/small allocations. A set bit means the element is in use.
///
/// The subpage itself does no pointer math; the owning chunk translates a
/// `(leaf node, bitmap index)` pair into a byte offset. Pool membership
/// (linking into the arena's per-size-class pool) is tracked by the arena.
pub(crate) struct PoolSubpage {
    elem_size: usize,
    max_elems: u32,
    num_avail: u32,
    /// Allocation cursor: index of the most recently freed element, used as
    /// a first guess before scanning. u32::MAX means "no hint".
    next_avail: u32,
    bitmap: FixedBitSet,
}

impl PoolSubpage {
    pub fn new(page_size: usize, elem_size: usize) -> Self {
        debug_assert!(elem_size >= 16 && elem_size <= page_size);
        debug_assert!(page_size.is_multiple_of(elem_size) || !elem_size.is_power_of_two());
        let max_elems = (page_size / elem_size) as u32;
        debug_assert!(max_elems >= 1);
        Self {
            elem_size,
            max_elems,
            num_avail: max_elems,
            next_avail: 0,
            bitmap: FixedBitSet::with_capacity(max_elems as usize),
        }
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[inline]
    pub fn max_elems(&self) -> u32 {
        self.max_elems
    }

    #[inline]
    pub fn num_avail(&self) -> u32 {
        self.num_avail
    }

    /// True once every element has been handed out.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_avail == 0
    }

    /// True when no element is outstanding.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.num_avail == self.max_elems
    }

    /// Claim one free element, returning its bitmap index.
    pub fn allocate(&mut self) -> Option<u32> {
        if self.num_avail == 0 {
            return None;
        }
        let idx = self.find_next_avail()?;
        debug_assert!(!self.bitmap.contains(idx as usize));
        self.bitmap.insert(idx as usize);
        self.num_avail -= 1;
        // Elements are usually freed and re-claimed in bursts of the same
        // size; pointing the cursor just past the claimed slot keeps the
        // scan short.
        self.next_avail = idx + 1;
        Some(idx)
    }

    /// Return one element. The caller decides (via [`is_free`]) whether the
    /// page goes back to the buddy tree.
    pub fn free(&mut self, bitmap_idx: u32) {
        debug_assert!(bitmap_idx < self.max_elems, "bitmap index out of range");
        debug_assert!(
            self.bitmap.contains(bitmap_idx as usize),
            "double free of subpage element {bitmap_idx}"
        );
        self.bitmap.set(bitmap_idx as usize, false);
        self.num_avail += 1;
        self.next_avail = bitmap_idx;
    }

    fn find_next_avail(&self) -> Option<u32> {
        let start = if self.next_avail < self.max_elems {
            self.next_avail
        } else {
            0
        };
        // Scan from the hint, then wrap. Bounded by the bitmap length, and
        // num_avail > 0 guarantees a hit.
        for idx in (start..self.max_elems).chain(0..start) {
            if !self.bitmap.contains(idx as usize) {
                return Some(idx);
            }
        }
        debug_assert!(false, "num_avail > 0 but no clear bit found");
        None
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_all_then_full() {
        let mut sp = PoolSubpage::new(8192, 1024);
        assert_eq!(sp.max_elems(), 8);
        let mut seen = Vec::new();
        for _ in 0..8 {
            let idx = sp.allocate().unwrap();
            assert!(!seen.contains(&idx));
            seen.push(idx);
        }
        assert!(sp.is_full());
        assert!(sp.allocate().is_none());
    }

    #[test]
    fn test_free_reopens_slot() {
        let mut sp = PoolSubpage::new(8192, 2048);
        let a = sp.allocate().unwrap();
        let _b = sp.allocate().unwrap();
        sp.free(a);
        assert_eq!(sp.num_avail(), 3);
        // Freed slot is preferred by the cursor.
        assert_eq!(sp.allocate().unwrap(), a);
    }

    #[test]
    fn test_becomes_free_after_all_returned() {
        let mut sp = PoolSubpage::new(8192, 16);
        assert_eq!(sp.max_elems(), 512);
        let indices: Vec<u32> = (0..512).map(|_| sp.allocate().unwrap()).collect();
        assert!(sp.is_full());
        for idx in indices {
            sp.free(idx);
        }
        assert!(sp.is_free());
    }

    #[test]
    #[should_panic(expected = "double free")]
    #[cfg(debug_assertions)]
    fn test_double_free_is_caught_in_debug() {
        let mut sp = PoolSubpage::new(8192, 4096);
        let idx = sp.allocate().unwrap();
        sp.free(idx);
        sp.free(idx);
    }

    #[test]
    fn test_tiny_elem_sizes_fill_page() {
        // 496-byte tiny class does not divide the page evenly; the trailing
        // remainder is simply unused.
        let mut sp = PoolSubpage::new(8192, 496);
        assert_eq!(sp.max_elems(), 16);
        for _ in 0..16 {
            sp.allocate().unwrap();
        }
        assert!(sp.is_full());
    }
}
