use std::ptr::NonNull;

use super::error::PoolError;
use super::size_class::SizeClasses;
use super::subpage::PoolSubpage;
use super::vm::{ChunkMem, MemoryKind};

/// Identifies one allocated region within a chunk.
///
/// Runs come straight from the buddy tree; elements additionally name a slot
/// in the leaf's subpage bitmap. An explicit sum type instead of a packed
/// word: the tag is what `free` dispatches on, and handles only ever travel
/// inside cache entries and buffers where a word of padding is irrelevant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RegionHandle {
    /// A whole page run rooted at `node` of the buddy tree.
    Run { node: u32 },
    /// One element of the subpage occupying leaf `node`.
    Elem { node: u32, bitmap_idx: u32 },
}

impl RegionHandle {
    #[inline]
    pub fn node(self) -> u32 {
        match self {
            RegionHandle::Run { node } | RegionHandle::Elem { node, .. } => node,
        }
    }
}

/// A large contiguous region managed as a complete binary tree over pages.
///
/// `memory_map[id]` holds the depth of the shallowest free descendant of
/// node `id`: equal to the node's own depth when the node is fully free,
/// `max_order + 1` when fully used, in between when partially used. A node
/// can serve a depth-`d` request iff its value is `<= d`.
///
/// All mutation happens under the owning arena's lock. The backing memory
/// outlives every region carved from it because an arena only destroys a
/// chunk once `free_bytes == chunk_size` (thread-cached regions count as
/// allocated until trimmed).
pub(crate) struct PoolChunk {
    mem: ChunkMem,
    classes: SizeClasses,
    max_order: u32,
    /// Sentinel value marking a fully used node: `max_order + 1`.
    unusable: u8,
    /// Node values, indexed by tree id (1-based; slot 0 unused).
    memory_map: Box<[u8]>,
    /// Lazily created subpages, one slot per leaf page.
    subpages: Box<[Option<PoolSubpage>]>,
    free_bytes: usize,
    /// Index of the chunk list currently holding this chunk, if any.
    /// Maintained by the arena's list machinery.
    pub list: Option<usize>,
}

impl PoolChunk {
    pub fn new(kind: MemoryKind, classes: SizeClasses, max_order: u32) -> Result<Self, PoolError> {
        let chunk_size = classes.chunk_size();
        debug_assert_eq!(chunk_size, classes.page_size() << max_order);
        let mem = ChunkMem::new(kind, chunk_size)?;

        let node_count = 1usize << (max_order + 1);
        let mut memory_map = vec![0u8; node_count].into_boxed_slice();
        for id in 1..node_count {
            memory_map[id] = id.ilog2() as u8;
        }
        let leaves = 1usize << max_order;
        let subpages = (0..leaves).map(|_| None).collect::<Vec<_>>().into_boxed_slice();

        Ok(Self {
            mem,
            classes,
            max_order,
            unusable: (max_order + 1) as u8,
            memory_map,
            subpages,
            free_bytes: chunk_size,
            list: None,
        })
    }

    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.mem.kind()
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.classes.chunk_size()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.classes.page_size()
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub fn base_ptr(&self) -> NonNull<u8> {
        self.mem.as_ptr()
    }

    /// Utilization percentage in `[0, 100]`. Rounding is biased so that the
    /// boundaries are exact: 0 only when fully free, 100 only when no byte
    /// is free (a nearly-full chunk reports 99, never 100).
    pub fn usage(&self) -> u8 {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_pct = (self.free_bytes * 100 / self.chunk_size()) as u8;
        if free_pct == 0 {
            return 99;
        }
        100 - free_pct
    }

    #[inline]
    fn value(&self, id: u32) -> u8 {
        self.memory_map[id as usize]
    }

    #[inline]
    fn set_value(&mut self, id: u32, val: u8) {
        self.memory_map[id as usize] = val;
    }

    #[inline]
    fn depth_of(id: u32) -> u32 {
        debug_assert!(id >= 1);
        id.ilog2()
    }

    /// Byte length of the run rooted at `node`.
    #[inline]
    pub fn run_length(&self, node: u32) -> usize {
        self.chunk_size() >> Self::depth_of(node)
    }

    /// Byte offset of the run rooted at `node` within the chunk.
    #[inline]
    pub fn run_offset(&self, node: u32) -> usize {
        let depth = Self::depth_of(node);
        // Strip the depth marker bit; what remains is the left-to-right rank.
        let shifted = (node ^ (1 << depth)) as usize;
        shifted * self.run_length(node)
    }

    /// Offset and granted length of an allocated region.
    pub fn region(&self, handle: RegionHandle) -> (usize, usize) {
        match handle {
            RegionHandle::Run { node } => (self.run_offset(node), self.run_length(node)),
            RegionHandle::Elem { node, bitmap_idx } => {
                let sp = self.subpages[self.subpage_slot(node)]
                    .as_ref()
                    .expect("element handle for a leaf without a subpage");
                let elem = sp.elem_size();
                (self.run_offset(node) + bitmap_idx as usize * elem, elem)
            }
        }
    }

    /// Allocate a page run of `norm_capacity` bytes (a power of two between
    /// one page and the whole chunk). Returns the tree node, or `None` when
    /// no run at the required depth is free.
    pub fn allocate_run(&mut self, norm_capacity: usize) -> Option<RegionHandle> {
        let d = self.classes.depth_for(norm_capacity);
        let node = self.allocate_node(d)?;
        self.free_bytes -= self.run_length(node);
        Some(RegionHandle::Run { node })
    }

    /// Walk the tree from the root toward depth `d`, preferring the left
    /// branch, descending only into nodes whose stored value permits a
    /// depth-`d` allocation underneath.
    fn allocate_node(&mut self, d: u32) -> Option<u32> {
        let mut id: u32 = 1;
        if u32::from(self.value(id)) > d {
            // Not even the root has a free descendant shallow enough.
            return None;
        }
        // Bit mask that becomes non-zero once `id` reaches depth `d`.
        let initial = !0u32 << d;
        let mut val = u32::from(self.value(id));
        while val < d || (id & initial) == 0 {
            id <<= 1;
            val = u32::from(self.value(id));
            if val > d {
                // Left child cannot serve the request; its buddy must.
                id ^= 1;
                val = u32::from(self.value(id));
            }
        }
        debug_assert_eq!(val, d, "walk ended on a node of the wrong depth-value");
        debug_assert_eq!(Self::depth_of(id), d);
        self.set_value(id, self.unusable);
        self.update_parents_alloc(id);
        Some(id)
    }

    fn update_parents_alloc(&mut self, mut id: u32) {
        while id > 1 {
            let parent = id >> 1;
            let val = self.value(id).min(self.value(id ^ 1));
            self.set_value(parent, val);
            id = parent;
        }
    }

    /// Return a run to the tree, merging buddies back into larger free runs
    /// as both halves become free.
    pub fn free_run(&mut self, node: u32) -> usize {
        debug_assert_eq!(
            self.value(node),
            self.unusable,
            "freeing run {node} that is not fully allocated"
        );
        debug_assert!(
            self.subpages[self.subpage_slot_checked(node)].is_none()
                || Self::depth_of(node) != self.max_order,
            "freeing a leaf still carrying a subpage via the run path"
        );
        let depth = Self::depth_of(node);
        self.set_value(node, depth as u8);
        self.update_parents_free(node);
        let len = self.run_length(node);
        self.free_bytes += len;
        len
    }

    fn update_parents_free(&mut self, mut id: u32) {
        let mut log_child = Self::depth_of(id) as u8;
        while id > 1 {
            let parent = id >> 1;
            let val1 = self.value(id);
            let val2 = self.value(id ^ 1);
            if val1 == log_child && val2 == log_child {
                // Both buddies fully free: the parent is a free run again.
                self.set_value(parent, log_child - 1);
            } else {
                self.set_value(parent, val1.min(val2));
            }
            log_child -= 1;
            id = parent;
        }
    }

    // ------------------------------------------------------------------
    // Subpages
    // ------------------------------------------------------------------

    #[inline]
    fn subpage_slot(&self, leaf: u32) -> usize {
        debug_assert_eq!(Self::depth_of(leaf), self.max_order, "not a leaf node");
        (leaf as usize) ^ (1 << self.max_order)
    }

    // Like subpage_slot but tolerant of non-leaf ids (used in debug checks).
    fn subpage_slot_checked(&self, node: u32) -> usize {
        if Self::depth_of(node) == self.max_order {
            (node as usize) ^ (1 << self.max_order)
        } else {
            0
        }
    }

    /// Split a fresh leaf page into `elem_size` elements. Returns the leaf
    /// node, or `None` when no leaf is free.
    pub fn create_subpage(&mut self, elem_size: usize) -> Option<u32> {
        let leaf = self.allocate_node(self.max_order)?;
        self.free_bytes -= self.page_size();
        let slot = self.subpage_slot(leaf);
        debug_assert!(self.subpages[slot].is_none(), "leaf already split");
        self.subpages[slot] = Some(PoolSubpage::new(self.page_size(), elem_size));
        Some(leaf)
    }

    pub fn subpage(&self, leaf: u32) -> &PoolSubpage {
        self.subpages[self.subpage_slot(leaf)]
            .as_ref()
            .expect("no subpage at leaf")
    }

    pub fn subpage_mut(&mut self, leaf: u32) -> &mut PoolSubpage {
        let slot = self.subpage_slot(leaf);
        self.subpages[slot].as_mut().expect("no subpage at leaf")
    }

    /// Allocate one element from the subpage at `leaf`.
    pub fn allocate_elem(&mut self, leaf: u32) -> Option<RegionHandle> {
        let bitmap_idx = self.subpage_mut(leaf).allocate()?;
        Some(RegionHandle::Elem {
            node: leaf,
            bitmap_idx,
        })
    }

    /// Tear down the subpage at `leaf` and return its page to the tree.
    /// Caller must have established that the subpage is fully free.
    pub fn destroy_subpage(&mut self, leaf: u32) {
        let slot = self.subpage_slot(leaf);
        let sp = self.subpages[slot].take().expect("no subpage at leaf");
        debug_assert!(sp.is_free(), "destroying a subpage with live elements");
        self.free_run(leaf);
    }

    /// True when every byte of the chunk is free again.
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.free_bytes == self.chunk_size()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::size_class::SizeClasses;

    const PAGE: usize = 8192;
    const ORDER: u32 = 4; // 16 pages, 128 KiB chunks keep tests fast

    fn chunk() -> PoolChunk {
        let classes = SizeClasses::new(PAGE, PAGE << ORDER);
        PoolChunk::new(MemoryKind::Heap, classes, ORDER).unwrap()
    }

    #[test]
    fn test_fresh_chunk_is_fully_free() {
        let c = chunk();
        assert_eq!(c.usage(), 0);
        assert!(c.is_unused());
        assert_eq!(c.free_bytes(), PAGE << ORDER);
    }

    #[test]
    fn test_single_page_runs_fill_the_chunk() {
        let mut c = chunk();
        let mut handles = Vec::new();
        let mut offsets = Vec::new();
        for _ in 0..(1 << ORDER) {
            let h = c.allocate_run(PAGE).unwrap();
            let (off, len) = c.region(h);
            assert_eq!(len, PAGE);
            assert!(!offsets.contains(&off));
            offsets.push(off);
            handles.push(h);
        }
        assert_eq!(c.usage(), 100);
        assert!(c.allocate_run(PAGE).is_none());

        for h in handles {
            match h {
                RegionHandle::Run { node } => {
                    c.free_run(node);
                }
                RegionHandle::Elem { .. } => unreachable!(),
            }
        }
        assert_eq!(c.usage(), 0);
        assert!(c.is_unused());
    }

    #[test]
    fn test_tree_returns_to_pristine_state() {
        // After alloc/free sequences netting to nothing outstanding, the
        // whole chunk must again be allocatable as a single run.
        let mut c = chunk();
        let a = c.allocate_run(PAGE).unwrap();
        let b = c.allocate_run(4 * PAGE).unwrap();
        let d = c.allocate_run(2 * PAGE).unwrap();
        for h in [b, a, d] {
            let RegionHandle::Run { node } = h else { unreachable!() };
            c.free_run(node);
        }
        assert!(c.is_unused());
        let whole = c.allocate_run(PAGE << ORDER).unwrap();
        assert_eq!(c.region(whole).1, PAGE << ORDER);
        assert_eq!(c.usage(), 100);
    }

    #[test]
    fn test_buddy_merge_is_required_for_large_run() {
        let mut c = chunk();
        // Two adjacent pages pin their shared parent.
        let a = c.allocate_run(PAGE).unwrap();
        let b = c.allocate_run(PAGE).unwrap();
        // Half-chunk run still fits in the other half.
        assert!(c.allocate_run((PAGE << ORDER) / 2).is_some());
        // But a full-chunk run cannot exist while anything is outstanding.
        assert!(c.allocate_run(PAGE << ORDER).is_none());
        let (RegionHandle::Run { node: na }, RegionHandle::Run { node: nb }) = (a, b) else {
            unreachable!()
        };
        c.free_run(na);
        c.free_run(nb);
    }

    #[test]
    fn test_left_branch_preferred() {
        let mut c = chunk();
        let h = c.allocate_run(PAGE).unwrap();
        assert_eq!(c.region(h).0, 0, "first allocation must sit at offset 0");
        let h2 = c.allocate_run(PAGE).unwrap();
        assert_eq!(c.region(h2).0, PAGE);
    }

    #[test]
    fn test_usage_rounding_at_boundaries() {
        let mut c = chunk();
        let h = c.allocate_run(PAGE).unwrap();
        let u = c.usage();
        assert!(u > 0 && u < 100, "one page of sixteen gives usage {u}");
        let RegionHandle::Run { node } = h else { unreachable!() };
        c.free_run(node);
        assert_eq!(c.usage(), 0);
    }

    #[test]
    fn test_subpage_lifecycle() {
        let mut c = chunk();
        let leaf = c.create_subpage(512).unwrap();
        assert_eq!(c.free_bytes(), (PAGE << ORDER) - PAGE);

        let h = c.allocate_elem(leaf).unwrap();
        let (off, len) = c.region(h);
        assert_eq!(len, 512);
        assert!(off < PAGE, "first subpage element lives in the first page");

        let RegionHandle::Elem { node, bitmap_idx } = h else { unreachable!() };
        c.subpage_mut(node).free(bitmap_idx);
        assert!(c.subpage(node).is_free());
        c.destroy_subpage(node);
        assert!(c.is_unused());
    }

    #[test]
    fn test_elem_offsets_are_disjoint() {
        let mut c = chunk();
        let leaf = c.create_subpage(1024).unwrap();
        let mut offsets = Vec::new();
        while let Some(h) = c.allocate_elem(leaf) {
            let (off, len) = c.region(h);
            assert_eq!(len, 1024);
            assert!(offsets.iter().all(|&o| o != off));
            offsets.push(off);
        }
        assert_eq!(offsets.len(), PAGE / 1024);
    }

    #[test]
    fn test_whole_chunk_run_at_boundary() {
        let mut c = chunk();
        let h = c.allocate_run(PAGE << ORDER).unwrap();
        assert_eq!(c.usage(), 100);
        assert_eq!(c.region(h), (0, PAGE << ORDER));
        let RegionHandle::Run { node } = h else { unreachable!() };
        assert_eq!(node, 1, "whole-chunk run is the tree root");
        c.free_run(node);
        assert_eq!(c.usage(), 0);
    }
}
