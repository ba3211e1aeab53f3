//! One lock domain of the pool.
//!
//! An arena owns a slab of chunks, the utilization-bucketed chunk lists
//! threading through them, and per-size pools of partially filled subpage
//! leaves. Threads are striped across arenas round-robin by the allocator,
//! so contention on any single arena lock stays low even without a thread
//! cache.

use std::ptr::NonNull;

use crate::sync::Mutex;

use super::chunk::{PoolChunk, RegionHandle};
use super::chunk_list::{self, ChunkId, ChunkList, ChunkSlab, ListGrant, ListRequest};
use super::error::PoolError;
use super::metrics::ArenaMetrics;
use super::size_class::{N_TINY, SizeClass, SizeClasses};
use super::vm::{ChunkMem, MemoryKind};

/// An allocated region, resolved down to its pointer.
///
/// Carries everything a buffer or a cache entry needs without touching the
/// arena lock again. The pointer stays valid for as long as the region is
/// allocated: a chunk is only destroyed once every one of its bytes is
/// free, and a region parked in a thread cache still counts as allocated.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolRegion {
    pub chunk_id: ChunkId,
    pub handle: RegionHandle,
    pub ptr: NonNull<u8>,
    /// Granted bytes: the normalized run capacity, or the element size.
    pub length: usize,
}

// Safety: a PoolRegion is an owning ticket for its bytes; exactly one
// holder (buffer, cache slot, or free path) has it at any time.
unsafe impl Send for PoolRegion {}

pub(crate) struct Arena {
    kind: MemoryKind,
    classes: SizeClasses,
    max_order: u32,
    pub metrics: ArenaMetrics,
    inner: Mutex<ArenaInner>,
}

struct ArenaInner {
    chunks: ChunkSlab,
    /// qinit, q000, q025, q050, q075, q100 — scanned in that order.
    lists: Vec<ChunkList>,
    /// Leaves with free tiny elements, one pool per tiny index.
    tiny_pools: Vec<Vec<(ChunkId, u32)>>,
    /// Leaves with free small elements, one pool per small index.
    small_pools: Vec<Vec<(ChunkId, u32)>>,
}

impl Arena {
    pub fn new(kind: MemoryKind, page_size: usize, max_order: u32) -> Self {
        let chunk_size = page_size << max_order;
        let classes = SizeClasses::new(page_size, chunk_size);

        let mut lists = vec![
            ChunkList::new(i32::MIN, 25, chunk_size),
            ChunkList::new(1, 50, chunk_size),
            ChunkList::new(25, 75, chunk_size),
            ChunkList::new(50, 100, chunk_size),
            ChunkList::new(75, 100, chunk_size),
            ChunkList::new(100, i32::MAX, chunk_size),
        ];
        for i in 0..5 {
            lists[i].next = Some(i + 1);
        }
        // The init list is its own floor: chunks that empty out there are
        // kept for reuse. Everywhere else a fully freed chunk sinks past
        // q000 and is destroyed.
        lists[0].prev = Some(0);
        lists[1].prev = None;
        for i in 2..6 {
            lists[i].prev = Some(i - 1);
        }

        Self {
            kind,
            classes,
            max_order,
            metrics: ArenaMetrics::new(),
            inner: Mutex::new(ArenaInner {
                chunks: ChunkSlab::new(),
                lists,
                tiny_pools: (0..N_TINY).map(|_| Vec::new()).collect(),
                small_pools: (0..classes.n_small()).map(|_| Vec::new()).collect(),
            }),
        }
    }

    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    #[inline]
    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Size class of an already-granted region length.
    #[inline]
    pub fn class_of(&self, length: usize) -> SizeClass {
        self.classes.class_of(length)
    }

    /// Allocate a pooled region of `norm` bytes (already normalized, and not
    /// Huge — oversized requests bypass the pool entirely).
    pub fn allocate(&self, norm: usize) -> Result<PoolRegion, PoolError> {
        let class = self.classes.class_of(norm);
        debug_assert_ne!(class, SizeClass::Huge, "huge capacity on the pooled path");

        let mut inner = self.inner.lock().unwrap();
        let (chunk_id, handle) = match class {
            SizeClass::Tiny | SizeClass::Small => inner.allocate_elem(
                self.kind,
                self.classes,
                self.max_order,
                class,
                norm,
            )?,
            _ => inner.allocate_run(self.kind, self.classes, self.max_order, norm)?,
        };
        let region = inner.resolve(chunk_id, handle);
        drop(inner);

        self.metrics.record_alloc(class, region.length);
        Ok(region)
    }

    /// Return a region to the pool.
    pub fn free(&self, region: PoolRegion) {
        let class = self.classes.class_of(region.length);
        let mut inner = self.inner.lock().unwrap();
        match region.handle {
            RegionHandle::Run { node } => {
                inner.chunks.get_mut(region.chunk_id).free_run(node);
                inner.settle(region.chunk_id);
            }
            RegionHandle::Elem { node, bitmap_idx } => {
                inner.free_elem(self.classes, class, region.chunk_id, node, bitmap_idx);
            }
        }
        drop(inner);
        self.metrics.record_free(class, region.length);
    }

    /// Allocate an unpooled backing store for a huge buffer. Tracked in the
    /// arena's metrics but never resident in any chunk list.
    pub fn allocate_huge(&self, size: usize) -> Result<ChunkMem, PoolError> {
        let mem = ChunkMem::new(self.kind, size)?;
        self.metrics.record_alloc(SizeClass::Huge, size);
        Ok(mem)
    }

    /// Account for a huge backing store being unmapped (the `ChunkMem` drop
    /// does the actual release).
    pub fn free_huge(&self, size: usize) {
        self.metrics.record_free(SizeClass::Huge, size);
    }

    /// Number of live chunks, for diagnostics.
    pub fn chunk_count(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    /// Free bytes across all live chunks, for diagnostics.
    pub fn free_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .ids()
            .map(|id| inner.chunks.get(id).free_bytes())
            .sum()
    }

    /// Chunk occupancy of each utilization list, for diagnostics.
    pub fn list_lengths(&self) -> [usize; 6] {
        let inner = self.inner.lock().unwrap();
        std::array::from_fn(|i| inner.lists[i].len())
    }
}

impl ArenaInner {
    /// Resolve a granted handle to its pointer while the lock is held.
    fn resolve(&self, chunk_id: ChunkId, handle: RegionHandle) -> PoolRegion {
        let chunk = self.chunks.get(chunk_id);
        let (offset, length) = chunk.region(handle);
        // Safety: offset + length lie within the chunk's mapping.
        let ptr = unsafe { chunk.base_ptr().add(offset) };
        PoolRegion {
            chunk_id,
            handle,
            ptr,
            length,
        }
    }

    /// Serve `request` from the existing chunks, scanning the lists from
    /// least utilized to most.
    fn list_allocate(&mut self, request: ListRequest) -> Option<(ChunkId, ListGrant)> {
        for idx in 0..self.lists.len() {
            if let Some(granted) =
                chunk_list::allocate(&mut self.lists, &mut self.chunks, idx, request)
            {
                return Some(granted);
            }
        }
        None
    }

    /// Serve `request`, growing the arena by one chunk when no resident
    /// chunk can.
    fn list_allocate_or_grow(
        &mut self,
        kind: MemoryKind,
        classes: SizeClasses,
        max_order: u32,
        request: ListRequest,
    ) -> Result<(ChunkId, ListGrant), PoolError> {
        if let Some(granted) = self.list_allocate(request) {
            return Ok(granted);
        }
        let mut chunk = PoolChunk::new(kind, classes, max_order)?;
        let grant = match request {
            ListRequest::Run(norm) => chunk
                .allocate_run(norm)
                .map(ListGrant::Run)
                .expect("fresh chunk rejected a run no larger than itself"),
            ListRequest::Subpage { elem_size } => chunk
                .create_subpage(elem_size)
                .map(ListGrant::SubpageLeaf)
                .expect("fresh chunk rejected a subpage"),
        };
        let id = self.chunks.insert(chunk);
        chunk_list::add(&mut self.lists, &mut self.chunks, 0, id);
        Ok((id, grant))
    }

    fn allocate_run(
        &mut self,
        kind: MemoryKind,
        classes: SizeClasses,
        max_order: u32,
        norm: usize,
    ) -> Result<(ChunkId, RegionHandle), PoolError> {
        let (id, grant) =
            self.list_allocate_or_grow(kind, classes, max_order, ListRequest::Run(norm))?;
        let ListGrant::Run(handle) = grant else {
            unreachable!("run request granted a subpage")
        };
        Ok((id, handle))
    }

    fn allocate_elem(
        &mut self,
        kind: MemoryKind,
        classes: SizeClasses,
        max_order: u32,
        class: SizeClass,
        elem_size: usize,
    ) -> Result<(ChunkId, RegionHandle), PoolError> {
        let pool_idx = Self::pool_index(class, elem_size);

        // Fast path: a leaf already split to this size with elements left.
        if let Some(&(cid, leaf)) = self.pool(class, pool_idx).last() {
            let chunk = self.chunks.get_mut(cid);
            let handle = chunk
                .allocate_elem(leaf)
                .expect("pooled subpage had no free element");
            if chunk.subpage(leaf).is_full() {
                self.pool_mut(class, pool_idx).pop();
            }
            return Ok((cid, handle));
        }

        // Split a fresh leaf and register it.
        let (cid, grant) = self.list_allocate_or_grow(
            kind,
            classes,
            max_order,
            ListRequest::Subpage { elem_size },
        )?;
        let ListGrant::SubpageLeaf(leaf) = grant else {
            unreachable!("subpage request granted a run")
        };
        let chunk = self.chunks.get_mut(cid);
        let handle = chunk
            .allocate_elem(leaf)
            .expect("fresh subpage had no free element");
        if !chunk.subpage(leaf).is_full() {
            self.pool_mut(class, pool_idx).push((cid, leaf));
        }
        Ok((cid, handle))
    }

    fn free_elem(
        &mut self,
        classes: SizeClasses,
        class: SizeClass,
        chunk_id: ChunkId,
        leaf: u32,
        bitmap_idx: u32,
    ) {
        let chunk = self.chunks.get_mut(chunk_id);
        let sp = chunk.subpage_mut(leaf);
        let elem_size = sp.elem_size();
        let was_full = sp.is_full();
        sp.free(bitmap_idx);
        let now_free = sp.is_free();

        debug_assert_eq!(classes.class_of(elem_size), class);
        let pool_idx = Self::pool_index(class, elem_size);
        // A subpage sits in its pool exactly while it has free elements.
        let in_pool = !was_full;

        if now_free {
            let others = self
                .pool(class, pool_idx)
                .iter()
                .any(|&(c, l)| c != chunk_id || l != leaf);
            if others {
                // Another leaf of this size can serve future requests;
                // give this page back to the buddy tree.
                if in_pool {
                    self.pool_mut(class, pool_idx)
                        .retain(|&(c, l)| c != chunk_id || l != leaf);
                }
                self.chunks.get_mut(chunk_id).destroy_subpage(leaf);
                self.settle(chunk_id);
            } else if !in_pool {
                // Keep the last subpage of this size alive so a hot
                // alloc/free cycle at one size does not thrash the tree.
                self.pool_mut(class, pool_idx).push((chunk_id, leaf));
            }
        } else if was_full {
            self.pool_mut(class, pool_idx).push((chunk_id, leaf));
        }
    }

    /// Re-bucket a chunk after bytes came back; destroy it when it sinks
    /// past the floor.
    fn settle(&mut self, chunk_id: ChunkId) {
        if !chunk_list::settle_after_free(&mut self.lists, &mut self.chunks, chunk_id) {
            let chunk = self.chunks.remove(chunk_id);
            debug_assert!(chunk.is_unused());
            drop(chunk);
        }
    }

    #[inline]
    fn pool_index(class: SizeClass, elem_size: usize) -> usize {
        match class {
            SizeClass::Tiny => SizeClasses::tiny_index(elem_size),
            SizeClass::Small => SizeClasses::small_index(elem_size),
            _ => unreachable!("subpage pool for a run class"),
        }
    }

    #[inline]
    fn pool(&self, class: SizeClass, idx: usize) -> &Vec<(ChunkId, u32)> {
        match class {
            SizeClass::Tiny => &self.tiny_pools[idx],
            _ => &self.small_pools[idx],
        }
    }

    #[inline]
    fn pool_mut(&mut self, class: SizeClass, idx: usize) -> &mut Vec<(ChunkId, u32)> {
        match class {
            SizeClass::Tiny => &mut self.tiny_pools[idx],
            _ => &mut self.small_pools[idx],
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const PAGE: usize = 8192;
    const ORDER: u32 = 4; // 128 KiB chunks keep tests fast

    fn arena() -> Arena {
        Arena::new(MemoryKind::Heap, PAGE, ORDER)
    }

    #[test]
    fn test_first_allocation_creates_one_chunk() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = arena();
        assert_eq!(a.chunk_count(), 0);
        let norm = a.classes().normalize(100);
        assert_eq!(norm, 112);
        let r = a.allocate(norm).unwrap();
        assert_eq!(r.length, 112);
        assert_eq!(a.chunk_count(), 1);
        a.free(r);
    }

    #[test]
    fn test_tiny_allocations_share_a_subpage() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = arena();
        let r1 = a.allocate(64).unwrap();
        let r2 = a.allocate(64).unwrap();
        assert_eq!(r1.chunk_id, r2.chunk_id);
        assert_eq!(r1.handle.node(), r2.handle.node());
        assert_ne!(r1.ptr, r2.ptr);
        // One split page, not two.
        let snap = a.metrics.snapshot();
        assert_eq!(snap.active_of(SizeClass::Tiny), 2);
        a.free(r1);
        a.free(r2);
    }

    #[test]
    fn test_run_allocation_and_reuse() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = arena();
        let r1 = a.allocate(PAGE).unwrap();
        let p1 = r1.ptr;
        a.free(r1);
        // The chunk stayed resident (init list), so the next run lands on
        // the same page.
        assert_eq!(a.chunk_count(), 1);
        let r2 = a.allocate(PAGE).unwrap();
        assert_eq!(r2.ptr, p1);
        a.free(r2);
    }

    #[test]
    fn test_chunk_destroyed_after_leaving_floor_list() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = arena();
        // Push the chunk out of the init list by filling more than 25%.
        let regions: Vec<_> = (0..6).map(|_| a.allocate(PAGE).unwrap()).collect();
        assert_eq!(a.chunk_count(), 1);
        for r in regions {
            a.free(r);
        }
        // Fully freed from q000: destroyed.
        assert_eq!(a.chunk_count(), 0);
    }

    #[test]
    fn test_last_subpage_survives_full_free() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = arena();
        let r = a.allocate(32).unwrap();
        let leaf = r.handle.node();
        a.free(r);
        // The page keeps its subpage; the next 32-byte request reuses it.
        let r2 = a.allocate(32).unwrap();
        assert_eq!(r2.handle.node(), leaf);
        a.free(r2);
    }

    #[test]
    fn test_second_chunk_when_first_is_exhausted() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = arena();
        let chunk_size = PAGE << ORDER;
        let r1 = a.allocate(chunk_size).unwrap();
        assert_eq!(a.chunk_count(), 1);
        let r2 = a.allocate(chunk_size).unwrap();
        assert_eq!(a.chunk_count(), 2);
        assert_ne!(r1.chunk_id, r2.chunk_id);
        a.free(r1);
        a.free(r2);
        assert_eq!(a.chunk_count(), 0);
    }

    #[test]
    fn test_metrics_track_used_bytes() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = arena();
        let r = a.allocate(PAGE).unwrap();
        assert_eq!(a.metrics.snapshot().used_bytes, PAGE);
        a.free(r);
        assert_eq!(a.metrics.snapshot().used_bytes, 0);
    }

    #[test]
    fn test_huge_bypasses_chunks() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = arena();
        let size = (PAGE << ORDER) + 1;
        let mem = a.allocate_huge(size).unwrap();
        assert_eq!(a.chunk_count(), 0);
        assert_eq!(a.metrics.snapshot().active_of(SizeClass::Huge), 1);
        let len = mem.len();
        drop(mem);
        a.free_huge(len);
        assert_eq!(a.metrics.snapshot().active_of(SizeClass::Huge), 0);
    }
}
