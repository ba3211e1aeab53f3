//! Per-thread recycling of freed regions.
//!
//! A cache keeps small fixed-capacity queues of freed regions, one lane per
//! (memory kind, size index). The owning thread pops from its lanes on
//! allocation without touching any arena lock. Pushes come from whichever
//! thread drops the last reference to a buffer, which is why the lanes are
//! ring queues rather than plain vectors: buffers carry a `Weak` back to
//! the cache of the thread that allocated them.
//!
//! Every `cache_trim_interval` allocations the cache trims each lane down
//! to the demand it actually saw, returning the excess to the arenas, so a
//! burst of frees does not pin chunk space forever. The same sweep runs in
//! full when the owning thread exits.

use crate::sync::Arc;
use crate::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::arena::{Arena, PoolRegion};
use super::config::PoolConfig;
use super::metrics;
use super::queue::BoundedQueue;
use super::size_class::{N_TINY, SizeClass, SizeClasses};
use super::vm::MemoryKind;

struct CacheLane {
    queue: BoundedQueue<PoolRegion>,
    /// Hits served from this lane since the last trim.
    hits: AtomicUsize,
}

impl CacheLane {
    fn new(capacity: usize) -> Self {
        Self {
            queue: BoundedQueue::new(capacity),
            hits: AtomicUsize::new(0),
        }
    }

    fn allocate(&self) -> Option<PoolRegion> {
        let region = self.queue.pop();
        if region.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        region
    }

    /// Pop entries beyond what the lane's recent hit count justifies and
    /// hand them back to `arena`.
    fn trim(&self, arena: &Arena) {
        let hits = self.hits.swap(0, Ordering::Relaxed);
        let excess = self.queue.capacity().saturating_sub(hits);
        for _ in 0..excess {
            match self.queue.pop() {
                Some(region) => arena.free(region),
                None => break,
            }
        }
    }

    fn drain(&self, arena: &Arena) {
        while let Some(region) = self.queue.pop() {
            arena.free(region);
        }
    }
}

/// Lanes for one memory kind, bound to the arena the owning thread was
/// striped onto.
struct KindLanes {
    arena: Arc<Arena>,
    tiny: Box<[CacheLane]>,
    small: Box<[CacheLane]>,
    normal: Box<[CacheLane]>,
    /// Largest normalized capacity the normal lanes accept.
    max_cached: usize,
}

impl KindLanes {
    fn new(arena: Arc<Arena>, config: &PoolConfig) -> Self {
        let classes = *arena.classes();
        let max_cached = config
            .max_cached_buffer_capacity
            .min(classes.chunk_size());
        let normal_lanes = if max_cached >= classes.page_size() {
            ((max_cached / classes.page_size()).ilog2() + 1) as usize
        } else {
            0
        };
        Self {
            tiny: (0..N_TINY)
                .map(|_| CacheLane::new(config.tiny_cache_size))
                .collect(),
            small: (0..classes.n_small())
                .map(|_| CacheLane::new(config.small_cache_size))
                .collect(),
            normal: (0..normal_lanes)
                .map(|_| CacheLane::new(config.normal_cache_size))
                .collect(),
            max_cached,
            arena,
        }
    }

    /// The lane for a normalized capacity, or `None` when that capacity is
    /// not cached (too large, or no lane configured).
    fn lane(&self, class: SizeClass, norm: usize) -> Option<&CacheLane> {
        match class {
            SizeClass::Tiny => self.tiny.get(SizeClasses::tiny_index(norm)),
            SizeClass::Small => self.small.get(SizeClasses::small_index(norm)),
            SizeClass::Normal if norm <= self.max_cached => {
                self.normal.get(self.arena.classes().normal_index(norm))
            }
            _ => None,
        }
    }

    fn all_lanes(&self) -> impl Iterator<Item = &CacheLane> {
        self.tiny
            .iter()
            .chain(self.small.iter())
            .chain(self.normal.iter())
    }
}

/// One thread's cache, shared via `Arc` so that buffers allocated by this
/// thread can push their regions back from any releasing thread.
pub(crate) struct ThreadCache {
    heap: Option<KindLanes>,
    direct: Option<KindLanes>,
    allocations: AtomicU32,
    trim_interval: u32,
}

impl ThreadCache {
    pub fn new(
        heap: Option<Arc<Arena>>,
        direct: Option<Arc<Arena>>,
        config: &PoolConfig,
    ) -> Self {
        metrics::THREAD_CACHES.inc();
        Self {
            heap: heap.map(|a| KindLanes::new(a, config)),
            direct: direct.map(|a| KindLanes::new(a, config)),
            allocations: AtomicU32::new(0),
            trim_interval: config.cache_trim_interval,
        }
    }

    fn lanes(&self, kind: MemoryKind) -> Option<&KindLanes> {
        match kind {
            MemoryKind::Heap => self.heap.as_ref(),
            MemoryKind::Direct => self.direct.as_ref(),
        }
    }

    /// The arena this cache returns regions of `kind` to.
    pub fn arena(&self, kind: MemoryKind) -> Option<&Arc<Arena>> {
        self.lanes(kind).map(|lanes| &lanes.arena)
    }

    /// Serve a normalized capacity from the cache, if a region of that exact
    /// size is queued.
    pub fn allocate(&self, kind: MemoryKind, class: SizeClass, norm: usize) -> Option<PoolRegion> {
        let region = self
            .lanes(kind)
            .and_then(|lanes| lanes.lane(class, norm))
            .and_then(CacheLane::allocate);
        if self.allocations.fetch_add(1, Ordering::Relaxed) + 1 >= self.trim_interval {
            self.allocations.store(0, Ordering::Relaxed);
            self.trim();
        }
        region
    }

    /// Queue a freed region for reuse. Hands the region back when no lane
    /// accepts it (uncached size, or the lane is full); the caller then
    /// frees it to the arena.
    pub fn add(
        &self,
        kind: MemoryKind,
        class: SizeClass,
        region: PoolRegion,
    ) -> Result<(), PoolRegion> {
        match self.lanes(kind).and_then(|lanes| lanes.lane(class, region.length)) {
            Some(lane) => lane.queue.push(region),
            None => Err(region),
        }
    }

    /// Shrink every lane to its recently observed demand.
    pub fn trim(&self) {
        for lanes in [&self.heap, &self.direct].into_iter().flatten() {
            for lane in lanes.all_lanes() {
                lane.trim(&lanes.arena);
            }
        }
    }

    fn drain(&self) {
        for lanes in [&self.heap, &self.direct].into_iter().flatten() {
            for lane in lanes.all_lanes() {
                lane.drain(&lanes.arena);
            }
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.drain();
        metrics::THREAD_CACHES.dec();
    }
}
