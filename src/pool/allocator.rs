//! The allocator facade: arena striping, the thread-local cache registry
//! and the buffer growth policy.
//!
//! One allocator owns a fixed set of arenas per memory kind. Each thread
//! is bound to one arena of each kind on its first allocation (round-robin
//! over a relaxed counter) and gets a cache in front of them; the binding
//! and the cache live in a thread-local registry whose destructor drains
//! every cached region back to its arena when the thread exits.

use crate::buffer::PooledBuf;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, OnceLock, Weak};

use super::arena::Arena;
use super::config::PoolConfig;
use super::error::PoolError;
use super::metrics::{self, ArenaMetricsSnapshot};
use super::size_class::{MAX_BUFFER_CAPACITY, SizeClass};
use super::thread_cache::ThreadCache;
use super::vm::MemoryKind;

/// Auto-growth switches from doubling to fixed steps at this capacity.
const GROWTH_THRESHOLD: usize = 4 * 1024 * 1024;

crate::sync::static_atomic! {
    static NEXT_ALLOCATOR_ID: AtomicUsize = AtomicUsize::new(0);
}

static DEFAULT_INSTANCE: OnceLock<PooledByteBufAllocator> = OnceLock::new();

#[cfg(not(loom))]
thread_local! {
    /// Caches of this thread, one per allocator it has touched.
    static THREAD_CACHES: std::cell::RefCell<Vec<(usize, Arc<ThreadCache>)>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

/// A pooled byte-buffer allocator.
///
/// Cheap to share behind an `Arc`/`'static`; every method takes `&self`.
/// Most programs want a single instance — see
/// [`default_instance`](Self::default_instance) — but independent pools
/// (say, one per subsystem with different chunk geometry) are just
/// separate values.
pub struct PooledByteBufAllocator {
    id: usize,
    config: PoolConfig,
    heap_arenas: Vec<Arc<Arena>>,
    direct_arenas: Vec<Arc<Arena>>,
    next_heap: AtomicUsize,
    next_direct: AtomicUsize,
}

impl PooledByteBufAllocator {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let make = |kind, n: usize| -> Vec<Arc<Arena>> {
            (0..n)
                .map(|_| Arc::new(Arena::new(kind, config.page_size, config.max_order)))
                .collect()
        };
        Ok(Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            heap_arenas: make(MemoryKind::Heap, config.n_heap_arenas),
            direct_arenas: make(MemoryKind::Direct, config.n_direct_arenas),
            next_heap: AtomicUsize::new(0),
            next_direct: AtomicUsize::new(0),
            config,
        })
    }

    /// The process-wide allocator with default configuration, created on
    /// first use.
    pub fn default_instance() -> &'static Self {
        DEFAULT_INSTANCE
            .get_or_init(|| Self::new(PoolConfig::default()).expect("default config is valid"))
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub fn is_heap_pooled(&self) -> bool {
        !self.heap_arenas.is_empty()
    }

    #[inline]
    pub fn is_direct_pooled(&self) -> bool {
        !self.direct_arenas.is_empty()
    }

    /// Allocate a buffer of `capacity` bytes from the preferred memory
    /// kind (`prefer_direct` when both kinds are pooled).
    pub fn buffer(&self, capacity: usize) -> Result<PooledBuf, PoolError> {
        if self.config.prefer_direct && self.is_direct_pooled() || !self.is_heap_pooled() {
            self.direct_buffer(capacity)
        } else {
            self.heap_buffer(capacity)
        }
    }

    pub fn heap_buffer(&self, capacity: usize) -> Result<PooledBuf, PoolError> {
        if !self.is_heap_pooled() {
            return Err(PoolError::Unsupported("heap pooling is disabled"));
        }
        self.allocate(MemoryKind::Heap, capacity)
    }

    pub fn direct_buffer(&self, capacity: usize) -> Result<PooledBuf, PoolError> {
        if !self.is_direct_pooled() {
            return Err(PoolError::Unsupported("direct pooling is disabled"));
        }
        self.allocate(MemoryKind::Direct, capacity)
    }

    fn allocate(&self, kind: MemoryKind, capacity: usize) -> Result<PooledBuf, PoolError> {
        if capacity > MAX_BUFFER_CAPACITY {
            return Err(PoolError::InvalidCapacity {
                requested: capacity,
                maximum: MAX_BUFFER_CAPACITY,
            });
        }

        let cache = self.thread_cache();
        let arena = match cache.as_ref().and_then(|c| c.arena(kind)) {
            Some(arena) => Arc::clone(arena),
            None => self.pick_arena(kind),
        };

        let norm = arena.classes().normalize(capacity);
        let class = arena.classes().class_of(norm);
        if class == SizeClass::Huge {
            let mem = arena.allocate_huge(capacity)?;
            return Ok(PooledBuf::new_huge(arena, mem, capacity));
        }

        let cache_ref = cache.as_ref().map_or_else(Weak::new, Arc::downgrade);
        if let Some(cache) = &cache
            && let Some(region) = cache.allocate(kind, class, norm)
        {
            return Ok(PooledBuf::new_pooled(arena, cache_ref, region, capacity));
        }
        let region = arena.allocate(norm)?;
        Ok(PooledBuf::new_pooled(arena, cache_ref, region, capacity))
    }

    /// Round-robin arena pick for threads without a cache binding.
    fn pick_arena(&self, kind: MemoryKind) -> Arc<Arena> {
        let (arenas, counter) = match kind {
            MemoryKind::Heap => (&self.heap_arenas, &self.next_heap),
            MemoryKind::Direct => (&self.direct_arenas, &self.next_direct),
        };
        let idx = counter.fetch_add(1, Ordering::Relaxed) % arenas.len();
        Arc::clone(&arenas[idx])
    }

    /// This thread's cache for this allocator, created on first use.
    #[cfg(not(loom))]
    fn thread_cache(&self) -> Option<Arc<ThreadCache>> {
        THREAD_CACHES.with(|registry| {
            let mut registry = registry.borrow_mut();
            if let Some((_, cache)) = registry.iter().find(|(id, _)| *id == self.id) {
                return Some(Arc::clone(cache));
            }
            let heap = self.is_heap_pooled().then(|| self.pick_arena(MemoryKind::Heap));
            let direct = self
                .is_direct_pooled()
                .then(|| self.pick_arena(MemoryKind::Direct));
            let cache = Arc::new(ThreadCache::new(heap, direct, &self.config));
            registry.push((self.id, Arc::clone(&cache)));
            Some(cache)
        })
    }

    // loom has no thread_local destructors; models exercise the arena path.
    #[cfg(loom)]
    fn thread_cache(&self) -> Option<Arc<ThreadCache>> {
        None
    }

    /// Trim the calling thread's cache, returning entries beyond recent
    /// demand to the arenas. A no-op for threads that never allocated.
    pub fn trim(&self) {
        #[cfg(not(loom))]
        THREAD_CACHES.with(|registry| {
            let registry = registry.borrow();
            if let Some((_, cache)) = registry.iter().find(|(id, _)| *id == self.id) {
                cache.trim();
            }
        });
    }

    /// Next capacity for a buffer that must hold at least
    /// `min_new_capacity` bytes: powers of two from 64 up to 4 MiB, then
    /// 4 MiB steps, capped at `max_capacity`.
    pub fn calculate_new_capacity(
        &self,
        min_new_capacity: usize,
        max_capacity: usize,
    ) -> Result<usize, PoolError> {
        if min_new_capacity > max_capacity {
            return Err(PoolError::CapacityBounds {
                minimum: min_new_capacity,
                maximum: max_capacity,
            });
        }
        if min_new_capacity > MAX_BUFFER_CAPACITY {
            return Err(PoolError::InvalidCapacity {
                requested: min_new_capacity,
                maximum: MAX_BUFFER_CAPACITY,
            });
        }
        if min_new_capacity == GROWTH_THRESHOLD {
            return Ok(GROWTH_THRESHOLD.min(max_capacity));
        }
        if min_new_capacity > GROWTH_THRESHOLD {
            // Step in whole 4 MiB increments without overshooting the cap.
            let stepped = min_new_capacity / GROWTH_THRESHOLD * GROWTH_THRESHOLD;
            let grown = if stepped > max_capacity - GROWTH_THRESHOLD {
                max_capacity
            } else {
                stepped + GROWTH_THRESHOLD
            };
            return Ok(grown);
        }
        let mut capacity = 64usize;
        while capacity < min_new_capacity {
            capacity <<= 1;
        }
        Ok(capacity.min(max_capacity))
    }

    /// Point-in-time view of the whole pool.
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        let collect = |arenas: &[Arc<Arena>]| {
            arenas
                .iter()
                .map(|a| ArenaStats {
                    metrics: a.metrics.snapshot(),
                    chunks: a.chunk_count(),
                    free_bytes: a.free_bytes(),
                    list_lengths: a.list_lengths(),
                })
                .collect()
        };
        PoolMetricsSnapshot {
            heap_arenas: collect(&self.heap_arenas),
            direct_arenas: collect(&self.direct_arenas),
            mapped_bytes: metrics::MAPPED_BYTES.get(),
            thread_caches: metrics::THREAD_CACHES.get(),
        }
    }
}

impl std::fmt::Debug for PooledByteBufAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledByteBufAllocator")
            .field("heap_arenas", &self.heap_arenas.len())
            .field("direct_arenas", &self.direct_arenas.len())
            .field("page_size", &self.config.page_size)
            .field("chunk_size", &self.config.chunk_size())
            .finish()
    }
}

/// Diagnostic state of one arena.
#[derive(Clone, Debug)]
pub struct ArenaStats {
    pub metrics: ArenaMetricsSnapshot,
    /// Live chunks owned by the arena.
    pub chunks: usize,
    /// Free bytes across the arena's chunks.
    pub free_bytes: usize,
    /// Chunk count per utilization list, least utilized first.
    pub list_lengths: [usize; 6],
}

/// Diagnostic state of a whole allocator, plus the process-wide gauges.
#[derive(Clone, Debug)]
pub struct PoolMetricsSnapshot {
    pub heap_arenas: Vec<ArenaStats>,
    pub direct_arenas: Vec<ArenaStats>,
    /// Bytes currently mapped for chunk backing stores, process-wide.
    pub mapped_bytes: usize,
    /// Live thread caches, process-wide.
    pub thread_caches: usize,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn small_config() -> PoolConfig {
        PoolConfig {
            page_size: 8192,
            max_order: 4, // 128 KiB chunks
            n_heap_arenas: 2,
            n_direct_arenas: 1,
            prefer_direct: false,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_buffer_respects_preference() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledByteBufAllocator::new(small_config()).unwrap();
        let b = alloc.buffer(100).unwrap();
        assert!(!b.is_direct());
        b.release().unwrap();

        let direct = PooledByteBufAllocator::new(PoolConfig {
            prefer_direct: true,
            ..small_config()
        })
        .unwrap();
        let b = direct.buffer(100).unwrap();
        assert!(b.is_direct());
        b.release().unwrap();
    }

    #[test]
    fn test_disabled_kind_is_rejected() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledByteBufAllocator::new(PoolConfig {
            n_direct_arenas: 0,
            ..small_config()
        })
        .unwrap();
        assert!(!alloc.is_direct_pooled());
        assert!(matches!(
            alloc.direct_buffer(64),
            Err(PoolError::Unsupported(_))
        ));
        // With direct gone, preference falls through to heap.
        let b = alloc.buffer(64).unwrap();
        assert!(!b.is_direct());
        b.release().unwrap();
    }

    #[test]
    fn test_oversized_request_rejected_up_front() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledByteBufAllocator::new(small_config()).unwrap();
        assert!(matches!(
            alloc.heap_buffer(MAX_BUFFER_CAPACITY + 1),
            Err(PoolError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_huge_buffer_is_unpooled() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledByteBufAllocator::new(small_config()).unwrap();
        let chunk_size = alloc.config().chunk_size();
        let b = alloc.heap_buffer(chunk_size + 1).unwrap();
        assert_eq!(b.capacity(), chunk_size + 1);
        let snap = alloc.metrics();
        let total_chunks: usize = snap.heap_arenas.iter().map(|a| a.chunks).sum();
        assert_eq!(total_chunks, 0, "huge buffers must not create chunks");
        b.release().unwrap();
    }

    #[test]
    fn test_growth_policy_doubles_then_steps() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledByteBufAllocator::new(small_config()).unwrap();
        let max = MAX_BUFFER_CAPACITY;
        assert_eq!(alloc.calculate_new_capacity(0, max).unwrap(), 64);
        assert_eq!(alloc.calculate_new_capacity(65, max).unwrap(), 128);
        assert_eq!(alloc.calculate_new_capacity(5000, max).unwrap(), 8192);
        let t = GROWTH_THRESHOLD;
        assert_eq!(alloc.calculate_new_capacity(t, max).unwrap(), t);
        assert_eq!(alloc.calculate_new_capacity(t + 1, max).unwrap(), 2 * t);
        assert_eq!(
            alloc.calculate_new_capacity(2 * t + 123, max).unwrap(),
            3 * t
        );
        // Capped at max_capacity.
        assert_eq!(
            alloc.calculate_new_capacity(t + 1, t + 100).unwrap(),
            t + 100
        );
    }

    #[test]
    fn test_growth_bounds_error() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledByteBufAllocator::new(small_config()).unwrap();
        assert!(matches!(
            alloc.calculate_new_capacity(101, 100),
            Err(PoolError::CapacityBounds {
                minimum: 101,
                maximum: 100
            })
        ));
    }

    #[test]
    fn test_same_thread_free_then_alloc_hits_cache() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PooledByteBufAllocator::new(small_config()).unwrap();
        let b = alloc.heap_buffer(64).unwrap();
        b.release().unwrap();

        let before = alloc.metrics();
        let b2 = alloc.heap_buffer(64).unwrap();
        let after = alloc.metrics();
        // The region came from this thread's cache, not from an arena.
        let arena_allocs = |snap: &PoolMetricsSnapshot| -> usize {
            snap.heap_arenas
                .iter()
                .map(|a| a.metrics.allocations_of(SizeClass::Tiny))
                .sum()
        };
        assert_eq!(arena_allocs(&before), arena_allocs(&after));
        b2.release().unwrap();
        alloc.trim();
    }

    #[test]
    fn test_thread_exit_drains_cache() {
        let _guard = crate::pool::TEST_MUTEX.write().unwrap();
        let alloc = std::sync::Arc::new(PooledByteBufAllocator::new(small_config()).unwrap());
        let caches_before = metrics::THREAD_CACHES.get();

        let cloned = std::sync::Arc::clone(&alloc);
        std::thread::spawn(move || {
            let b = cloned.heap_buffer(64).unwrap();
            b.release().unwrap();
            assert!(metrics::THREAD_CACHES.get() > caches_before);
        })
        .join()
        .unwrap();

        // TLS destructor drained the cache and deregistered it.
        assert_eq!(metrics::THREAD_CACHES.get(), caches_before);
        let snap = alloc.metrics();
        let active: usize = snap
            .heap_arenas
            .iter()
            .map(|a| a.metrics.active_of(SizeClass::Tiny))
            .sum();
        assert_eq!(active, 0, "drained regions must be freed in the arena");
    }

    #[test]
    fn test_default_instance_is_shared() {
        let a = PooledByteBufAllocator::default_instance();
        let b = PooledByteBufAllocator::default_instance();
        assert!(std::ptr::eq(a, b));
    }
}
