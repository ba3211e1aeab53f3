use super::error::PoolError;
use super::size_class::TINY_LIMIT;

/// Pages per chunk is `1 << max_order`; orders beyond this give chunks
/// larger than 1 GiB at the minimum page size and are rejected.
pub const MAX_ORDER_LIMIT: u32 = 14;

/// Configuration for a [`PooledByteBufAllocator`](crate::PooledByteBufAllocator).
/// All fields have sensible defaults; validated once at construction and
/// immutable for the allocator's lifetime.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Page size in bytes. Power of two, at least 4 KiB. Default: 8 KiB.
    pub page_size: usize,

    /// Chunk order: a chunk spans `page_size << max_order` bytes.
    /// Default: 11 (16 MiB chunks at the default page size).
    pub max_order: u32,

    /// Number of heap arenas. 0 disables heap pooling. Default: available
    /// parallelism.
    pub n_heap_arenas: usize,

    /// Number of direct (mmap-backed) arenas. 0 disables direct pooling.
    /// Default: available parallelism.
    pub n_direct_arenas: usize,

    /// Whether `allocate()` prefers direct memory when both kinds are
    /// pooled. Default: true.
    pub prefer_direct: bool,

    /// Thread-cache queue capacity per tiny size index. Default: 512.
    pub tiny_cache_size: usize,

    /// Thread-cache queue capacity per small size index. Default: 256.
    pub small_cache_size: usize,

    /// Thread-cache queue capacity per normal size index. Default: 64.
    pub normal_cache_size: usize,

    /// Largest normalized capacity the thread cache will hold. Bigger
    /// regions always take the arena path. Default: 32 KiB.
    pub max_cached_buffer_capacity: usize,

    /// Number of cache allocations between trim sweeps. Default: 16384.
    pub cache_trim_interval: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let arenas = std::thread::available_parallelism().map_or(2, usize::from);
        Self {
            page_size: 8192,
            max_order: 11,
            n_heap_arenas: arenas,
            n_direct_arenas: arenas,
            prefer_direct: true,
            tiny_cache_size: 512,
            small_cache_size: 256,
            normal_cache_size: 64,
            max_cached_buffer_capacity: 32 * 1024,
            cache_trim_interval: 16384,
        }
    }
}

impl PoolConfig {
    /// Bytes spanned by one chunk.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }

    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if !self.page_size.is_power_of_two() {
            return Err(PoolError::InvalidConfig(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if self.page_size < 4096 {
            return Err(PoolError::InvalidConfig(format!(
                "page_size {} is below the 4096-byte minimum",
                self.page_size
            )));
        }
        debug_assert!(self.page_size >= TINY_LIMIT * 2);
        if self.max_order == 0 || self.max_order > MAX_ORDER_LIMIT {
            return Err(PoolError::InvalidConfig(format!(
                "max_order {} out of range 1..={MAX_ORDER_LIMIT}",
                self.max_order
            )));
        }
        if self.n_heap_arenas == 0 && self.n_direct_arenas == 0 {
            return Err(PoolError::InvalidConfig(
                "at least one arena (heap or direct) is required".to_string(),
            ));
        }
        if self.cache_trim_interval == 0 {
            return Err(PoolError::InvalidConfig(
                "cache_trim_interval must be positive".to_string(),
            ));
        }
        if self.max_cached_buffer_capacity > self.chunk_size() {
            return Err(PoolError::InvalidConfig(format!(
                "max_cached_buffer_capacity {} exceeds chunk size {}",
                self.max_cached_buffer_capacity,
                self.chunk_size()
            )));
        }
        Ok(())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = PoolConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.chunk_size(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_non_power_of_two_page() {
        let cfg = PoolConfig {
            page_size: 5000,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_excessive_order() {
        let cfg = PoolConfig {
            max_order: MAX_ORDER_LIMIT + 1,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_arenas() {
        let cfg = PoolConfig {
            n_heap_arenas: 0,
            n_direct_arenas: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(PoolError::InvalidConfig(_))));
    }
}
