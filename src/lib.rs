//! Pooled, reference-counted byte buffers for high-throughput I/O.
//!
//! Buffers are carved out of large fixed-size chunks managed by a buddy
//! allocator, with small sizes served from bitmap-tracked subpages and hot
//! alloc/free cycles short-circuited by per-thread caches. Every buffer is
//! a reference-counted handle; slices and duplicates share the count and
//! the backing bytes go back to the pool exactly once, when it hits zero.
//!
//! ```no_run
//! use bytepool::PooledByteBufAllocator;
//!
//! let alloc = PooledByteBufAllocator::default_instance();
//! let mut buf = alloc.buffer(1024)?;
//! buf.set_bytes(0, b"hello")?;
//! let view = buf.slice(0, 5)?;
//! view.release()?;
//! buf.release()?;
//! # Ok::<(), bytepool::PoolError>(())
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("bytepool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

mod buffer;

// allocator facade
pub use pool::allocator::{ArenaStats, PoolMetricsSnapshot, PooledByteBufAllocator};
pub use pool::config::PoolConfig;

// buffers
pub use buffer::PooledBuf;
pub use pool::vm::MemoryKind;

// observability
pub use pool::metrics::{ArenaMetricsSnapshot, Counter};
pub use pool::size_class::SizeClass;

// errors
pub use pool::error::PoolError;
