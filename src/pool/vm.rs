use std::ptr::NonNull;

use super::error::PoolError;
use super::metrics;

/// Memory kind backing a chunk.
///
/// `Direct` chunks are mmap-backed and returned to the OS wholesale when the
/// chunk is destroyed. `Heap` chunks come from the process allocator, which
/// is the right choice for short-lived pools and for platforms where mapping
/// 16 MiB regions per chunk is wasteful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Heap,
    Direct,
}

/// Abstract interface for whole-region memory operations.
///
/// Chunks are fully committed at creation (the pool never touches pages it
/// has not handed out yet, and the buddy tree bounds internal fragmentation),
/// so there is no reserve/commit split here — one map, one unmap.
pub(crate) trait VmOps {
    /// Map `size` bytes of readable/writable memory.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, PoolError>;

    /// Unmap a region previously returned by [`map`](VmOps::map).
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), PoolError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use std::io;
    use std::ptr::NonNull;

    use super::{PlatformVmOps, PoolError, VmOps};

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, PoolError> {
            // Safety: FFI call to mmap; anonymous private mapping.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(PoolError::MapFailed(io::Error::last_os_error()));
            }
            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
                PoolError::MapFailed(io::Error::other("mmap returned null"))
            })
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), PoolError> {
            // Safety: FFI call to munmap on a region we mapped.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(PoolError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            // Safety: sysconf is always safe to call.
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 { sz as usize } else { 4096 }
        }
    }
}

// Fallback for loom/miri and non-unix targets: the process allocator stands
// in for mmap. Page-size alignment is preserved so offset arithmetic in the
// chunk tree behaves identically.
#[cfg(any(not(unix), loom, miri))]
mod fallback {
    use std::alloc::Layout;
    use std::io;
    use std::ptr::NonNull;

    use super::{PlatformVmOps, PoolError, VmOps};

    const FALLBACK_PAGE: usize = 4096;

    fn layout(size: usize) -> Result<Layout, PoolError> {
        Layout::from_size_align(size, FALLBACK_PAGE)
            .map_err(|_| PoolError::MapFailed(io::Error::from(io::ErrorKind::InvalidInput)))
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, PoolError> {
            let layout = layout(size)?;
            // Safety: layout has non-zero size (chunk sizes are validated).
            let ptr = unsafe { std::alloc::alloc(layout) };
            NonNull::new(ptr)
                .ok_or_else(|| PoolError::MapFailed(io::Error::from(io::ErrorKind::OutOfMemory)))
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), PoolError> {
            let layout = layout(size)?;
            // Safety: ptr was allocated with the same layout in map().
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            Ok(())
        }

        fn page_size() -> usize {
            FALLBACK_PAGE
        }
    }
}

/// Owned contiguous memory region backing one chunk (or one huge buffer).
///
/// Dropping unmaps/frees the region and settles the global gauges. All
/// buffers carved out of the region hold raw pointers into it; the arena's
/// invariant that a chunk is destroyed only when fully free is what makes
/// those pointers valid for the buffers' lifetimes.
pub(crate) struct ChunkMem {
    ptr: NonNull<u8>,
    size: usize,
    kind: MemoryKind,
}

// Safety: ChunkMem owns the region; moving ownership across threads is fine.
unsafe impl Send for ChunkMem {}
// Safety: ChunkMem itself is immutable after creation; access to the bytes
// behind `ptr` is coordinated by the arena and buffer reference counts.
unsafe impl Sync for ChunkMem {}

impl ChunkMem {
    pub fn new(kind: MemoryKind, size: usize) -> Result<Self, PoolError> {
        debug_assert!(size > 0);
        let ptr = match kind {
            // Safety: size is non-zero and validated by the caller.
            MemoryKind::Direct => unsafe { PlatformVmOps::map(size)? },
            MemoryKind::Heap => {
                let layout = std::alloc::Layout::from_size_align(size, 64).map_err(|_| {
                    PoolError::MapFailed(std::io::Error::from(std::io::ErrorKind::InvalidInput))
                })?;
                // Safety: layout has non-zero size.
                let raw = unsafe { std::alloc::alloc(layout) };
                NonNull::new(raw).ok_or_else(|| {
                    PoolError::MapFailed(std::io::Error::from(std::io::ErrorKind::OutOfMemory))
                })?
            }
        };
        metrics::MAPPED_BYTES.add(size);
        Ok(Self { ptr, size, kind })
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }
}

impl Drop for ChunkMem {
    fn drop(&mut self) {
        match self.kind {
            MemoryKind::Direct => {
                // Safety: we mapped this region in new() and nothing else
                // unmaps it; errors here are unrecoverable and ignored
                // (the address range is lost either way).
                unsafe {
                    drop(PlatformVmOps::unmap(self.ptr, self.size));
                }
            }
            MemoryKind::Heap => {
                // Unwrap justified: the same layout was valid in new().
                let layout = std::alloc::Layout::from_size_align(self.size, 64).unwrap();
                // Safety: allocated with this layout in new().
                unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
        }
        metrics::MAPPED_BYTES.sub(self.size);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let sz = PlatformVmOps::page_size();
        assert!(sz.is_power_of_two());
        assert!(sz >= 4096);
    }

    #[test]
    fn test_map_unmap_roundtrip() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: test-controlled map/unmap pair.
        unsafe {
            let ptr = PlatformVmOps::map(64 * 1024).unwrap();
            ptr.as_ptr().write(0xA5);
            assert_eq!(ptr.as_ptr().read(), 0xA5);
            PlatformVmOps::unmap(ptr, 64 * 1024).unwrap();
        }
    }

    #[test]
    fn test_chunk_mem_updates_gauge() {
        let _guard = crate::pool::TEST_MUTEX.write().unwrap();
        let before = metrics::MAPPED_BYTES.get();
        {
            let mem = ChunkMem::new(MemoryKind::Direct, 128 * 1024).unwrap();
            assert_eq!(mem.len(), 128 * 1024);
            assert_eq!(metrics::MAPPED_BYTES.get(), before + 128 * 1024);
        }
        assert_eq!(metrics::MAPPED_BYTES.get(), before);
    }

    #[test]
    fn test_heap_kind_allocates() {
        let mem = ChunkMem::new(MemoryKind::Heap, 16 * 1024).unwrap();
        assert_eq!(mem.kind(), MemoryKind::Heap);
        // Safety: region is owned and at least 16 KiB.
        unsafe {
            mem.as_ptr().as_ptr().write_bytes(0x5A, 16 * 1024);
        }
    }
}
