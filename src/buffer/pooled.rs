//! Reference-counted buffer handles over pooled regions.
//!
//! A `PooledBuf` is a window (offset + length) onto a shared `BufCore`,
//! which owns the backing storage and the reference count. Slices and
//! duplicates are further windows onto the same core; the storage is
//! returned to its arena exactly once, when the count reaches zero.
//!
//! The scalar read/write surface is deliberately thin: offset-based byte
//! copies gated on accessibility. Richer cursor APIs sit above this crate.

use std::mem;
use std::ptr::NonNull;

use crate::pool::arena::{Arena, PoolRegion};
use crate::pool::error::PoolError;
use crate::pool::size_class::{MAX_BUFFER_CAPACITY, SizeClass};
use crate::pool::thread_cache::ThreadCache;
use crate::pool::vm::{ChunkMem, MemoryKind};
use crate::sync::cell::UnsafeCell;
use crate::sync::{Arc, Weak, unsafe_cell_get, unsafe_cell_get_mut};

use super::ref_count::RefCount;

enum Storage {
    /// A region carved from a chunk. `max_length` is the granted size; the
    /// logical capacity of the root handle may be smaller and can grow up
    /// to it without reallocating.
    Pooled {
        region: PoolRegion,
        max_length: usize,
    },
    /// A dedicated mapping for a huge buffer, never pooled.
    Huge { mem: ChunkMem },
    /// Terminal: the count reached zero and the bytes went back.
    Freed,
}

/// Shared ownership core behind every view of one allocation.
pub(crate) struct BufCore {
    arena: Arc<Arena>,
    /// Cache of the allocating thread; releases from any thread try to
    /// push the region back here before taking the arena lock.
    cache: Weak<ThreadCache>,
    refs: RefCount,
    storage: UnsafeCell<Storage>,
}

// Safety: `storage` is only mutated by the zero-taking release, by the
// final `Arc` drop, and by `adjust_capacity` after proving the count is 1;
// each of those holds the sole live reference to the allocation.
unsafe impl Send for BufCore {}
// Safety: same protocol; concurrent readers only ever see a live storage
// while their handle keeps the count above zero.
unsafe impl Sync for BufCore {}

impl BufCore {
    /// Return the backing storage to wherever it came from.
    fn release_storage(&self, storage: Storage) {
        match storage {
            Storage::Pooled { region, .. } => {
                let class = self.arena.class_of(region.length);
                let region = match self.cache.upgrade() {
                    Some(cache) => {
                        match cache.add(self.arena.kind(), class, region) {
                            Ok(()) => return,
                            Err(region) => region,
                        }
                    }
                    None => region,
                };
                self.arena.free(region);
            }
            Storage::Huge { mem } => {
                self.arena.free_huge(mem.len());
                // mem unmaps on drop
            }
            Storage::Freed => debug_assert!(false, "storage deallocated twice"),
        }
    }

    fn deallocate(&self) {
        // Safety: reaching count zero (or the final Arc drop) grants
        // exclusive access to the storage.
        let storage = unsafe_cell_get_mut!(self.storage);
        let taken = mem::replace(storage, Storage::Freed);
        self.release_storage(taken);
    }
}

impl Drop for BufCore {
    fn drop(&mut self) {
        // Handles dropped without an explicit final release still return
        // their region instead of pinning chunk space.
        let leaked = !matches!(unsafe_cell_get_mut!(self.storage), Storage::Freed);
        if leaked {
            self.deallocate();
        }
    }
}

/// A reference-counted handle to pooled bytes.
///
/// Obtained from [`PooledByteBufAllocator`](crate::PooledByteBufAllocator);
/// further handles come from [`duplicate`](Self::duplicate) and
/// [`slice`](Self::slice). Every handle must be balanced by a
/// [`release`](Self::release) (a plain drop of the last handle also frees,
/// but releasing is how double-free and use-after-free bugs get reported).
pub struct PooledBuf {
    core: Arc<BufCore>,
    pub(super) offset: usize,
    pub(super) length: usize,
    /// Slices have a fixed window; capacity adjustment is unsupported.
    pub(super) fixed: bool,
}

impl PooledBuf {
    pub(crate) fn new_pooled(
        arena: Arc<Arena>,
        cache: Weak<ThreadCache>,
        region: PoolRegion,
        req_capacity: usize,
    ) -> Self {
        debug_assert!(req_capacity <= region.length);
        let max_length = region.length;
        Self {
            core: Arc::new(BufCore {
                arena,
                cache,
                refs: RefCount::new(),
                storage: UnsafeCell::new(Storage::Pooled { region, max_length }),
            }),
            offset: 0,
            length: req_capacity,
            fixed: false,
        }
    }

    pub(crate) fn new_huge(arena: Arc<Arena>, mem: ChunkMem, req_capacity: usize) -> Self {
        debug_assert!(req_capacity <= mem.len());
        Self {
            core: Arc::new(BufCore {
                arena,
                cache: Weak::new(),
                refs: RefCount::new(),
                storage: UnsafeCell::new(Storage::Huge { mem }),
            }),
            offset: 0,
            length: req_capacity,
            fixed: false,
        }
    }

    pub(super) fn derived(&self, offset: usize, length: usize, fixed: bool) -> Self {
        Self {
            core: Arc::clone(&self.core),
            offset,
            length,
            fixed,
        }
    }

    /// Logical capacity of this view in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.length
    }

    /// True for mmap-backed buffers.
    #[inline]
    pub fn is_direct(&self) -> bool {
        self.core.arena.kind() == MemoryKind::Direct
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.core.refs.count()
    }

    /// False once the reference count has reached zero; every data access
    /// on an inaccessible buffer fails with
    /// [`PoolError::BufferInaccessible`].
    #[inline]
    pub fn is_accessible(&self) -> bool {
        self.core.refs.count() != 0
    }

    pub fn retain(&self) -> Result<(), PoolError> {
        self.retain_n(1)
    }

    pub fn retain_n(&self, n: u32) -> Result<(), PoolError> {
        self.core.refs.retain(n)
    }

    /// Drop one reference. Returns `true` iff this call deallocated the
    /// buffer.
    pub fn release(&self) -> Result<bool, PoolError> {
        self.release_n(1)
    }

    pub fn release_n(&self, n: u32) -> Result<bool, PoolError> {
        if self.core.refs.release(n)? {
            self.core.deallocate();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Pointer to this view's first byte.
    fn data_ptr(&self) -> Result<NonNull<u8>, PoolError> {
        if !self.is_accessible() {
            return Err(PoolError::BufferInaccessible);
        }
        // Safety: our live handle keeps the count above zero, so no
        // deallocation or reallocation runs concurrently (both require
        // exclusive ownership of the allocation).
        let base = match unsafe_cell_get!(self.core.storage) {
            Storage::Pooled { region, .. } => region.ptr,
            Storage::Huge { mem } => mem.as_ptr(),
            Storage::Freed => return Err(PoolError::BufferInaccessible),
        };
        // Safety: offset was bounds-checked against the region when the
        // view was created.
        Ok(unsafe { base.add(self.offset) })
    }

    pub(super) fn check_range(&self, offset: usize, len: usize) -> Result<(), PoolError> {
        if offset.checked_add(len).is_none_or(|end| end > self.length) {
            return Err(PoolError::InvalidCapacity {
                requested: offset.saturating_add(len),
                maximum: self.length,
            });
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the buffer.
    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), PoolError> {
        self.check_range(offset, dst.len())?;
        let ptr = self.data_ptr()?;
        // Safety: range checked against the view; source stays mapped while
        // our reference is live.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the buffer starting at `offset`.
    pub fn set_bytes(&mut self, offset: usize, src: &[u8]) -> Result<(), PoolError> {
        self.check_range(offset, src.len())?;
        let ptr = self.data_ptr()?;
        // Safety: range checked against the view; one writer at a time per
        // region is the client's part of the contract, as with any shared
        // buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Change this buffer's capacity.
    ///
    /// Shrinking, and growing within the originally granted length, adjust
    /// the logical capacity in place. Growing beyond the grant allocates a
    /// fresh region, copies the current contents and frees the old one.
    /// Only the sole handle to an allocation may resize it.
    pub fn adjust_capacity(&mut self, new_capacity: usize) -> Result<(), PoolError> {
        if self.fixed {
            return Err(PoolError::Unsupported("capacity of a slice view is fixed"));
        }
        if new_capacity > MAX_BUFFER_CAPACITY {
            return Err(PoolError::InvalidCapacity {
                requested: new_capacity,
                maximum: MAX_BUFFER_CAPACITY,
            });
        }
        if !self.is_accessible() {
            return Err(PoolError::BufferInaccessible);
        }
        if self.core.refs.count() != 1 {
            // With other views alive an in-place move would pull the bytes
            // out from under them.
            return Err(PoolError::Unsupported("resize of a shared buffer"));
        }
        if new_capacity == self.length {
            return Ok(());
        }

        // Safety: count == 1 and &mut self make this the only access.
        let storage = unsafe_cell_get_mut!(self.core.storage);
        let granted = match storage {
            Storage::Pooled { max_length, .. } => *max_length,
            Storage::Huge { mem } => mem.len(),
            Storage::Freed => return Err(PoolError::BufferInaccessible),
        };
        if new_capacity <= granted {
            self.length = new_capacity;
            return Ok(());
        }
        self.reallocate(new_capacity)
    }

    /// Move the allocation to a region of at least `new_capacity` bytes.
    fn reallocate(&mut self, new_capacity: usize) -> Result<(), PoolError> {
        let arena = Arc::clone(&self.core.arena);
        let norm = arena.classes().normalize(new_capacity);

        let new_storage = if arena.classes().class_of(norm) == SizeClass::Huge {
            Storage::Huge {
                mem: arena.allocate_huge(new_capacity)?,
            }
        } else {
            let region = arena.allocate(norm)?;
            let max_length = region.length;
            Storage::Pooled { region, max_length }
        };
        let new_ptr = match &new_storage {
            Storage::Pooled { region, .. } => region.ptr,
            Storage::Huge { mem } => mem.as_ptr(),
            Storage::Freed => unreachable!(),
        };

        // Safety: sole handle (checked by the caller); the old region stays
        // valid until release_storage below.
        let storage = unsafe_cell_get_mut!(self.core.storage);
        let old_ptr = match &*storage {
            Storage::Pooled { region, .. } => region.ptr,
            Storage::Huge { mem } => mem.as_ptr(),
            Storage::Freed => return Err(PoolError::BufferInaccessible),
        };
        // Safety: both regions are at least `self.length` bytes and cannot
        // overlap (the new one was just carved while the old is still
        // allocated).
        unsafe {
            std::ptr::copy_nonoverlapping(old_ptr.as_ptr(), new_ptr.as_ptr(), self.length);
        }

        let old = mem::replace(storage, new_storage);
        self.core.release_storage(old);
        self.length = new_capacity;
        self.offset = 0;
        Ok(())
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("capacity", &self.length)
            .field("offset", &self.offset)
            .field("refs", &self.ref_count())
            .field("direct", &self.is_direct())
            .finish()
    }
}
