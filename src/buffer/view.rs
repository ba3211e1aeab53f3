//! Derived views: windows onto another handle's allocation.
//!
//! Views are composition, not subclassing: a slice or duplicate is just a
//! `PooledBuf` with a different offset/length over the same core, so the
//! whole retain/release surface works on it unchanged. Creating a view
//! retains the core; releasing the view releases it. The bytes go back to
//! the pool only when the root and every view have been released.

use crate::pool::error::PoolError;

use super::pooled::PooledBuf;

impl PooledBuf {
    /// A second full-range handle to this view's window.
    ///
    /// Retains the underlying allocation; release the duplicate like any
    /// other handle.
    pub fn duplicate(&self) -> Result<PooledBuf, PoolError> {
        self.retain()?;
        Ok(self.derived(self.offset, self.length, self.fixed))
    }

    /// A fixed-length handle to `length` bytes starting at `offset` within
    /// this view.
    ///
    /// The slice shares storage with its source and retains the underlying
    /// allocation. Its capacity cannot be changed.
    pub fn slice(&self, offset: usize, length: usize) -> Result<PooledBuf, PoolError> {
        self.check_range(offset, length)?;
        self.retain()?;
        Ok(self.derived(self.offset + offset, length, true))
    }
}
