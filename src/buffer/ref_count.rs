//! Atomic reference-count discipline shared by every buffer view.
//!
//! The count starts at 1 and moves only through `retain`/`release`. The
//! transition to zero is taken by exactly one caller, which then owns the
//! deallocation. Misuse (retaining a dead buffer, releasing below zero,
//! overflowing) is reported as [`PoolError::IllegalRefCount`], never
//! clamped: those conditions mean client code already has a use-after-free
//! or double-free and must hear about it.

use crate::sync::atomic::{AtomicU32, Ordering};

use crate::pool::error::PoolError;

pub(crate) struct RefCount(AtomicU32);

impl RefCount {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Add `n` references. `n == 0` and any transition that could not have
    /// started from a live count (resurrection, overflow) are illegal.
    pub fn retain(&self, n: u32) -> Result<(), PoolError> {
        if n == 0 {
            return Err(PoolError::IllegalRefCount { count: self.count() });
        }
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                // Resurrection: the buffer was already deallocated.
                return Err(PoolError::IllegalRefCount { count: 0 });
            }
            let Some(next) = current.checked_add(n) else {
                return Err(PoolError::IllegalRefCount { count: current });
            };
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Drop `n` references. Returns `true` iff this call took the count to
    /// zero; the caller then performs the deallocation, exactly once.
    pub fn release(&self, n: u32) -> Result<bool, PoolError> {
        if n == 0 {
            return Err(PoolError::IllegalRefCount { count: self.count() });
        }
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current < n {
                return Err(PoolError::IllegalRefCount { count: current });
            }
            let next = current - n;
            match self.0.compare_exchange_weak(
                current,
                next,
                // Release on success orders all prior writes to the buffer
                // before the count drop; the acquire on the zero-taking
                // load pairs with it so the deallocating thread sees them.
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(next == 0),
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::atomic::AtomicUsize;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;

    #[test]
    fn test_starts_at_one() {
        let rc = RefCount::new();
        assert_eq!(rc.count(), 1);
    }

    #[test]
    fn test_retain_release_round() {
        let rc = RefCount::new();
        rc.retain(2).unwrap();
        assert_eq!(rc.count(), 3);
        assert!(!rc.release(1).unwrap());
        assert!(!rc.release(1).unwrap());
        assert!(rc.release(1).unwrap(), "final release reports deallocation");
        assert_eq!(rc.count(), 0);
    }

    #[test]
    fn test_release_below_zero_is_illegal() {
        let rc = RefCount::new();
        assert!(rc.release(1).unwrap());
        let err = rc.release(1).unwrap_err();
        assert!(matches!(err, PoolError::IllegalRefCount { count: 0 }));
    }

    #[test]
    fn test_resurrection_is_illegal() {
        let rc = RefCount::new();
        rc.release(1).unwrap();
        assert!(matches!(
            rc.retain(1),
            Err(PoolError::IllegalRefCount { count: 0 })
        ));
    }

    #[test]
    fn test_zero_delta_is_illegal() {
        let rc = RefCount::new();
        assert!(rc.retain(0).is_err());
        assert!(rc.release(0).is_err());
        assert_eq!(rc.count(), 1, "illegal calls leave the count untouched");
    }

    #[test]
    fn test_overflow_is_illegal() {
        let rc = RefCount::new();
        rc.retain(u32::MAX - 1).unwrap();
        assert!(matches!(
            rc.retain(1),
            Err(PoolError::IllegalRefCount { count: u32::MAX })
        ));
    }

    #[test]
    fn test_release_more_than_held() {
        let rc = RefCount::new();
        rc.retain(1).unwrap(); // count == 2
        assert!(matches!(
            rc.release(3),
            Err(PoolError::IllegalRefCount { count: 2 })
        ));
        assert!(rc.release(2).unwrap());
    }

    #[test]
    fn test_concurrent_net_delta_deallocates_once() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;

        let rc = Arc::new(RefCount::new());
        let deallocations = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS + 1));

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let rc = Arc::clone(&rc);
            let deallocations = Arc::clone(&deallocations);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    rc.retain(1).unwrap();
                    if rc.release(1).unwrap() {
                        deallocations.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        barrier.wait();
        for h in handles {
            h.join().unwrap();
        }

        // The original reference is still held: nobody may have hit zero.
        assert_eq!(deallocations.load(Ordering::Relaxed), 0);
        assert_eq!(rc.count(), 1);
        assert!(rc.release(1).unwrap());
    }
}
