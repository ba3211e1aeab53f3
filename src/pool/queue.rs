//! Bounded multi-producer queue backing the per-thread caches.
//!
//! Any thread that releases a buffer may push its region back toward the
//! cache of the thread that allocated it, so the producer side must be
//! thread-safe.  Popping is done by the owning thread (allocation fast
//! path and trim) and by the final drain when a cache is torn down.
//!
//! This is a sequence-counter ring: each slot carries a generation number
//! that tells producers and consumers whether the slot is theirs to use,
//! so neither side ever blocks on the other.

use std::mem::MaybeUninit;

use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::{unsafe_cell_get, unsafe_cell_get_mut};

struct Slot<T> {
    /// Generation counter.  `seq == index` means the slot is free for the
    /// producer of lap `index`; `seq == index + 1` means it holds a value
    /// for the consumer of lap `index`.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity lock-free FIFO ring.
///
/// Capacity is rounded up to the next power of two so that slot selection
/// is a mask instead of a modulo.
pub(crate) struct BoundedQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    /// Next position a producer will claim.
    tail: AtomicUsize,
    /// Next position a consumer will claim.
    head: AtomicUsize,
}

// Safety: values are handed off through the slot protocol below; a value
// is written by exactly one producer and read by exactly one consumer.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
// Safety: same as above.
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let slots = (0..cap)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: cap - 1,
            tail: AtomicUsize::new(0),
            head: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of queued values, racy but monotonic enough for trim
    /// decisions.
    pub(crate) fn approx_len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    /// Enqueue `value`, or hand it back if the ring is full.
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[tail & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == tail {
                // Slot is free for this lap; race other producers for it.
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: winning the CAS grants exclusive access to
                        // this slot until the seq store publishes it.
                        unsafe_cell_get_mut!(slot.value).write(value);
                        slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => tail = current,
                }
            } else if (seq.wrapping_sub(tail) as isize) < 0 {
                // The slot is still occupied from the previous lap.
                return Err(value);
            } else {
                // Another producer claimed this position; catch up.
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue the oldest value, if any.
    pub(crate) fn pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let filled = head.wrapping_add(1);

            if seq == filled {
                match self.head.compare_exchange_weak(
                    head,
                    filled,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: winning the CAS grants exclusive access to
                        // the initialized value in this slot.
                        let cell = unsafe_cell_get!(slot.value);
                        let value = unsafe { cell.assume_init_read() };
                        // Free the slot for the producer one lap ahead.
                        slot.seq
                            .store(head.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => head = current,
                }
            } else if (seq.wrapping_sub(filled) as isize) < 0 {
                // Slot not yet published: the queue is empty.
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        // Values still in flight are plain data here (regions are returned
        // to the arena by the cache drain before the queue drops), but
        // drop any leftovers for good measure.
        while self.pop().is_some() {}
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new(8);
        for i in 0..8 {
            q.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_capacity_rounds_up() {
        let q = BoundedQueue::<u32>::new(5);
        assert_eq!(q.capacity(), 8);
        let q = BoundedQueue::<u32>::new(64);
        assert_eq!(q.capacity(), 64);
        // Degenerate capacities still get a usable ring.
        let q = BoundedQueue::<u32>::new(0);
        assert_eq!(q.capacity(), 2);
    }

    #[test]
    fn test_push_full_returns_value() {
        let q = BoundedQueue::new(2);
        q.push(1u32).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.approx_len(), 2);
        assert_eq!(q.pop(), Some(1));
        q.push(3).unwrap();
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_wraparound() {
        let q = BoundedQueue::new(4);
        for lap in 0..10u32 {
            for i in 0..4 {
                q.push(lap * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(q.pop(), Some(lap * 4 + i));
            }
        }
    }

    #[test]
    fn test_concurrent_producers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let q = Arc::new(BoundedQueue::new(PRODUCERS * PER_PRODUCER));
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.push(p * PER_PRODUCER + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        while let Some(v) = q.pop() {
            assert!(!seen[v], "value {v} popped twice");
            seen[v] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_drop_releases_leftovers() {
        let q = BoundedQueue::new(4);
        q.push(String::from("left")).unwrap();
        q.push(String::from("over")).unwrap();
        drop(q);
    }
}
