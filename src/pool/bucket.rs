use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use arc_swap::ArcSwap;
use crossbeam_queue::ArrayQueue;
use log::trace;

/// Bounded queue of idle buffers. Anything still queued when the last reference
/// goes away is released from the retained-byte budget.
pub(crate) struct Slots {
    queue: ArrayQueue<Vec<u8>>,
    retained: Arc<AtomicUsize>,
}

impl Slots {
    fn new(capacity: usize, retained: Arc<AtomicUsize>) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            retained,
        }
    }

    fn release(&self, buf: Vec<u8>) -> usize {
        let bytes = buf.capacity();
        self.retained.fetch_sub(bytes, Ordering::AcqRel);
        bytes
    }
}

impl Drop for Slots {
    fn drop(&mut self) {
        while let Some(buf) = self.queue.pop() {
            self.release(buf);
        }
    }
}

/// One size class of the pool.
///
/// Bracket `i` holds buffers whose capacity has bit-length `i`, i.e. capacities in
/// `[2^(i-1), 2^i)`.
pub(crate) struct Bucket {
    index: usize,
    slots: ArcSwap<Slots>,
    maintenance: AtomicBool,
    activity: AtomicU64,
}

/// Holds the bucket's maintenance try-lock until dropped.
pub(crate) struct MaintenanceGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Bucket {
    pub fn new(index: usize, capacity: usize, retained: Arc<AtomicUsize>) -> Self {
        Self {
            index,
            slots: ArcSwap::from_pointee(Slots::new(capacity, retained)),
            maintenance: AtomicBool::new(false),
            activity: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Records a `get`/`put` against this bucket.
    pub fn touch(&self) {
        self.activity.fetch_add(1, Ordering::AcqRel);
    }

    pub fn activity(&self) -> u64 {
        self.activity.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.slots.load().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.load().queue.capacity()
    }

    /// Non-blocking acquire of the maintenance lock. `None` means another thread
    /// is already growing or resetting this bucket.
    pub fn try_lock(&self) -> Option<MaintenanceGuard<'_>> {
        self.maintenance
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| MaintenanceGuard {
                flag: &self.maintenance,
            })
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.slots.load().queue.pop()
    }

    pub fn push(&self, buf: Vec<u8>) -> Result<(), Vec<u8>> {
        self.slots.load().queue.push(buf)
    }

    /// Replaces the queue with one `delta` slots larger and migrates the queued
    /// buffers into it.
    pub fn grow(&self, _guard: &MaintenanceGuard<'_>, delta: usize) {
        let current = self.slots.load_full();
        let capacity = current.queue.capacity() + delta.max(1);
        let grown = Arc::new(Slots::new(capacity, Arc::clone(&current.retained)));
        let old = self.slots.swap(Arc::clone(&grown));

        let mut moved = 0;
        while let Some(buf) = old.queue.pop() {
            match grown.queue.push(buf) {
                Ok(()) => moved += 1,
                Err(buf) => {
                    old.release(buf);
                }
            }
        }
        trace!(
            "bucket {} grown to {capacity} slots, {moved} buffers migrated",
            self.index
        );
    }

    /// Installs a fresh empty queue and releases the old queue's buffers. If the
    /// bucket sees activity while draining, the remaining buffers are migrated to
    /// the new queue instead. Returns the number of bytes released.
    pub fn reset(&self, _guard: &MaintenanceGuard<'_>, capacity: usize) -> usize {
        let seen = self.activity();
        let current = self.slots.load_full();
        let fresh = Arc::new(Slots::new(capacity, Arc::clone(&current.retained)));
        drop(current);
        let old = self.slots.swap(Arc::clone(&fresh));

        let mut released = 0;
        while let Some(buf) = old.queue.pop() {
            if self.activity() == seen {
                released += old.release(buf);
                continue;
            }
            if let Err(buf) = fresh.queue.push(buf) {
                released += old.release(buf);
            }
        }
        released
    }
}
