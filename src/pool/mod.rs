//! Size-classed buffer pool.
//!
//! The [`BufferPool`] is a cache of reusable `Vec<u8>` buffers bucketed by power-of-two
//! capacity. It is an explicit object: whoever creates connections owns a pool and hands
//! clones of it to the pipelines and codecs that need scratch space.
//!
//! # Size classes
//!
//! Bracket `i` holds buffers whose capacity has bit-length `i`. Selection is asymmetric:
//!
//! - [`BufferPool::get`] uses the **ceiling** bracket, the smallest bracket in which every
//!   buffer is large enough for the request.
//! - [`BufferPool::put`] uses the **floor** bracket, the bracket matching the buffer's true
//!   capacity, so buffers that are not exactly a power of two are still classified
//!   correctly.
//!
//! A miss allocates a fresh buffer rounded up to the bracket's lower bound, which keeps
//! direct allocations reusable by the same bracket once they are returned.
//!
//! # Budget
//!
//! The pool tracks the bytes *retained in idle buckets* (not bytes lent to callers). A
//! buffer is only accepted back while the retained total plus its capacity stays within
//! the memory limit; otherwise it is dropped. Neither `get` nor `put` ever fails.
//!
//! # Idle cleanup
//!
//! A monitor thread looks at every bucket once per [`PoolConfig::idle_interval`]. A bucket
//! that saw no `get`/`put` for a whole interval is reset and its buffers released. The
//! monitor holds only a weak reference and exits when the pool is dropped.
//!
//! # Example
//! ```rust
//! use wirebuf::pool::BufferPool;
//!
//! let pool = BufferPool::default();
//!
//! let buf = pool.get(10, 100);
//! assert_eq!(buf.len(), 10);
//! assert!(buf.capacity() >= 100);
//!
//! pool.put(buf);
//! assert_eq!(pool.retained_bytes(), 128);
//! ```
mod bucket;
mod monitor;

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use log::{trace, warn};

use crate::io::task::Task;

use bucket::Bucket;

/// Number of brackets: one per possible bit-length of a `usize`, plus zero.
const BRACKETS: usize = usize::BITS as usize + 1;

pub const DEFAULT_MEMORY_LIMIT: usize = 1 << 30;
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(10);

/// Tuning knobs for a [`BufferPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on bytes retained by idle buckets.
    pub memory_limit: usize,
    /// A bucket untouched for this long is emptied.
    pub idle_interval: Duration,
    /// Initial number of slots per bucket queue.
    pub queue_capacity: usize,
    /// Slots added when a full bucket queue is grown.
    pub queue_growth: usize,
    /// Attempts made by a `put` that lost the race to grow a full queue.
    pub put_retries: usize,
    /// Base sleep between those attempts; grows linearly per attempt.
    pub put_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            queue_capacity: 64,
            queue_growth: 64,
            put_retries: 8,
            put_backoff: Duration::from_micros(50),
        }
    }
}

/// Bit-length of `n`; zero for zero.
fn bit_len(n: usize) -> usize {
    (usize::BITS - n.leading_zeros()) as usize
}

/// Smallest bracket whose buffers all hold at least `capacity` bytes.
pub(crate) fn ceil_bracket(capacity: usize) -> usize {
    if capacity == 0 {
        return 0;
    }
    bit_len(capacity - 1) + 1
}

/// Bracket a buffer of exactly `capacity` bytes belongs to.
pub(crate) fn floor_bracket(capacity: usize) -> usize {
    bit_len(capacity)
}

struct PoolInner {
    config: PoolConfig,
    buckets: Vec<Bucket>,
    retained: Arc<AtomicUsize>,
    limit: AtomicUsize,
    // Dropping the sender disconnects the monitor.
    _stop: mpsc::Sender<()>,
    _monitor: Option<Task<()>>,
}

impl PoolInner {
    fn reserve(&self, bytes: usize) -> bool {
        let limit = self.limit.load(Ordering::Acquire);
        self.retained
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|total| *total <= limit)
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        self.retained.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn retained_bytes(&self) -> usize {
        self.retained.load(Ordering::Acquire)
    }

    /// Resets every bucket whose activity counter has not moved since the previous
    /// sweep, which also shrinks grown queues back to their initial size. `seen`
    /// carries the counters between sweeps.
    fn sweep(&self, seen: &mut Vec<Option<u64>>) -> usize {
        seen.resize(self.buckets.len(), None);
        let mut released = 0;

        for (bucket, last) in self.buckets.iter().zip(seen.iter_mut()) {
            let activity = bucket.activity();
            let shrinkable =
                bucket.len() > 0 || bucket.capacity() > self.config.queue_capacity.max(1);
            if *last == Some(activity) && shrinkable {
                if let Some(guard) = bucket.try_lock() {
                    released += bucket.reset(&guard, self.config.queue_capacity);
                }
            }
            *last = Some(bucket.activity());
        }
        released
    }
}

/// Process-wide cache of reusable byte buffers. Cloning is cheap and shares the cache.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| {
            let retained = Arc::new(AtomicUsize::new(0));
            let buckets = (0..BRACKETS)
                .map(|i| Bucket::new(i, config.queue_capacity, Arc::clone(&retained)))
                .collect();

            let (stop, signal) = mpsc::channel();
            let monitor = match monitor::spawn(weak.clone(), config.idle_interval, signal) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("buffer pool idle monitor unavailable: {e}");
                    None
                }
            };

            PoolInner {
                limit: AtomicUsize::new(config.memory_limit),
                config,
                buckets,
                retained,
                _stop: stop,
                _monitor: monitor,
            }
        });

        Self { inner }
    }

    /// Returns a buffer of `length` bytes whose capacity is at least
    /// `max(length, min_capacity)`. Never fails: a bucket miss allocates.
    pub fn get(&self, length: usize, min_capacity: usize) -> Vec<u8> {
        let capacity = min_capacity.max(length);
        if capacity == 0 {
            return Vec::new();
        }

        if let Some(bucket) = self.inner.buckets.get(ceil_bracket(capacity)) {
            bucket.touch();
            if let Some(mut buf) = bucket.pop() {
                self.inner.release(buf.capacity());
                buf.clear();
                buf.resize(length, 0);
                return buf;
            }
        }

        let rounded = capacity.checked_next_power_of_two().unwrap_or(capacity);
        trace!("pool miss for {capacity} bytes, allocating {rounded}");
        let mut buf = Vec::with_capacity(rounded);
        buf.resize(length, 0);
        buf
    }

    /// Offers a used buffer back for reuse. Dropped silently when the memory limit
    /// would be exceeded.
    pub fn put(&self, mut buf: Vec<u8>) {
        let capacity = buf.capacity();
        if capacity == 0 {
            return;
        }
        let Some(bucket) = self.inner.buckets.get(floor_bracket(capacity)) else {
            return;
        };
        bucket.touch();

        if !self.inner.reserve(capacity) {
            trace!("pool budget exhausted, dropping {capacity} byte buffer");
            return;
        }
        buf.clear();

        let mut buf = match bucket.push(buf) {
            Ok(()) => return,
            Err(buf) => buf,
        };

        if let Some(guard) = bucket.try_lock() {
            bucket.grow(&guard, self.inner.config.queue_growth);
            buf = match bucket.push(buf) {
                Ok(()) => return,
                Err(buf) => buf,
            };
        }

        for attempt in 1..=self.inner.config.put_retries {
            thread::sleep(self.inner.config.put_backoff * attempt as u32);
            buf = match bucket.push(buf) {
                Ok(()) => return,
                Err(buf) => buf,
            };
        }

        trace!(
            "bucket {} saturated, dropping {capacity} byte buffer",
            bucket.index()
        );
        self.inner.release(capacity);
    }

    /// Changes the retained-byte limit. Buckets already above the new limit shrink
    /// through idle cleanup; no buffer is evicted eagerly.
    pub fn set_memory_limit(&self, limit: usize) {
        self.inner.limit.store(limit, Ordering::Release);
    }

    pub fn memory_limit(&self) -> usize {
        self.inner.limit.load(Ordering::Acquire)
    }

    /// Bytes currently sitting in idle buckets.
    pub fn retained_bytes(&self) -> usize {
        self.inner.retained_bytes()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("retained", &self.retained_bytes())
            .field("limit", &self.memory_limit())
            .finish()
    }
}
