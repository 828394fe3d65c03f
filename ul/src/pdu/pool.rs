//! Pooled allocation for PDU byte buffers.
//!
//! Receive and encode paths acquire their scratch buffers here
//! instead of allocating per PDU.
//! The pool is process-wide and sharded,
//! so concurrent stage workers do not contend on a single lock.
//! Tests reset it through [`PduBufferPool::reset`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::pdu::DEFAULT_MAX_PDU;

const SHARD_COUNT: usize = 8;

/// The number of free buffers each shard retains.
const MAX_POOLED_PER_SHARD: usize = 32;

/// Usage counters for the buffer pool.
#[derive(Debug, Default)]
pub struct PoolStatistics {
    total_acquisitions: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    total_releases: AtomicU64,
    total_bytes_allocated: AtomicU64,
}

impl PoolStatistics {
    pub fn total_acquisitions(&self) -> u64 {
        self.total_acquisitions.load(Ordering::Relaxed)
    }

    pub fn pool_hits(&self) -> u64 {
        self.pool_hits.load(Ordering::Relaxed)
    }

    pub fn pool_misses(&self) -> u64 {
        self.pool_misses.load(Ordering::Relaxed)
    }

    pub fn total_releases(&self) -> u64 {
        self.total_releases.load(Ordering::Relaxed)
    }

    pub fn total_bytes_allocated(&self) -> u64 {
        self.total_bytes_allocated.load(Ordering::Relaxed)
    }

    /// The fraction of acquisitions served from the pool, 0.0 to 1.0.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_acquisitions();
        if total == 0 {
            return 0.0;
        }
        self.pool_hits() as f64 / total as f64
    }

    fn reset(&self) {
        self.total_acquisitions.store(0, Ordering::Relaxed);
        self.pool_hits.store(0, Ordering::Relaxed);
        self.pool_misses.store(0, Ordering::Relaxed);
        self.total_releases.store(0, Ordering::Relaxed);
        self.total_bytes_allocated.store(0, Ordering::Relaxed);
    }
}

/// A process-wide pool of reusable PDU byte buffers.
///
/// Obtain the singleton with [`PduBufferPool::global`].
pub struct PduBufferPool {
    shards: [Mutex<Vec<Vec<u8>>>; SHARD_COUNT],
    statistics: PoolStatistics,
    buffer_capacity: usize,
    next_shard: AtomicUsize,
}

static GLOBAL_POOL: OnceLock<PduBufferPool> = OnceLock::new();

impl PduBufferPool {
    fn new(buffer_capacity: usize) -> Self {
        PduBufferPool {
            shards: std::array::from_fn(|_| Mutex::new(Vec::new())),
            statistics: PoolStatistics::default(),
            buffer_capacity,
            next_shard: AtomicUsize::new(0),
        }
    }

    /// Access the process-wide pool,
    /// initializing it on first use
    /// with room for one default-sized PDU per buffer.
    pub fn global() -> &'static PduBufferPool {
        GLOBAL_POOL.get_or_init(|| PduBufferPool::new(DEFAULT_MAX_PDU as usize))
    }

    /// Acquire a cleared buffer,
    /// reusing a previously released one when available.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        self.statistics
            .total_acquisitions
            .fetch_add(1, Ordering::Relaxed);

        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
        let reused = self.shards[shard]
            .lock()
            .expect("buffer pool shard poisoned")
            .pop();

        let data = match reused {
            Some(mut buffer) => {
                self.statistics.pool_hits.fetch_add(1, Ordering::Relaxed);
                buffer.clear();
                buffer
            }
            None => {
                self.statistics.pool_misses.fetch_add(1, Ordering::Relaxed);
                self.statistics
                    .total_bytes_allocated
                    .fetch_add(self.buffer_capacity as u64, Ordering::Relaxed);
                Vec::with_capacity(self.buffer_capacity)
            }
        };

        PooledBuffer {
            pool: self,
            shard,
            data: Some(data),
        }
    }

    /// Read the usage counters.
    pub fn statistics(&self) -> &PoolStatistics {
        &self.statistics
    }

    /// Drop all pooled buffers and zero the counters.
    pub fn reset(&self) {
        for shard in &self.shards {
            shard.lock().expect("buffer pool shard poisoned").clear();
        }
        self.statistics.reset();
    }

    fn release(&self, shard: usize, buffer: Vec<u8>) {
        self.statistics
            .total_releases
            .fetch_add(1, Ordering::Relaxed);
        let mut free = self.shards[shard]
            .lock()
            .expect("buffer pool shard poisoned");
        if free.len() < MAX_POOLED_PER_SHARD {
            free.push(buffer);
        }
    }
}

/// A buffer borrowed from the pool,
/// returned to it on drop.
pub struct PooledBuffer<'a> {
    pool: &'a PduBufferPool,
    shard: usize,
    data: Option<Vec<u8>>,
}

impl PooledBuffer<'_> {
    /// Detach the buffer from the pool,
    /// keeping the allocation for the caller.
    pub fn into_inner(mut self) -> Vec<u8> {
        self.data.take().expect("buffer already taken")
    }
}

impl std::ops::Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.data.as_ref().expect("buffer already taken")
    }
}

impl std::ops::DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.data.as_mut().expect("buffer already taken")
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.data.take() {
            self.pool.release(self.shard, buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reuses_buffers() {
        let pool = PduBufferPool::new(1024);

        {
            let mut buffer = pool.acquire();
            buffer.extend_from_slice(&[1, 2, 3]);
        }
        assert_eq!(pool.statistics().pool_misses(), 1);
        assert_eq!(pool.statistics().total_releases(), 1);

        // shards are rotated, so a full cycle comes back to the free buffer
        let mut hits = 0;
        for _ in 0..SHARD_COUNT {
            let buffer = pool.acquire();
            assert!(buffer.is_empty());
            if pool.statistics().pool_hits() > hits {
                hits = pool.statistics().pool_hits();
            }
        }
        assert_eq!(hits, 1);
    }

    #[test]
    fn reset_clears_statistics() {
        let pool = PduBufferPool::new(64);
        let _ = pool.acquire();
        assert_eq!(pool.statistics().total_acquisitions(), 1);

        pool.reset();
        assert_eq!(pool.statistics().total_acquisitions(), 0);
        assert!((pool.statistics().hit_ratio() - 0.0).abs() < f64::EPSILON);
    }
}
