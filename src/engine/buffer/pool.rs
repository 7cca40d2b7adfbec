//! Buffer allocation and recycling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{return_channel, AllocationKind, Buffer, ProducerReturns, ReturnSide};
use crate::engine::error::{PipelineError, Result};

#[derive(Default)]
struct FreeList {
    /// Recycled storage, any order; allocation picks the best fit.
    storage: Vec<Vec<u8>>,
    /// Capacity of pool storage currently out of the free list.
    outstanding_bytes: usize,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub outstanding_bytes: usize,
    pub free_buffers: usize,
    /// Allocations served by growing the pool.
    pub grown: u64,
    /// Allocations served from the free list.
    pub reused: u64,
    /// Borrowed buffers handed back to the producer.
    pub returned_to_producer: u64,
}

/// Allocates and recycles buffer storage.
///
/// Shared between the producer (allocate) and the consumer (release).
pub struct BufferPool {
    free: Mutex<FreeList>,
    returns: Arc<Mutex<ReturnSide>>,
    max_outstanding_bytes: Option<usize>,
    grown: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
}

impl BufferPool {
    /// Create a pool and the producer's end of the hand-back path.
    pub fn new(
        max_outstanding_bytes: Option<usize>,
        return_capacity: usize,
    ) -> (Self, ProducerReturns) {
        let (returns, producer_returns) = return_channel(return_capacity);
        let pool = Self {
            free: Mutex::new(FreeList::default()),
            returns,
            max_outstanding_bytes,
            grown: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        };
        (pool, producer_returns)
    }

    /// Return a zeroed buffer of exactly `byte_size` bytes, tagged
    /// [`AllocationKind::OwnedByPool`].
    ///
    /// Reuses the smallest free storage that fits, otherwise grows the pool.
    /// Fails with `OutOfMemory` when the outstanding-bytes limit would be
    /// exceeded or the allocator cannot satisfy the request.
    pub fn allocate(&self, byte_size: usize) -> Result<Buffer> {
        let mut free = self.free.lock();

        let best_fit = free
            .storage
            .iter()
            .enumerate()
            .filter(|(_, s)| s.capacity() >= byte_size)
            .min_by_key(|(_, s)| s.capacity())
            .map(|(i, s)| (i, s.capacity()));

        let needed = best_fit.map(|(_, cap)| cap).unwrap_or(byte_size);
        if let Some(limit) = self.max_outstanding_bytes {
            if free.outstanding_bytes.saturating_add(needed) > limit {
                debug!(
                    "Pool limit reached: {} outstanding + {} requested > {}",
                    free.outstanding_bytes, needed, limit
                );
                return Err(PipelineError::OutOfMemory { requested: byte_size });
            }
        }

        let mut storage = match best_fit {
            Some((index, _)) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                free.storage.swap_remove(index)
            }
            None => {
                let mut storage = Vec::new();
                storage
                    .try_reserve_exact(byte_size)
                    .map_err(|_| PipelineError::OutOfMemory { requested: byte_size })?;
                self.grown.fetch_add(1, Ordering::Relaxed);
                trace!("Pool grew by {} bytes", byte_size);
                storage
            }
        };

        free.outstanding_bytes += storage.capacity();
        drop(free);

        storage.clear();
        storage.resize(byte_size, 0);
        Ok(Buffer::owned(storage))
    }

    /// Take a buffer back.
    ///
    /// Pool-owned storage goes to the free list; borrowed storage is handed
    /// back to the producer through [`ProducerReturns`].
    pub fn release(&self, buffer: Buffer) {
        match buffer.allocation_kind() {
            AllocationKind::OwnedByPool => {
                let capacity = buffer.storage_capacity();
                let storage = buffer.into_data();
                let mut free = self.free.lock();
                free.outstanding_bytes = free.outstanding_bytes.saturating_sub(capacity);
                free.storage.push(storage);
            }
            AllocationKind::BorrowedFromProducer => {
                self.returned.fetch_add(1, Ordering::Relaxed);
                if !self.returns.lock().push(buffer) {
                    debug!("Producer return ring full, parking borrowed buffer");
                }
            }
        }
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.free.lock().outstanding_bytes
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free.lock();
        PoolStats {
            outstanding_bytes: free.outstanding_bytes,
            free_buffers: free.storage.len(),
            grown: self.grown.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned_to_producer: self.returned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_owned_and_sized() {
        let (pool, _returns) = BufferPool::new(None, 4);
        let buffer = pool.allocate(100).unwrap();
        assert_eq!(buffer.allocation_kind(), AllocationKind::OwnedByPool);
        assert_eq!(buffer.byte_size(), 100);
        assert!(buffer.data().iter().all(|&b| b == 0));
        assert_eq!(pool.outstanding_bytes(), 100);
    }

    #[test]
    fn test_release_recycles_best_fit() {
        let (pool, _returns) = BufferPool::new(None, 4);
        let big = pool.allocate(4096).unwrap();
        let small = pool.allocate(512).unwrap();
        pool.release(big);
        pool.release(small);
        assert_eq!(pool.outstanding_bytes(), 0);

        let reused = pool.allocate(256).unwrap();
        assert_eq!(reused.storage_capacity(), 512);
        assert_eq!(reused.byte_size(), 256);

        let stats = pool.stats();
        assert_eq!(stats.grown, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.free_buffers, 1);
    }

    #[test]
    fn test_outstanding_limit() {
        let (pool, _returns) = BufferPool::new(Some(1000), 4);
        let first = pool.allocate(600).unwrap();
        assert!(matches!(
            pool.allocate(600),
            Err(PipelineError::OutOfMemory { requested: 600 })
        ));
        pool.release(first);
        assert!(pool.allocate(600).is_ok());
    }

    #[test]
    fn test_allocator_exhaustion_is_out_of_memory() {
        let (pool, _returns) = BufferPool::new(None, 4);
        assert!(matches!(
            pool.allocate(usize::MAX),
            Err(PipelineError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_borrowed_buffers_go_back_to_producer() {
        let (pool, mut returns) = BufferPool::new(None, 4);
        let mut lent = Buffer::borrowed(vec![7; 32]);
        lent.stamp(0, 8, 48_000);
        pool.release(lent);

        assert_eq!(pool.stats().free_buffers, 0);
        assert_eq!(pool.stats().returned_to_producer, 1);
        let back = returns.try_recv().unwrap();
        assert_eq!(back.allocation_kind(), AllocationKind::BorrowedFromProducer);
        assert_eq!(back.data(), &[7; 32][..]);
        assert!(returns.try_recv().is_none());
    }
}
