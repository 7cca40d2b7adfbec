pub mod pool;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

use crate::engine::format::frames_to_micros;
use crate::engine::Timestamp;

pub use pool::{BufferPool, PoolStats};

/// Who owns the storage behind a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// Allocated by the pool; recycled to its free list on release.
    OwnedByPool,
    /// Lent by the producer; handed back to it on release, never freed.
    BorrowedFromProducer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timing {
    start_time: Timestamp,
    rate: u32,
    /// Stream time covered, when it differs from the rendered length.
    span: Option<Timestamp>,
}

/// A block of audio moving from producer to consumer.
///
/// A buffer is always owned by exactly one party (pool, producer, queue or
/// consumer) and moves between them by value. `end_time` is derived from the
/// start time, sample count and rate unless the buffer was stamped with an
/// explicit span.
pub struct Buffer {
    data: Vec<u8>,
    allocation_kind: AllocationKind,
    sample_count: usize,
    timing: Option<Timing>,
}

impl Buffer {
    pub(crate) fn owned(data: Vec<u8>) -> Self {
        Self {
            data,
            allocation_kind: AllocationKind::OwnedByPool,
            sample_count: 0,
            timing: None,
        }
    }

    /// Wrap producer-owned storage. The pool hands it back on release.
    pub fn borrowed(data: Vec<u8>) -> Self {
        Self {
            data,
            allocation_kind: AllocationKind::BorrowedFromProducer,
            sample_count: 0,
            timing: None,
        }
    }

    /// Set the presentation time and length of the buffer.
    ///
    /// `sample_count` is in frames (one sample per channel).
    pub fn stamp(&mut self, start_time: Timestamp, sample_count: usize, rate: u32) {
        self.sample_count = sample_count;
        self.timing = Some(Timing {
            start_time,
            rate,
            span: None,
        });
    }

    /// Like [`stamp`](Self::stamp), for a buffer whose `sample_count` frames
    /// cover `span` microseconds of stream time. Drift correction stretches
    /// or shrinks the rendered audio without moving it on the timeline.
    pub fn stamp_span(
        &mut self,
        start_time: Timestamp,
        sample_count: usize,
        rate: u32,
        span: Timestamp,
    ) {
        self.sample_count = sample_count;
        self.timing = Some(Timing {
            start_time,
            rate,
            span: Some(span),
        });
    }

    pub fn allocation_kind(&self) -> AllocationKind {
        self.allocation_kind
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shrink the payload to `len` bytes. Capacity is kept.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn rate(&self) -> Option<u32> {
        self.timing.map(|t| t.rate)
    }

    pub fn start_time(&self) -> Option<Timestamp> {
        self.timing.map(|t| t.start_time)
    }

    pub fn duration(&self) -> Timestamp {
        self.timing
            .map(|t| {
                t.span
                    .unwrap_or_else(|| frames_to_micros(self.sample_count, t.rate))
            })
            .unwrap_or(0)
    }

    pub fn end_time(&self) -> Option<Timestamp> {
        self.start_time().map(|start| start + self.duration())
    }

    /// `[start_time, end_time)` once the buffer has been stamped.
    pub fn interval(&self) -> Option<(Timestamp, Timestamp)> {
        Some((self.start_time()?, self.end_time()?))
    }

    /// Take the storage back out of the buffer.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn storage_capacity(&self) -> usize {
        self.data.capacity()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("allocation_kind", &self.allocation_kind)
            .field("byte_size", &self.byte_size())
            .field("sample_count", &self.sample_count)
            .field("start_time", &self.start_time())
            .field("end_time", &self.end_time())
            .finish()
    }
}

/// Pool side of the hand-back path for borrowed buffers.
///
/// Borrowed buffers that do not fit in the ring wait in `overflow` until the
/// producer makes room; they are never dropped.
struct ReturnSide {
    ring: HeapProd<Buffer>,
    overflow: std::collections::VecDeque<Buffer>,
}

impl ReturnSide {
    fn push(&mut self, buffer: Buffer) -> bool {
        while let Some(pending) = self.overflow.pop_front() {
            if let Err(pending) = self.ring.try_push(pending) {
                self.overflow.push_front(pending);
                break;
            }
        }
        if self.overflow.is_empty() {
            match self.ring.try_push(buffer) {
                Ok(()) => return true,
                Err(buffer) => self.overflow.push_back(buffer),
            }
        } else {
            self.overflow.push_back(buffer);
        }
        false
    }
}

/// Producer handle receiving its borrowed buffers back from the pool.
pub struct ProducerReturns {
    ring: HeapCons<Buffer>,
    side: Arc<Mutex<ReturnSide>>,
}

impl ProducerReturns {
    /// Next buffer handed back, if any. Never blocks.
    pub fn try_recv(&mut self) -> Option<Buffer> {
        if let Some(buffer) = self.ring.try_pop() {
            return Some(buffer);
        }
        self.side.lock().overflow.pop_front()
    }

    /// Number of buffers waiting to be collected.
    pub fn pending(&self) -> usize {
        self.ring.occupied_len() + self.side.lock().overflow.len()
    }
}

/// Creates the hand-back path with room for `capacity` buffers in the ring.
fn return_channel(capacity: usize) -> (Arc<Mutex<ReturnSide>>, ProducerReturns) {
    let rb = HeapRb::<Buffer>::new(capacity);
    let (prod, cons) = rb.split();
    let side = Arc::new(Mutex::new(ReturnSide {
        ring: prod,
        overflow: std::collections::VecDeque::new(),
    }));
    (
        side.clone(),
        ProducerReturns {
            ring: cons,
            side,
        },
    )
}
