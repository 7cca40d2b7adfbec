//! Presentation-time ordered hand-off between producer and consumer.
//!
//! The producer side blocks when the queue holds more audio than the
//! configured maximum; the consumer side never blocks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::engine::buffer::{Buffer, BufferPool};
use crate::engine::error::PipelineError;
use crate::engine::Timestamp;

const NO_HEAD: Timestamp = Timestamp::MAX;

/// Result of a consumer pull.
#[derive(Debug)]
pub enum Dequeued {
    /// Head buffer, due now.
    Ready(Buffer),
    /// Head buffer ended before `now`; it went back to the pool unplayed.
    Underrun { start: Timestamp, end: Timestamp },
    /// Nothing queued, or the head is not due yet.
    Empty,
}

/// A buffer the queue refused, handed back to the caller with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub buffer: Buffer,
    pub error: PipelineError,
}

/// Position and size of a queued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpan {
    pub start: Timestamp,
    pub end: Timestamp,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub buffered: Timestamp,
    pub underruns: u64,
    pub flushed: u64,
}

struct QueueState {
    buffers: BTreeMap<Timestamp, Buffer>,
    /// Sum of queued buffer durations.
    buffered: Timestamp,
    /// Bumped by every flush so blocked producers notice.
    epoch: u64,
    closed: bool,
}

pub struct SynchronizedQueue {
    state: Mutex<QueueState>,
    space_available: Condvar,
    drained: Condvar,
    /// Start time of the head buffer, `NO_HEAD` when empty. Written under the lock.
    head_start: AtomicI64,
    max_buffered: Timestamp,
    pool: Arc<BufferPool>,
    underruns: AtomicU64,
    flushed: AtomicU64,
}

impl SynchronizedQueue {
    pub fn new(max_buffered: Timestamp, pool: Arc<BufferPool>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffers: BTreeMap::new(),
                buffered: 0,
                epoch: 0,
                closed: false,
            }),
            space_available: Condvar::new(),
            drained: Condvar::new(),
            head_start: AtomicI64::new(NO_HEAD),
            max_buffered,
            pool,
            underruns: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        }
    }

    /// Insert `buffer` in start-time order.
    ///
    /// Blocks while the queue is non-empty and adding the buffer would exceed
    /// the maximum buffered duration. A buffer overlapping a queued one is
    /// handed back with `OverlappingBuffer` and the queue is left unchanged.
    /// If the queue is flushed or closed while waiting, the buffer is handed
    /// back with `StreamClosed`.
    pub fn enqueue(&self, buffer: Buffer) -> Result<(), Rejected> {
        let Some((start, end)) = buffer.interval() else {
            return Err(Rejected {
                buffer,
                error: PipelineError::InvalidFormat("buffer has no presentation time".into()),
            });
        };

        let mut state = self.state.lock();
        let epoch = state.epoch;
        loop {
            if state.closed || state.epoch != epoch {
                return Err(Rejected {
                    buffer,
                    error: PipelineError::StreamClosed,
                });
            }
            if overlaps(&state.buffers, start, end) {
                return Err(Rejected {
                    buffer,
                    error: PipelineError::OverlappingBuffer { start, end },
                });
            }
            if state.buffers.is_empty() || state.buffered + (end - start) <= self.max_buffered {
                break;
            }
            trace!("Queue full ({}us buffered), producer waiting", state.buffered);
            self.space_available.wait(&mut state);
        }

        state.buffered += end - start;
        state.buffers.insert(start, buffer);
        self.publish_head(&state);
        Ok(())
    }

    /// Span of the head buffer if it is due at `now`.
    pub fn peek_due(&self, now: Timestamp) -> Option<BufferSpan> {
        let state = self.state.lock();
        let (_, head) = state.buffers.first_key_value()?;
        let (start, end) = head.interval()?;
        (start <= now).then_some(BufferSpan {
            start,
            end,
            byte_size: head.byte_size(),
        })
    }

    /// Start time of the head buffer, read without taking the lock.
    pub fn next_due_at(&self) -> Option<Timestamp> {
        match self.head_start.load(Ordering::Acquire) {
            NO_HEAD => None,
            start => Some(start),
        }
    }

    /// Remove the head if it is due at `now`. Never blocks.
    ///
    /// A head that already ended before `now` is discarded and reported as an
    /// underrun; a frame is never handed out for partial playback.
    pub fn dequeue(&self, now: Timestamp) -> Dequeued {
        let mut state = self.state.lock();
        let Some(entry) = state.buffers.first_entry() else {
            return Dequeued::Empty;
        };
        let (start, end) = entry
            .get()
            .interval()
            .unwrap_or((*entry.key(), *entry.key()));
        if start > now {
            return Dequeued::Empty;
        }
        let buffer = entry.remove();
        state.buffered -= end - start;
        self.publish_head(&state);
        self.space_available.notify_all();
        if state.buffers.is_empty() {
            self.drained.notify_all();
        }
        drop(state);

        if end < now {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            self.pool.release(buffer);
            return Dequeued::Underrun { start, end };
        }
        Dequeued::Ready(buffer)
    }

    /// Empty the queue, returning every buffer to the pool.
    ///
    /// Producers blocked in [`enqueue`](Self::enqueue) wake up and get their
    /// buffer back with `StreamClosed`.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let buffers = std::mem::take(&mut state.buffers);
        state.buffered = 0;
        state.epoch += 1;
        self.publish_head(&state);
        self.space_available.notify_all();
        self.drained.notify_all();
        drop(state);

        let count = buffers.len();
        for buffer in buffers.into_values() {
            self.pool.release(buffer);
        }
        if count > 0 {
            self.flushed.fetch_add(count as u64, Ordering::Relaxed);
            debug!("Flushed {} queued buffers", count);
        }
        count
    }

    /// Flush and refuse further buffers.
    pub fn close(&self) -> usize {
        self.state.lock().closed = true;
        self.flush()
    }

    /// Wait up to `timeout` for the consumer to empty the queue.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.buffers.is_empty() {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return state.buffers.is_empty();
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next_due_at().is_none()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queued: state.buffers.len(),
            buffered: state.buffered,
            underruns: self.underruns.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
        }
    }

    fn publish_head(&self, state: &QueueState) {
        let head = state
            .buffers
            .first_key_value()
            .map(|(start, _)| *start)
            .unwrap_or(NO_HEAD);
        self.head_start.store(head, Ordering::Release);
    }
}

/// True if `[start, end)` collides with any queued interval.
fn overlaps(buffers: &BTreeMap<Timestamp, Buffer>, start: Timestamp, end: Timestamp) -> bool {
    if buffers.contains_key(&start) {
        return true;
    }
    let before = buffers
        .range(..start)
        .next_back()
        .and_then(|(_, b)| b.end_time())
        .is_some_and(|prev_end| prev_end > start);
    let after = buffers
        .range(start..)
        .next()
        .is_some_and(|(next_start, _)| *next_start < end);
    before || after
}
