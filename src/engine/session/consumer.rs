//! Consumer side of a session: releases due buffers to the sink.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::events::{EventSink, PipelineEvent, PipelineStats};
use crate::engine::buffer::{Buffer, BufferPool};
use crate::engine::clock::{ClockSync, SilenceDecision};
use crate::engine::queue::{Dequeued, SynchronizedQueue};
use crate::engine::Timestamp;

const NO_TIME: Timestamp = Timestamp::MIN;

/// Answer to a consumer pull.
#[derive(Debug)]
pub enum NextBuffer {
    /// Render this buffer, then hand it back with [`SessionConsumer::release`].
    Buffer(Buffer),
    /// Nothing is due. `until` is the hardware time at which the queued head
    /// becomes due, if anything is queued.
    Silence { until: Option<Timestamp> },
}

/// Mapping from hardware time to the stream's timeline.
pub(crate) struct Timeline {
    /// `hardware - stream`, set by the first pull that finds a queued buffer.
    base: Option<Timestamp>,
    silence_since: Option<Timestamp>,
    pub(crate) sync: ClockSync,
}

impl Timeline {
    pub(crate) fn new(sync: ClockSync) -> Self {
        Self {
            base: None,
            silence_since: None,
            sync,
        }
    }

    fn reset(&mut self) {
        self.base = None;
        self.silence_since = None;
        self.sync.reset();
    }
}

/// State both execution contexts touch.
pub(crate) struct Shared {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) queue: SynchronizedQueue,
    pub(crate) timeline: Mutex<Timeline>,
    /// Stream time of the last consumer pull, `NO_TIME` until anchored.
    last_now: AtomicI64,
    pub(crate) input_open: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) silence_timeout: Timestamp,
    pub(crate) stats: PipelineStats,
    pub(crate) events: EventSink,
}

impl Shared {
    pub(crate) fn new(
        pool: Arc<BufferPool>,
        queue: SynchronizedQueue,
        sync: ClockSync,
        silence_timeout: Timestamp,
        events: EventSink,
    ) -> Self {
        Self {
            pool,
            queue,
            timeline: Mutex::new(Timeline::new(sync)),
            last_now: AtomicI64::new(NO_TIME),
            input_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            silence_timeout,
            stats: PipelineStats::default(),
            events,
        }
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        self.events.emit(event, &self.stats);
    }

    /// Stream time the consumer last rendered at, once a time base exists.
    pub(crate) fn stream_now(&self) -> Option<Timestamp> {
        match self.last_now.load(Ordering::Acquire) {
            NO_TIME => None,
            now => Some(now),
        }
    }

    /// Drop the time base; the next queued head becomes due immediately.
    pub(crate) fn reset_timeline(&self) {
        self.timeline.lock().reset();
        self.last_now.store(NO_TIME, Ordering::Release);
    }

    pub(crate) fn flush(&self) -> usize {
        let flushed = self.queue.flush();
        PipelineStats::add(&self.stats.flushed, flushed);
        flushed
    }

    /// Flush the queue and drop the time base. `due` is a buffer already
    /// taken off the queue; it is discarded and counted with the flush.
    fn hard_resync(&self, timeline: &mut Timeline, drift: Timestamp, due: Option<Buffer>) {
        let mut flushed = self.flush();
        if let Some(buffer) = due {
            self.pool.release(buffer);
            PipelineStats::bump(&self.stats.flushed);
            flushed += 1;
        }
        timeline.reset();
        self.last_now.store(NO_TIME, Ordering::Release);
        PipelineStats::bump(&self.stats.resyncs);
        warn!("Hard resync after {}us drift, {} buffers flushed", drift, flushed);
        self.emit(PipelineEvent::HardResync { drift, flushed });
    }
}

/// Handle the sink pulls buffers through. Cheap to clone.
#[derive(Clone)]
pub struct SessionConsumer {
    shared: Arc<Shared>,
}

impl SessionConsumer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Next buffer due at hardware time `hw_now` (microseconds). Never blocks
    /// on the producer.
    ///
    /// Late buffers are skipped and reported as underruns. Silence that lasts
    /// longer than the configured timeout lets the clock sync decide whether
    /// to keep waiting or to resync.
    pub fn next_due_buffer(&self, hw_now: Timestamp) -> NextBuffer {
        let shared = &self.shared;
        if !shared.input_open.load(Ordering::Acquire) {
            PipelineStats::bump(&shared.stats.silence_pulls);
            return NextBuffer::Silence { until: None };
        }

        let mut timeline = shared.timeline.lock();
        let base = match timeline.base {
            Some(base) => base,
            None => match shared.queue.next_due_at() {
                Some(head) => {
                    let base = hw_now - head;
                    debug!("Time base anchored: stream {}us at hardware {}us", head, hw_now);
                    timeline.base = Some(base);
                    base
                }
                None => {
                    PipelineStats::bump(&shared.stats.silence_pulls);
                    return NextBuffer::Silence { until: None };
                }
            },
        };
        let now = hw_now - base;
        shared.last_now.store(now, Ordering::Release);

        loop {
            match shared.queue.dequeue(now) {
                Dequeued::Ready(buffer) => {
                    timeline.silence_since = None;
                    if let Some(start) = buffer.start_time() {
                        let drift = timeline.sync.observe(start, now);
                        if timeline.sync.needs_resync() {
                            shared.hard_resync(&mut timeline, drift, Some(buffer));
                            return NextBuffer::Silence { until: None };
                        }
                    }
                    PipelineStats::bump(&shared.stats.played);
                    return NextBuffer::Buffer(buffer);
                }
                Dequeued::Underrun { start, end } => {
                    PipelineStats::bump(&shared.stats.underruns);
                    warn!("Underrun: buffer [{}, {}) ended before {}", start, end, now);
                    shared.emit(PipelineEvent::Underrun { start, end });
                    let drift = timeline.sync.observe(start, now);
                    if timeline.sync.needs_resync() {
                        shared.hard_resync(&mut timeline, drift, None);
                        return NextBuffer::Silence { until: None };
                    }
                }
                Dequeued::Empty => break,
            }
        }

        PipelineStats::bump(&shared.stats.silence_pulls);
        let since = *timeline.silence_since.get_or_insert(now);
        if now - since > shared.silence_timeout {
            match timeline.sync.on_silence(shared.queue.next_due_at(), now) {
                SilenceDecision::Resync => {
                    let drift = timeline.sync.drift();
                    shared.hard_resync(&mut timeline, drift, None);
                    return NextBuffer::Silence { until: None };
                }
                SilenceDecision::ContinueSilence => timeline.silence_since = Some(now),
            }
        }

        NextBuffer::Silence {
            until: shared.queue.next_due_at().map(|head| head + base),
        }
    }

    /// Hand a rendered buffer back to the pool.
    pub fn release(&self, buffer: Buffer) {
        self.shared.pool.release(buffer);
    }

    /// False once the session is closed; sinks may stop pulling.
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }
}
