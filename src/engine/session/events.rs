//! Pipeline events and counters.
//!
//! Events go out on a bounded channel and are dropped (but counted) when the
//! receiver falls behind; counters are always exact.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::engine::format::FormatDescriptor;
use crate::engine::negotiate::ConversionPlan;
use crate::engine::Timestamp;

/// Something the pipeline recovered from or changed on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    InputOpened {
        format: FormatDescriptor,
        plan: ConversionPlan,
    },
    InputClosed {
        flushed: usize,
    },
    FormatChanged {
        from: FormatDescriptor,
        to: FormatDescriptor,
        plan: ConversionPlan,
    },
    /// A buffer ended before it could be played and was skipped.
    Underrun {
        start: Timestamp,
        end: Timestamp,
    },
    /// Producer and sink timelines drifted apart; the queue was flushed.
    HardResync {
        drift: Timestamp,
        flushed: usize,
    },
    /// The stream was torn down after an invalid submission.
    StreamAborted {
        reason: String,
    },
    SinkRestarted {
        format: FormatDescriptor,
    },
    DeviceLost,
    DeviceRecovered,
}

pub(crate) struct EventSink {
    sender: Sender<PipelineEvent>,
}

impl EventSink {
    pub(crate) fn new(capacity: usize) -> (Self, Receiver<PipelineEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }

    /// Send without blocking; a full or disconnected channel drops the event.
    pub(crate) fn emit(&self, event: PipelineEvent, stats: &PipelineStats) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Live counters, updated from both execution contexts.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub(crate) submitted: AtomicU64,
    pub(crate) played: AtomicU64,
    pub(crate) underruns: AtomicU64,
    pub(crate) discarded_late: AtomicU64,
    pub(crate) flushed: AtomicU64,
    pub(crate) resyncs: AtomicU64,
    pub(crate) aborted_streams: AtomicU64,
    pub(crate) silence_pulls: AtomicU64,
    pub(crate) events_dropped: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            played: self.played.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            discarded_late: self.discarded_late.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            aborted_streams: self.aborted_streams.load(Ordering::Relaxed),
            silence_pulls: self.silence_pulls.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub played: u64,
    /// Buffers skipped because they ended before they were due, at submission
    /// or at the consumer.
    pub underruns: u64,
    /// Subset of `underruns` caught at submission.
    pub discarded_late: u64,
    pub flushed: u64,
    pub resyncs: u64,
    pub aborted_streams: u64,
    pub silence_pulls: u64,
    pub events_dropped: u64,
}
