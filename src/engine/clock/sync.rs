//! Producer/sink clock reconciliation.
//!
//! Each observation pairs a producer timestamp with the sink time at which it
//! was rendered. The first observation after a reset anchors the offset; later
//! ones measure drift against that anchor.

use tracing::{debug, warn};

use crate::engine::config::EngineConfig;
use crate::engine::fixed::{Fixed32, FIXED32_ONE};
use crate::engine::Timestamp;

/// What the consumer does after emitting silence for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceDecision {
    ContinueSilence,
    Resync,
}

#[derive(Debug, Clone)]
pub struct ClockSync {
    deadband: f64,
    max_drift: Timestamp,
    ewma_weight: f64,
    correction_window: f64,
    max_correction: f64,
    anchor: Option<Timestamp>,
    drift: Timestamp,
    avg_drift: f64,
    resync_pending: bool,
    observations: u64,
}

impl ClockSync {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            deadband: (config.sync_deadband_ms * 1000) as f64,
            max_drift: config.max_drift(),
            ewma_weight: config.sync_ewma_weight,
            correction_window: (config.correction_window_ms * 1000) as f64,
            max_correction: config.max_correction,
            anchor: None,
            drift: 0,
            avg_drift: 0.0,
            resync_pending: false,
            observations: 0,
        }
    }

    /// Record that `producer_ts` was rendered at `sink_time`. Returns the
    /// accumulated drift in microseconds.
    ///
    /// Positive drift means the producer timeline runs ahead of the sink.
    pub fn observe(&mut self, producer_ts: Timestamp, sink_time: Timestamp) -> Timestamp {
        let offset = producer_ts - sink_time;
        let anchor = *self.anchor.get_or_insert(offset);
        self.drift = offset - anchor;
        self.avg_drift += self.ewma_weight * (self.drift as f64 - self.avg_drift);
        self.observations += 1;

        if self.drift.abs() > self.max_drift && !self.resync_pending {
            warn!(
                "Drift {}us exceeds {}us, hard resync required",
                self.drift, self.max_drift
            );
            self.resync_pending = true;
        }
        self.drift
    }

    /// Smoothed rate multiplier for the producer's output.
    ///
    /// Exactly `FIXED32_ONE` inside the deadband; above one when the producer
    /// timeline runs ahead, below one when it lags.
    pub fn correction_factor(&self) -> Fixed32 {
        if self.avg_drift.abs() <= self.deadband {
            return FIXED32_ONE;
        }
        let ratio = (self.avg_drift / self.correction_window)
            .clamp(-self.max_correction, self.max_correction);
        Fixed32::from_f64(1.0 + ratio)
    }

    pub fn needs_resync(&self) -> bool {
        self.resync_pending
    }

    pub fn drift(&self) -> Timestamp {
        self.drift
    }

    pub fn average_drift(&self) -> f64 {
        self.avg_drift
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    /// Decide what to do after silence outlasted the timeout.
    ///
    /// `next_due` is the start of the queued head, if any. A head further in
    /// the future than the drift limit means the timelines fell apart.
    pub fn on_silence(&mut self, next_due: Option<Timestamp>, now: Timestamp) -> SilenceDecision {
        if self.resync_pending {
            return SilenceDecision::Resync;
        }
        match next_due {
            Some(start) if start - now > self.max_drift => {
                debug!("Queued head {}us ahead after silence", start - now);
                self.resync_pending = true;
                SilenceDecision::Resync
            }
            _ => SilenceDecision::ContinueSilence,
        }
    }

    /// Forget the anchor and averages. Called after a hard resync or when a
    /// new stream opens.
    pub fn reset(&mut self) {
        self.anchor = None;
        self.drift = 0;
        self.avg_drift = 0.0;
        self.resync_pending = false;
        self.observations = 0;
    }
}
