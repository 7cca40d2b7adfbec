//! Engine configuration
//!
//! All settings have built-in defaults, so an empty TOML file (or no file at
//! all) yields a working configuration:
//!
//! ```toml
//! max_buffered_ms = 500
//! max_outstanding_bytes = 8388608
//! max_drift_ms = 300
//! format_change_policy = "drain"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::error::{PipelineError, Result};
use crate::engine::Timestamp;

/// What happens to queued buffers when the producer changes format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FormatChangePolicy {
    /// Flush the queue immediately.
    #[default]
    Discard,
    /// Let the consumer play out what is queued (bounded by `drain_timeout_ms`),
    /// then flush whatever is left.
    Drain,
}

/// Output pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Producer blocks once queued audio would exceed this duration.
    pub max_buffered_ms: u64,

    /// Upper bound on pool bytes handed out and not yet released.
    /// `None` lets the pool grow until the allocator fails.
    pub max_outstanding_bytes: Option<usize>,

    /// Capacity of the ring that hands borrowed buffers back to the producer.
    pub producer_return_capacity: usize,

    /// Accumulated drift that triggers a hard resync.
    pub max_drift_ms: u64,

    /// Averaged drift below this yields a neutral correction factor.
    pub sync_deadband_ms: u64,

    /// Weight of a new sample in the drift moving average (0, 1].
    pub sync_ewma_weight: f64,

    /// Time over which the correction factor tries to absorb the drift.
    pub correction_window_ms: u64,

    /// Largest relative speed change the correction factor may request.
    pub max_correction: f64,

    /// Silence longer than this makes the consumer consult the clock sync.
    pub silence_timeout_ms: u64,

    /// Attempts to open the sink before giving up with `DeviceUnavailable`.
    pub reopen_attempts: u32,

    pub format_change_policy: FormatChangePolicy,

    pub drain_timeout_ms: u64,

    /// Capacity of the event channel; overflowing events are dropped but
    /// still counted in the statistics.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_buffered_ms: 1000,
            max_outstanding_bytes: None,
            producer_return_capacity: 64,
            max_drift_ms: 500,
            sync_deadband_ms: 2,
            sync_ewma_weight: 0.1,
            correction_window_ms: 2000,
            max_correction: 0.005,
            silence_timeout_ms: 200,
            reopen_attempts: 3,
            format_change_policy: FormatChangePolicy::Discard,
            drain_timeout_ms: 1000,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_ms == 0 {
            return Err(PipelineError::Config("max_buffered_ms must be > 0".into()));
        }
        if !(self.sync_ewma_weight > 0.0 && self.sync_ewma_weight <= 1.0) {
            return Err(PipelineError::Config(format!(
                "sync_ewma_weight must be in (0, 1], got {}",
                self.sync_ewma_weight
            )));
        }
        if !(0.0..1.0).contains(&self.max_correction) {
            return Err(PipelineError::Config(format!(
                "max_correction must be in [0, 1), got {}",
                self.max_correction
            )));
        }
        if self.correction_window_ms == 0 {
            return Err(PipelineError::Config("correction_window_ms must be > 0".into()));
        }
        if self.reopen_attempts == 0 {
            return Err(PipelineError::Config("reopen_attempts must be >= 1".into()));
        }
        if self.producer_return_capacity == 0 || self.event_capacity == 0 {
            return Err(PipelineError::Config(
                "producer_return_capacity and event_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn max_buffered(&self) -> Timestamp {
        ms_to_micros(self.max_buffered_ms)
    }

    pub fn max_drift(&self) -> Timestamp {
        ms_to_micros(self.max_drift_ms)
    }

    pub fn silence_timeout(&self) -> Timestamp {
        ms_to_micros(self.silence_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn ms_to_micros(ms: u64) -> Timestamp {
    (ms as Timestamp).saturating_mul(1000)
}
