//! Error types for the output pipeline.

use thiserror::Error;

use crate::engine::format::FormatDescriptor;
use crate::engine::Timestamp;

/// Errors surfaced by the output pipeline.
///
/// Underruns and hard resyncs are recovered locally and never show up here;
/// they are reported as [`PipelineEvent`](crate::engine::session::PipelineEvent)s
/// and counted in the session statistics.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No sink descriptor can carry the input's encoding class.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(FormatDescriptor),

    /// Buffer interval overlaps one that is already queued.
    #[error("Overlapping buffer: [{start}, {end}) collides with a queued buffer")]
    OverlappingBuffer { start: Timestamp, end: Timestamp },

    /// Buffer or descriptor does not satisfy the stream format.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Allocator exhaustion or outstanding-bytes policy exceeded.
    #[error("Out of memory: cannot allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// No playback sink could be opened.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Operation not valid in the current stream state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The stream was flushed or closed while the buffer was in transit.
    #[error("Stream closed")]
    StreamClosed,

    /// Configuration file loading or validation errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the bundled decoder.
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Errors reported by the bundled resampler.
    #[error("Resample error: {0}")]
    Resample(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;
