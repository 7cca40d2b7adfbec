pub mod symphonia_decoder;

use crate::engine::error::Result;
use crate::engine::format::FormatDescriptor;

pub use symphonia_decoder::SymphoniaDecoder;

/// A source of interleaved `f32` audio for the bundled player.
pub trait AudioDecoder: Send {
    /// Decodes the next block of interleaved samples.
    /// Returns `Ok(None)` at the end of the stream.
    fn decode_next(&mut self) -> Result<Option<Vec<f32>>>;

    /// Format of the decoded samples (`Float32`, source rate and channels).
    fn format(&self) -> FormatDescriptor;

    /// Seeks to `time_secs`; returns the frame position actually reached.
    fn seek(&mut self, time_secs: f64) -> Result<u64>;

    /// Returns the total duration of the audio in seconds, if known.
    fn duration(&self) -> Option<f64>;
}
