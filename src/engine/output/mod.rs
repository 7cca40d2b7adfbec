pub mod cpal_backend;
pub mod output_manager;

use crate::engine::error::Result;
use crate::engine::format::{FormatDescriptor, SinkCapabilities};
use crate::engine::session::SessionConsumer;

pub use cpal_backend::{CpalBackend, CpalHost};
pub use output_manager::OutputManager;

/// A playback sink.
///
/// The sink pulls due buffers from the [`SessionConsumer`] it is started with,
/// on its own execution context, and releases them once rendered.
pub trait AudioOutput: Send {
    /// Formats the sink can render.
    fn capabilities(&self) -> SinkCapabilities;

    /// Starts rendering in `format`, pulling from `consumer`.
    fn start(&mut self, consumer: SessionConsumer, format: FormatDescriptor) -> Result<()>;

    /// Pauses the audio output stream. The hardware clock holds still.
    fn pause(&mut self) -> Result<()>;

    /// Resumes a paused stream.
    fn resume(&mut self) -> Result<()>;

    /// Stops rendering and drops the consumer. Idempotent.
    fn stop(&mut self);

    /// False once the device reported an error or went away.
    fn is_healthy(&self) -> bool;

    fn name(&self) -> String;
}

/// Opens sinks. One call is one attempt; retries are the session's business.
pub trait OutputHost: Send + Sync {
    fn open_output(&self) -> Result<Box<dyn AudioOutput>>;
}
