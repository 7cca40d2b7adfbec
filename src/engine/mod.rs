pub mod buffer;
pub mod clock;
pub mod config;
pub mod decoder;
pub mod dsp;
pub mod error;
pub mod fixed;
pub mod format;
pub mod negotiate;
pub mod output;
pub mod player;
pub mod queue;
pub mod session;

/// Presentation time in microseconds.
pub type Timestamp = i64;

pub use buffer::{AllocationKind, Buffer, BufferPool, ProducerReturns};
pub use config::{EngineConfig, FormatChangePolicy};
pub use error::{PipelineError, Result};
pub use fixed::Fixed32;
pub use format::{Channels, Encoding, FormatDescriptor, SinkCapabilities};
pub use negotiate::{ConversionPlan, FormatNegotiator, SwitchState};
pub use output::{AudioOutput, OutputHost};
pub use player::Player;
pub use session::{
    InputHandle, NextBuffer, OutputSession, PipelineEvent, SessionConsumer, StatsSnapshot,
    SubmitOutcome,
};
