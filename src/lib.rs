//! Timestamp-synchronized audio output pipeline.
//!
//! A producer opens an input stream on an [`OutputSession`], fills pool
//! buffers, stamps them with presentation times and submits them. The sink
//! pulls whatever is due against its hardware clock; gaps play as silence and
//! drift between the two clocks is reported back as a rate correction factor.

pub mod engine;

pub use engine::{
    Buffer, ConversionPlan, EngineConfig, FormatDescriptor, OutputSession, PipelineError,
    PipelineEvent, Player, Result, Timestamp,
};
