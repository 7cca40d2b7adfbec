//! Format negotiation between a producer stream and the sink.

pub mod switch;

use tracing::debug;

use crate::engine::error::{PipelineError, Result};
use crate::engine::format::{Channels, EncodingClass, FormatDescriptor, SinkCapabilities};

pub use switch::{PassthroughSwitch, SwitchState};

/// How buffers of a stream reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPlan {
    /// The sink renders the input format as is.
    Identity,
    /// Rate, channel or sample-format conversion to `target` is needed.
    Resample(FormatDescriptor),
    /// Compressed bitstream forwarded verbatim.
    Passthrough,
}

impl ConversionPlan {
    /// Format the sink will be driven with for a stream in `input` format.
    pub fn output_format(&self, input: &FormatDescriptor) -> FormatDescriptor {
        match self {
            ConversionPlan::Identity | ConversionPlan::Passthrough => *input,
            ConversionPlan::Resample(target) => *target,
        }
    }
}

/// Decides how an input format is carried to a sink.
#[derive(Debug, Clone)]
pub struct FormatNegotiator {
    caps: SinkCapabilities,
}

impl FormatNegotiator {
    pub fn new(caps: SinkCapabilities) -> Self {
        Self { caps }
    }

    pub fn capabilities(&self) -> &SinkCapabilities {
        &self.caps
    }

    /// Pick a conversion plan for `input`.
    ///
    /// Bitstreams pass through only if the sink advertises that exact
    /// encoding. PCM is used as is when a sink format is identical, otherwise
    /// converted to the closest PCM format the sink offers.
    pub fn negotiate(&self, input: &FormatDescriptor) -> Result<ConversionPlan> {
        input.validate()?;

        if input.is_bitstream() {
            return if self.caps.supports_encoding(input.encoding) {
                debug!("Negotiated passthrough for {}", input);
                Ok(ConversionPlan::Passthrough)
            } else {
                Err(PipelineError::UnsupportedFormat(*input))
            };
        }

        if self.caps.iter().any(|cap| cap.is_identical(input)) {
            debug!("Negotiated identity for {}", input);
            return Ok(ConversionPlan::Identity);
        }

        let target = self
            .caps
            .iter()
            .filter(|cap| cap.encoding.class() == EncodingClass::Pcm)
            .min_by_key(|cap| {
                (
                    cap.rate.abs_diff(input.rate),
                    channel_distance(cap.channels, input.channels),
                    cap.encoding != input.encoding,
                )
            })
            .ok_or(PipelineError::UnsupportedFormat(*input))?
            .materialize(input.channels);

        debug!("Negotiated conversion {} -> {}", input, target);
        Ok(ConversionPlan::Resample(target))
    }

    /// Concrete format to drive the sink with once `plan` was chosen for
    /// `input`. A wildcard channel count takes the sink's count for that
    /// encoding and rate, or stereo if the sink is a wildcard too.
    pub fn sink_format(&self, input: &FormatDescriptor, plan: &ConversionPlan) -> FormatDescriptor {
        let format = plan.output_format(input);
        if format.channels.count().is_some() {
            return format;
        }
        let sink_channels = self
            .caps
            .iter()
            .find(|cap| cap.encoding == format.encoding && cap.rate == format.rate)
            .map(|cap| cap.channels)
            .unwrap_or(Channels::Any);
        format
            .materialize(sink_channels)
            .materialize(Channels::Count(2))
    }
}

fn channel_distance(a: Channels, b: Channels) -> u16 {
    match (a, b) {
        (Channels::Count(a), Channels::Count(b)) => a.abs_diff(b),
        _ => 0,
    }
}
