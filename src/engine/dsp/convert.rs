//! Producer-side execution of a `Resample(target)` plan.

use tracing::debug;

use crate::engine::dsp::resampler::Resampler;
use crate::engine::error::{PipelineError, Result};
use crate::engine::format::FormatDescriptor;

const RESAMPLER_CHUNK: usize = 1024;

/// Converts interleaved `f32` from one channel count and rate to another.
pub struct Converter {
    from_channels: usize,
    to_channels: usize,
    resampler: Option<Resampler>,
    remixed: Vec<f32>,
}

impl Converter {
    pub fn new(from: &FormatDescriptor, to: &FormatDescriptor) -> Result<Self> {
        let channel_count = |f: &FormatDescriptor| {
            f.channels
                .count()
                .map(usize::from)
                .ok_or_else(|| PipelineError::InvalidFormat(format!("{f}: channel count unset")))
        };
        let from_channels = channel_count(from)?;
        let to_channels = channel_count(to)?;

        let resampler = if from.rate != to.rate {
            debug!("Resampling {}Hz -> {}Hz", from.rate, to.rate);
            Some(Resampler::new(from.rate, to.rate, to_channels, RESAMPLER_CHUNK)?)
        } else {
            None
        };

        Ok(Self {
            from_channels,
            to_channels,
            resampler,
            remixed: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none() && self.from_channels == self.to_channels
    }

    /// Convert `input`, appending the result to `out`. Rate conversion works
    /// in chunks, so output may lag input until [`flush`](Self::flush).
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.remixed.clear();
        remix(input, self.from_channels, self.to_channels, &mut self.remixed);
        match &mut self.resampler {
            Some(resampler) => resampler.process(&self.remixed, out),
            None => {
                out.extend_from_slice(&self.remixed);
                Ok(())
            }
        }
    }

    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        match &mut self.resampler {
            Some(resampler) => resampler.flush(out),
            None => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
    }
}

/// Map interleaved frames from `from` to `to` channels.
///
/// Mono fans out to every channel; downmixing to mono averages; otherwise
/// channels are matched by index and missing ones are silent.
pub fn remix(input: &[f32], from: usize, to: usize, out: &mut Vec<f32>) {
    if from == to {
        out.extend_from_slice(input);
        return;
    }
    out.reserve(input.len() / from * to);
    for frame in input.chunks_exact(from) {
        match (from, to) {
            (1, _) => out.extend(std::iter::repeat(frame[0]).take(to)),
            (_, 1) => out.push(frame.iter().sum::<f32>() / from as f32),
            _ => out.extend((0..to).map(|ch| frame.get(ch).copied().unwrap_or(0.0))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::format::Encoding;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_remix() {
        let mut out = Vec::new();
        remix(&[0.5, -0.5], 1, 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);

        out.clear();
        remix(&[0.2, 0.4, 1.0, 0.0], 2, 1, &mut out);
        assert_eq!(out.len(), 2);
        assert_abs_diff_eq!(out[0], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.5, epsilon = 1e-6);

        out.clear();
        remix(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 6, 2, &mut out);
        assert_eq!(out, vec![0.1, 0.2]);
    }

    #[test]
    fn test_same_rate_conversion_is_immediate() {
        let from = FormatDescriptor::with_count(Encoding::Float32, 48_000, 1).unwrap();
        let to = FormatDescriptor::with_count(Encoding::S16Le, 48_000, 2).unwrap();
        let mut converter = Converter::new(&from, &to).unwrap();
        assert!(!converter.is_passthrough());

        let mut out = Vec::new();
        converter.process(&[0.25; 10], &mut out).unwrap();
        assert_eq!(out.len(), 20);
    }
}
