use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};

use crate::engine::error::{PipelineError, Result};

fn resample_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Resample(e.to_string())
}

/// Rate converter for interleaved `f32`, fed in arbitrary block sizes.
pub struct Resampler {
    resampler: Fft<f32>,
    channels: usize,
    chunk_size: usize,
    pending: Vec<f32>,
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        channels: usize,
        chunk_size: usize,
    ) -> Result<Self> {
        let resampler = Fft::<f32>::new(
            source_rate as usize,
            target_rate as usize,
            chunk_size,
            2,
            channels,
            FixedSync::Input,
        )
        .map_err(resample_err)?;

        Ok(Self {
            resampler,
            channels,
            chunk_size,
            pending: Vec::with_capacity(chunk_size * channels),
            input: vec![vec![0.0; chunk_size]; channels],
            output: vec![Vec::new(); channels],
        })
    }

    /// Resample `input`, appending whatever full chunks are ready to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_size * self.channels;

        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk = &self.pending[consumed..consumed + chunk_samples];
            for (i, frame) in chunk.chunks_exact(self.channels).enumerate() {
                for (ch, &sample) in frame.iter().enumerate() {
                    self.input[ch][i] = sample;
                }
            }
            consumed += chunk_samples;

            let out_len = self.resampler.output_frames_next();
            for channel in &mut self.output {
                channel.clear();
                channel.resize(out_len, 0.0);
            }

            let input_adapter =
                SequentialSliceOfVecs::new(&self.input, self.channels, self.chunk_size)
                    .map_err(resample_err)?;
            let mut output_adapter =
                SequentialSliceOfVecs::new_mut(&mut self.output, self.channels, out_len)
                    .map_err(resample_err)?;
            self.resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, None)
                .map_err(resample_err)?;

            out.reserve(out_len * self.channels);
            for i in 0..out_len {
                for channel in &self.output {
                    out.push(channel[i]);
                }
            }
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Pad the last partial chunk with silence and resample it.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let remaining_frames = self.pending.len() / self.channels;
        let padding = (self.chunk_size - remaining_frames) * self.channels;
        self.pending.resize(self.pending.len() + padding, 0.0);
        self.process(&[], out)
    }

    /// Drop buffered input, e.g. after a seek.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}
