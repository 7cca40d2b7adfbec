use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tracing::{debug, error};

use crate::engine::buffer::Buffer;
use crate::engine::clock::{HardwareClock, PlaybackState};
use crate::engine::error::{PipelineError, Result};
use crate::engine::format::pcm::decode_to_f32;
use crate::engine::format::{
    frames_to_micros, micros_to_frames, Channels, Encoding, FormatDescriptor, SinkCapabilities,
};
use crate::engine::output::{AudioOutput, OutputHost};
use crate::engine::session::{NextBuffer, SessionConsumer};

const STANDARD_SAMPLE_RATES: [u32; 6] = [44_100, 48_000, 88_200, 96_000, 176_400, 192_000];

/// Opens the default output device, or the one with the given name.
#[derive(Debug, Clone, Default)]
pub struct CpalHost {
    device_name: Option<String>,
}

impl CpalHost {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl OutputHost for CpalHost {
    fn open_output(&self) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(CpalBackend::open(self.device_name.as_deref())?))
    }
}

pub struct CpalBackend {
    device: cpal::Device,
    device_id: String,
    follows_default: bool,
    caps: SinkCapabilities,
    stream: Option<Stream>,
    clock: Arc<HardwareClock>,
    is_healthy: Arc<AtomicBool>,
}

impl CpalBackend {
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| {
                    PipelineError::DeviceUnavailable(format!("no output device named '{name}'"))
                })?,
            None => host
                .default_output_device()
                .ok_or_else(|| PipelineError::DeviceUnavailable("No output device available".into()))?,
        };

        let device_id = device.name().unwrap_or_else(|_| "unknown".to_string());
        let caps = device_capabilities(&device)?;
        debug!("Device '{}' offers {} formats", device_id, caps.len());

        let default_rate = caps.iter().next().map(|f| f.rate).unwrap_or(48_000);
        Ok(Self {
            device,
            device_id,
            follows_default: device_name.is_none(),
            caps,
            stream: None,
            clock: Arc::new(HardwareClock::new(default_rate)),
            is_healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn clock(&self) -> Arc<HardwareClock> {
        self.clock.clone()
    }

    fn build_stream<T>(&self, config: &StreamConfig, mut renderer: Renderer) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32> + Send + 'static,
    {
        let is_healthy = self.is_healthy.clone();
        let err_fn = move |err: cpal::StreamError| {
            error!("Audio stream error: {}", err);
            is_healthy.store(false, Ordering::SeqCst);
        };

        self.device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| renderer.fill(data),
                err_fn,
                None,
            )
            .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))
    }
}

impl AudioOutput for CpalBackend {
    fn capabilities(&self) -> SinkCapabilities {
        self.caps.clone()
    }

    fn start(&mut self, consumer: SessionConsumer, format: FormatDescriptor) -> Result<()> {
        self.stop();

        let sample_format =
            sample_format_for(format.encoding).ok_or(PipelineError::UnsupportedFormat(format))?;
        let channels = format
            .channels
            .count()
            .ok_or_else(|| PipelineError::InvalidFormat(format!("{format}: channel count unset")))?;
        let config = StreamConfig {
            channels,
            sample_rate: format.rate,
            buffer_size: cpal::BufferSize::Default,
        };

        self.clock = Arc::new(HardwareClock::new(format.rate));
        let renderer = Renderer::new(consumer, self.clock.clone(), format);

        let stream = match sample_format {
            SampleFormat::F32 => self.build_stream::<f32>(&config, renderer)?,
            SampleFormat::I16 => self.build_stream::<i16>(&config, renderer)?,
            SampleFormat::U16 => self.build_stream::<u16>(&config, renderer)?,
            SampleFormat::I8 => self.build_stream::<i8>(&config, renderer)?,
            SampleFormat::U8 => self.build_stream::<u8>(&config, renderer)?,
            _ => return Err(PipelineError::UnsupportedFormat(format)),
        };

        self.clock.set_state(PlaybackState::Playing);
        stream
            .play()
            .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?;
        self.stream = Some(stream);
        debug!("Rendering {} on '{}'", format, self.device_id);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream
                .pause()
                .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?;
        }
        self.clock.set_state(PlaybackState::Paused);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        stream
            .play()
            .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?;
        self.clock.set_state(PlaybackState::Playing);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
        self.clock.set_state(PlaybackState::Stopped);
    }

    fn is_healthy(&self) -> bool {
        if !self.is_healthy.load(Ordering::SeqCst) {
            return false;
        }
        if self.follows_default {
            let host = cpal::default_host();
            if let Some(device) = host.default_output_device() {
                if let Ok(name) = device.name() {
                    if name != self.device_id {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn name(&self) -> String {
        self.device_id.clone()
    }
}

fn encoding_for(sample_format: SampleFormat) -> Option<Encoding> {
    match sample_format {
        SampleFormat::F32 => Some(Encoding::Float32),
        SampleFormat::I16 => Some(Encoding::S16_NE),
        SampleFormat::U16 => Some(Encoding::U16_NE),
        SampleFormat::I8 => Some(Encoding::S8),
        SampleFormat::U8 => Some(Encoding::U8),
        _ => None,
    }
}

fn sample_format_for(encoding: Encoding) -> Option<SampleFormat> {
    [
        SampleFormat::F32,
        SampleFormat::I16,
        SampleFormat::U16,
        SampleFormat::I8,
        SampleFormat::U8,
    ]
    .into_iter()
    .find(|&sf| encoding_for(sf) == Some(encoding))
}

/// Formats the device supports, the default configuration first.
fn device_capabilities(device: &cpal::Device) -> Result<SinkCapabilities> {
    let mut caps = SinkCapabilities::new();

    if let Ok(default) = device.default_output_config() {
        if let Some(encoding) = encoding_for(default.sample_format()) {
            if let Ok(format) =
                FormatDescriptor::with_count(encoding, default.sample_rate(), default.channels())
            {
                caps.insert(format);
            }
        }
    }

    let ranges = device
        .supported_output_configs()
        .map_err(|e| PipelineError::DeviceUnavailable(format!("Failed to get device configs: {e}")))?;
    for range in ranges {
        let Some(encoding) = encoding_for(range.sample_format()) else {
            continue;
        };
        for rate in STANDARD_SAMPLE_RATES {
            if rate >= range.min_sample_rate() && rate <= range.max_sample_rate() {
                caps.insert(FormatDescriptor {
                    encoding,
                    rate,
                    channels: Channels::Count(range.channels()),
                });
            }
        }
    }
    Ok(caps)
}

/// Audio-callback side of the backend: walks through due buffers with a
/// cursor and fills gaps with silence.
pub(crate) struct Renderer {
    consumer: SessionConsumer,
    clock: Arc<HardwareClock>,
    encoding: Encoding,
    channels: usize,
    current: Option<Buffer>,
    samples: Vec<f32>,
    cursor: usize,
    mix: Vec<f32>,
}

impl Renderer {
    pub(crate) fn new(
        consumer: SessionConsumer,
        clock: Arc<HardwareClock>,
        format: FormatDescriptor,
    ) -> Self {
        Self {
            consumer,
            clock,
            encoding: format.encoding,
            channels: format.channels.count().unwrap_or(2).max(1) as usize,
            current: None,
            samples: Vec::new(),
            cursor: 0,
            mix: Vec::new(),
        }
    }

    fn fill<T: Sample + FromSample<f32>>(&mut self, data: &mut [T]) {
        let mut mix = std::mem::take(&mut self.mix);
        mix.clear();
        mix.resize(data.len(), 0.0);
        self.render(&mut mix);
        for (out, &sample) in data.iter_mut().zip(mix.iter()) {
            *out = T::from_sample(sample);
        }
        self.mix = mix;
    }

    /// Fill `out` (interleaved) and advance the hardware clock by its length.
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        if self.clock.state() != PlaybackState::Playing {
            out.fill(0.0);
            return;
        }

        let rate = self.clock.sample_rate();
        let base = self.clock.frames() as usize;
        let mut written = 0;

        while written < out.len() {
            if self.current.is_some() {
                let n = (self.samples.len() - self.cursor).min(out.len() - written);
                out[written..written + n]
                    .copy_from_slice(&self.samples[self.cursor..self.cursor + n]);
                self.cursor += n;
                written += n;
                if self.cursor >= self.samples.len() {
                    if let Some(done) = self.current.take() {
                        self.consumer.release(done);
                    }
                }
                continue;
            }

            let now = frames_to_micros(base + written / self.channels, rate);
            match self.consumer.next_due_buffer(now) {
                NextBuffer::Buffer(buffer) => {
                    self.samples.clear();
                    self.cursor = 0;
                    let decoded = decode_to_f32(self.encoding, buffer.data(), &mut self.samples);
                    if decoded.is_err() || self.samples.is_empty() {
                        self.consumer.release(buffer);
                    } else {
                        self.current = Some(buffer);
                    }
                }
                NextBuffer::Silence { until } => {
                    let remaining = (out.len() - written) / self.channels;
                    let frames = match until {
                        Some(due) if due > now => {
                            micros_to_frames(due - now, rate).max(1).min(remaining)
                        }
                        _ => remaining,
                    };
                    let n = (frames * self.channels).clamp(1, out.len() - written);
                    out[written..written + n].fill(0.0);
                    written += n;
                }
            }
        }

        self.clock.advance((out.len() / self.channels) as u64);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Some(buffer) = self.current.take() {
            self.consumer.release(buffer);
        }
    }
}
