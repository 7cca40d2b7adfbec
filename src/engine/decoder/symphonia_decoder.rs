use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

use crate::engine::decoder::AudioDecoder;
use crate::engine::error::{PipelineError, Result};
use crate::engine::format::{Encoding, FormatDescriptor};

pub struct SymphoniaDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: FormatDescriptor,
    duration: Option<f64>,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl SymphoniaDecoder {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path_ref.extension().and_then(|s| s.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| PipelineError::Decode(format!("{}: {}", path_ref.display(), e)))?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PipelineError::Decode("No supported audio tracks found".into()))?;

        let track_id = track.id;
        let rate = track.codec_params.sample_rate.unwrap_or(44100);
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2);
        let format = FormatDescriptor::with_count(Encoding::Float32, rate, channels)?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        let duration = track
            .codec_params
            .n_frames
            .map(|frames| frames as f64 / rate as f64);

        debug!("Opened {} as {}", path_ref.display(), format);
        Ok(Self {
            reader,
            decoder,
            track_id,
            format,
            duration,
            sample_buf: None,
        })
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn decode_next(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(ref err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None)
                }
                Err(err) => return Err(PipelineError::Decode(err.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(audio_buf) => {
                    let spec = *audio_buf.spec();
                    let capacity = audio_buf.capacity() as u64;
                    let needed = capacity as usize * spec.channels.count();
                    if self.sample_buf.as_ref().is_some_and(|b| b.capacity() < needed) {
                        self.sample_buf = None;
                    }
                    let sample_buf = self
                        .sample_buf
                        .get_or_insert_with(|| SampleBuffer::<f32>::new(capacity, spec));
                    sample_buf.copy_interleaved_ref(audio_buf);
                    return Ok(Some(sample_buf.samples().to_vec()));
                }
                Err(Error::DecodeError(err)) => {
                    warn!("Skipping undecodable packet: {}", err);
                    continue;
                }
                Err(err) => return Err(PipelineError::Decode(err.to_string())),
            }
        }
    }

    fn format(&self) -> FormatDescriptor {
        self.format
    }

    fn seek(&mut self, time_secs: f64) -> Result<u64> {
        let seeked = self
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(time_secs),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| PipelineError::Decode(format!("seek to {time_secs:.3}s failed: {e}")))?;
        self.decoder.reset();
        Ok(seeked.required_ts)
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }
}
