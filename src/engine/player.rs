//! File player: decodes on a producer thread and feeds an output session.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info};

use crate::engine::decoder::{AudioDecoder, SymphoniaDecoder};
use crate::engine::dsp::{Converter, DriftCorrector, GainControl};
use crate::engine::error::{PipelineError, Result};
use crate::engine::format::pcm::encode_f32;
use crate::engine::format::{frames_to_micros, FormatDescriptor};
use crate::engine::session::{InputHandle, OutputSession, SubmitOutcome};
use crate::engine::Timestamp;

enum DecoderCommand {
    Seek(f64),
    Stop,
}

pub struct Player {
    session: Arc<OutputSession>,
    gain: GainControl,
    decode_thread: Option<JoinHandle<Result<()>>>,
    is_decoding: Arc<AtomicBool>,
    frames_submitted: Arc<AtomicU64>,
    command_tx: Option<Sender<DecoderCommand>>,
}

impl Player {
    pub fn new(session: Arc<OutputSession>, volume: u8) -> Self {
        Self {
            session,
            gain: GainControl::new(volume),
            decode_thread: None,
            is_decoding: Arc::new(AtomicBool::new(false)),
            frames_submitted: Arc::new(AtomicU64::new(0)),
            command_tx: None,
        }
    }

    /// Start playing `path` from the beginning.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.stop();
        let decoder = SymphoniaDecoder::open(path)?;
        self.play(Box::new(decoder))
    }

    /// Start playing from any decoder.
    pub fn play(&mut self, decoder: Box<dyn AudioDecoder>) -> Result<()> {
        self.stop();

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut producer = Producer::open(
            self.session.clone(),
            decoder,
            self.gain.clone(),
            self.frames_submitted.clone(),
        )?;
        let is_decoding = self.is_decoding.clone();
        is_decoding.store(true, Ordering::SeqCst);
        self.frames_submitted.store(0, Ordering::Relaxed);

        let handle = thread::Builder::new()
            .name("aout-producer".into())
            .spawn(move || {
                let result = producer.run(&rx);
                producer.finish();
                is_decoding.store(false, Ordering::SeqCst);
                if let Err(e) = &result {
                    error!("Producer stopped: {}", e);
                }
                result
            })?;

        self.command_tx = Some(tx);
        self.decode_thread = Some(handle);
        Ok(())
    }

    pub fn seek(&self, time_secs: f64) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(DecoderCommand::Seek(time_secs));
        }
    }

    /// Stop decoding and drop whatever is queued.
    pub fn stop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(DecoderCommand::Stop);
        }
        if self.decode_thread.is_some() {
            self.session.interrupt_input();
        }
        if let Some(handle) = self.decode_thread.take() {
            let _ = handle.join();
        }
        self.is_decoding.store(false, Ordering::SeqCst);
    }

    /// Block until the producer has submitted everything and the queue drained.
    pub fn wait(&mut self) -> Result<()> {
        self.command_tx = None;
        match self.decode_thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| PipelineError::InvalidState("producer thread panicked".into()))?,
            None => Ok(()),
        }
    }

    pub fn is_decoding(&self) -> bool {
        self.is_decoding.load(Ordering::Relaxed)
    }

    /// Stream time handed to the session so far, in frames of the sink rate
    /// before drift correction.
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn gain(&self) -> GainControl {
        self.gain.clone()
    }

    pub fn session(&self) -> &Arc<OutputSession> {
        &self.session
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decoder side of the pipeline. Runs on the producer thread.
struct Producer {
    session: Arc<OutputSession>,
    decoder: Box<dyn AudioDecoder>,
    input: Option<InputHandle>,
    source: FormatDescriptor,
    sink: FormatDescriptor,
    converter: Converter,
    drift: DriftCorrector,
    gain: GainControl,
    /// Presentation time of frame zero of the current stream.
    origin: Timestamp,
    frames: u64,
    frames_submitted: Arc<AtomicU64>,
    converted: Vec<f32>,
    corrected: Vec<f32>,
    bytes: Vec<u8>,
}

impl Producer {
    fn open(
        session: Arc<OutputSession>,
        decoder: Box<dyn AudioDecoder>,
        gain: GainControl,
        frames_submitted: Arc<AtomicU64>,
    ) -> Result<Self> {
        let source = decoder.format();
        let input = session.open_input(source)?;
        let sink = input.sink_format();
        info!("Playing {} as {} ({:?})", source, sink, input.plan());

        let converter = Converter::new(&source, &sink)?;
        let channels = sink.channels.count().unwrap_or(2) as usize;
        Ok(Self {
            session,
            decoder,
            input: Some(input),
            source,
            sink,
            converter,
            drift: DriftCorrector::new(channels),
            gain,
            origin: 0,
            frames: 0,
            frames_submitted,
            converted: Vec::new(),
            corrected: Vec::new(),
            bytes: Vec::new(),
        })
    }

    fn run(&mut self, commands: &Receiver<DecoderCommand>) -> Result<()> {
        loop {
            match commands.try_recv() {
                Ok(DecoderCommand::Seek(time_secs)) => self.seek(time_secs)?,
                Ok(DecoderCommand::Stop) => return Ok(()),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            self.converted.clear();
            match self.decoder.decode_next()? {
                Some(samples) => {
                    let mut converted = std::mem::take(&mut self.converted);
                    self.converter.process(&samples, &mut converted)?;
                    let result = self.submit(&converted);
                    self.converted = converted;
                    if !result? {
                        return Ok(());
                    }
                }
                None => {
                    let mut converted = std::mem::take(&mut self.converted);
                    self.converter.flush(&mut converted)?;
                    self.submit(&converted)?;
                    if let Some(input) = &self.input {
                        if !self.session.drain_input(input) {
                            debug!("Queue not drained at end of stream");
                        }
                    }
                    info!("End of stream after {} frames", self.frames);
                    return Ok(());
                }
            }
        }
    }

    /// Submit converted samples. Returns false once the stream was closed
    /// under us.
    fn submit(&mut self, samples: &[f32]) -> Result<bool> {
        let Some(input) = &self.input else {
            return Ok(false);
        };
        let channels = self.sink.channels.count().unwrap_or(2) as usize;

        self.drift.set_factor(self.session.correction_factor());
        self.corrected.clear();
        self.drift.process(samples, &mut self.corrected);
        self.gain.apply(&mut self.corrected);

        // Stamped on the uncorrected timeline; correction only changes the
        // rendered length.
        let source_frames = samples.len() / channels;
        let start = self.origin + frames_to_micros(self.frames as usize, self.sink.rate);
        self.frames += source_frames as u64;
        let end = self.origin + frames_to_micros(self.frames as usize, self.sink.rate);

        let frames = self.corrected.len() / channels;
        if frames == 0 || end <= start {
            return Ok(true);
        }
        self.bytes.clear();
        encode_f32(self.sink.encoding, &self.corrected[..frames * channels], &mut self.bytes)?;

        let mut buffer = self.session.allocate_buffer(self.bytes.len())?;
        buffer.data_mut().copy_from_slice(&self.bytes);
        buffer.stamp_span(start, frames, self.sink.rate, end - start);

        match self.session.submit_buffer(input, buffer) {
            Ok(SubmitOutcome::Queued) => {
                self.frames_submitted
                    .fetch_add(source_frames as u64, Ordering::Relaxed);
                Ok(true)
            }
            Ok(outcome) => {
                debug!("Buffer at {}us not queued: {:?}", start, outcome);
                Ok(true)
            }
            Err(PipelineError::StreamClosed) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Jump to `time_secs`: drop queued audio and restart the stream timeline.
    fn seek(&mut self, time_secs: f64) -> Result<()> {
        let frame = self.decoder.seek(time_secs)?;
        self.converter.reset();
        if let Some(input) = self.input.take() {
            self.session.close_input(input);
        }
        self.input = Some(self.session.open_input(self.source)?);
        self.origin = frames_to_micros(frame as usize, self.source.rate);
        self.frames = 0;
        debug!("Seeked to {:.3}s (frame {})", time_secs, frame);
        Ok(())
    }

    fn finish(&mut self) {
        if let Some(input) = self.input.take() {
            self.session.close_input(input);
        }
    }
}
