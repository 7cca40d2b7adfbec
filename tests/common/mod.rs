//! Test fixtures: an in-memory sink host with manual pull control.
//!
//! The fake sink never renders on its own. Tests grab the consumer it was
//! started with and pull at whatever hardware time they like.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use audio_output_engine::engine::output::{AudioOutput, OutputHost};
use audio_output_engine::engine::session::{InputHandle, PipelineEvent};
use audio_output_engine::engine::{
    Buffer, Encoding, EngineConfig, FormatDescriptor, OutputSession, SessionConsumer,
    SinkCapabilities, Timestamp,
};

/// 10 ms at 48 kHz.
pub const FRAMES_10MS: usize = 480;

type Running = Arc<Mutex<Option<(SessionConsumer, FormatDescriptor)>>>;

struct FakeSink {
    caps: SinkCapabilities,
    start_failures: Arc<AtomicU32>,
    running: Running,
    healthy: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl AudioOutput for FakeSink {
    fn capabilities(&self) -> SinkCapabilities {
        self.caps.clone()
    }

    fn start(
        &mut self,
        consumer: SessionConsumer,
        format: FormatDescriptor,
    ) -> audio_output_engine::Result<()> {
        let fail = self
            .start_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(audio_output_engine::PipelineError::DeviceUnavailable(
                format!("fake sink rejected {format}"),
            ));
        }
        *self.running.lock() = Some((consumer, format));
        Ok(())
    }

    fn pause(&mut self) -> audio_output_engine::Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&mut self) -> audio_output_engine::Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.lock().take();
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn name(&self) -> String {
        "fake".to_string()
    }
}

pub struct FakeHost {
    caps: SinkCapabilities,
    failures_left: AtomicU32,
    start_failures: Arc<AtomicU32>,
    opens: AtomicU32,
    running: Running,
    healthy: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl FakeHost {
    pub fn new(caps: SinkCapabilities) -> Arc<Self> {
        Self::failing(caps, 0)
    }

    /// A host whose first `failures` opens fail.
    pub fn failing(caps: SinkCapabilities, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            caps,
            failures_left: AtomicU32::new(failures),
            start_failures: Arc::new(AtomicU32::new(0)),
            opens: AtomicU32::new(0),
            running: Arc::new(Mutex::new(None)),
            healthy: Arc::new(AtomicBool::new(true)),
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn fail_next(&self, failures: u32) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }

    /// Make the next `failures` sink starts fail, on any opened sink.
    pub fn fail_next_start(&self, failures: u32) {
        self.start_failures.store(failures, Ordering::SeqCst);
    }

    /// Open attempts so far, failed ones included.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn consumer(&self) -> SessionConsumer {
        self.running
            .lock()
            .as_ref()
            .map(|(consumer, _)| consumer.clone())
            .expect("sink not started")
    }

    pub fn running_format(&self) -> Option<FormatDescriptor> {
        self.running.lock().as_ref().map(|(_, format)| *format)
    }
}

impl OutputHost for FakeHost {
    fn open_output(&self) -> audio_output_engine::Result<Box<dyn AudioOutput>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(audio_output_engine::PipelineError::DeviceUnavailable(
                "fake device busy".into(),
            ));
        }
        self.healthy.store(true, Ordering::SeqCst);
        Ok(Box::new(FakeSink {
            caps: self.caps.clone(),
            start_failures: self.start_failures.clone(),
            running: self.running.clone(),
            healthy: self.healthy.clone(),
            paused: self.paused.clone(),
        }))
    }
}

pub fn s16_48k() -> FormatDescriptor {
    FormatDescriptor::with_count(Encoding::S16Le, 48_000, 2).unwrap()
}

pub fn f32_44k() -> FormatDescriptor {
    FormatDescriptor::with_count(Encoding::Float32, 44_100, 2).unwrap()
}

pub fn ac3_48k() -> FormatDescriptor {
    FormatDescriptor::with_count(Encoding::Ac3, 48_000, 2).unwrap()
}

/// A stereo PCM sink: S16 at 48 kHz and f32 at 44.1 kHz.
pub fn pcm_caps() -> SinkCapabilities {
    [s16_48k(), f32_44k()].into_iter().collect()
}

/// PCM sink that also takes AC-3 passthrough.
pub fn spdif_caps() -> SinkCapabilities {
    [s16_48k(), ac3_48k()].into_iter().collect()
}

pub fn open_session(host: &Arc<FakeHost>, config: EngineConfig) -> OutputSession {
    OutputSession::open(host.clone(), config).expect("session opens")
}

/// A zeroed S16 stereo 48 kHz buffer of `frames` frames starting at `start`.
pub fn pcm_buffer(session: &OutputSession, start: Timestamp, frames: usize) -> Buffer {
    let mut buffer = session.allocate_buffer(frames * 4).unwrap();
    buffer.stamp(start, frames, 48_000);
    buffer
}

/// Submit a 10 ms buffer at `start_ms` and expect it queued.
pub fn submit_10ms(session: &OutputSession, input: &InputHandle, start_ms: i64) {
    let buffer = pcm_buffer(session, start_ms * 1000, FRAMES_10MS);
    let outcome = session.submit_buffer(input, buffer).unwrap();
    assert_eq!(outcome, audio_output_engine::engine::SubmitOutcome::Queued);
}

pub fn drain_events(session: &OutputSession) -> Vec<PipelineEvent> {
    session.events().try_iter().collect()
}
