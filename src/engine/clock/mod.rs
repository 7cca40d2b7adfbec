pub mod sync;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::engine::format::{frames_to_micros, micros_to_frames};
use crate::engine::Timestamp;

pub use sync::{ClockSync, SilenceDecision};

/// Represents the current playback state of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
}

impl From<u8> for PlaybackState {
    fn from(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Paused,
            _ => PlaybackState::Stopped,
        }
    }
}

/// Hardware time derived from the frames a sink has rendered.
///
/// Written by the audio callback, read from any thread.
pub struct HardwareClock {
    /// Frames rendered since the clock was started.
    frames: AtomicU64,
    sample_rate: AtomicU32,
    state: AtomicU8,
}

impl HardwareClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
            state: AtomicU8::new(PlaybackState::Stopped as u8),
        }
    }

    /// Current hardware time in microseconds.
    pub fn now(&self) -> Timestamp {
        let frames = self.frames.load(Ordering::Acquire);
        frames_to_micros(frames as usize, self.sample_rate())
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Count `frames` as rendered. Ignored unless playing.
    pub fn advance(&self, frames: u64) {
        if self.state() == PlaybackState::Playing {
            self.frames.fetch_add(frames, Ordering::AcqRel);
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Switch to a new device rate, keeping the elapsed time continuous.
    pub fn set_sample_rate(&self, rate: u32) {
        let old_rate = self.sample_rate();
        if rate == 0 || rate == old_rate {
            return;
        }
        let elapsed = self.now();
        let frames = micros_to_frames(elapsed, rate);
        self.frames.store(frames as u64, Ordering::Release);
        self.sample_rate.store(rate, Ordering::SeqCst);
    }
}
