//! Applies a clock-sync correction factor by dropping or repeating frames.

use crate::engine::fixed::{Fixed32, FIXED32_ONE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Correction {
    None,
    /// Repeat one frame every `n` frames.
    Insert(u32),
    /// Skip one frame every `n` frames.
    Drop(u32),
}

/// Drop/insert cadence derived from a rate multiplier.
///
/// A factor above one stretches the stream (frames repeated), below one
/// shrinks it (frames skipped).
#[derive(Debug)]
pub struct DriftCorrector {
    channels: usize,
    correction: Correction,
    countdown: u32,
    inserted: u64,
    dropped: u64,
}

impl DriftCorrector {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            correction: Correction::None,
            countdown: 0,
            inserted: 0,
            dropped: 0,
        }
    }

    pub fn set_factor(&mut self, factor: Fixed32) {
        let delta = (factor - FIXED32_ONE).to_f64();
        let correction = if delta == 0.0 {
            Correction::None
        } else {
            let interval = (1.0 / delta.abs()).round().clamp(1.0, u32::MAX as f64) as u32;
            if delta > 0.0 {
                Correction::Insert(interval)
            } else {
                Correction::Drop(interval)
            }
        };
        if correction != self.correction {
            self.correction = correction;
            self.countdown = match correction {
                Correction::None => 0,
                Correction::Insert(n) | Correction::Drop(n) => n,
            };
        }
    }

    pub fn is_active(&self) -> bool {
        self.correction != Correction::None
    }

    /// Copy `input` to `out`, applying the cadence.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.correction == Correction::None {
            out.extend_from_slice(input);
            return;
        }
        for frame in input.chunks_exact(self.channels) {
            self.countdown = self.countdown.saturating_sub(1);
            let due = self.countdown == 0;
            match self.correction {
                Correction::Insert(n) if due => {
                    out.extend_from_slice(frame);
                    out.extend_from_slice(frame);
                    self.inserted += 1;
                    self.countdown = n;
                }
                Correction::Drop(n) if due => {
                    self.dropped += 1;
                    self.countdown = n;
                }
                _ => out.extend_from_slice(frame),
            }
        }
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
