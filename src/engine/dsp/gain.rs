//! Lock-free volume control in 4.28 fixed point.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::engine::fixed::{Fixed32, FIXED32_ONE};

struct GainState {
    gain: AtomicI32,
    volume: AtomicU8,
    muted: AtomicBool,
}

/// Shared volume/mute control. Clones refer to the same state.
#[derive(Clone)]
pub struct GainControl {
    state: Arc<GainState>,
}

/// Perceptual curve: `(volume / 100)^1.5`.
fn volume_to_gain(volume: u8) -> (u8, Fixed32) {
    let clamped = volume.min(100);
    let v = f64::from(clamped) / 100.0;
    (clamped, Fixed32::from_f64(v.powf(1.5)))
}

impl GainControl {
    pub fn new(volume: u8) -> Self {
        let (volume, gain) = volume_to_gain(volume);
        Self {
            state: Arc::new(GainState {
                gain: AtomicI32::new(gain.raw()),
                volume: AtomicU8::new(volume),
                muted: AtomicBool::new(false),
            }),
        }
    }

    /// Set volume in percent; values above 100 are clamped.
    pub fn set_volume(&self, volume: u8) {
        let (volume, gain) = volume_to_gain(volume);
        self.state.gain.store(gain.raw(), Ordering::Relaxed);
        self.state.volume.store(volume, Ordering::Relaxed);
    }

    pub fn volume(&self) -> u8 {
        self.state.volume.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, muted: bool) {
        self.state.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::Relaxed)
    }

    /// Effective gain, zero when muted.
    pub fn gain(&self) -> Fixed32 {
        if self.is_muted() {
            return Fixed32::ZERO;
        }
        Fixed32::from_raw(self.state.gain.load(Ordering::Relaxed))
    }

    pub fn apply(&self, samples: &mut [f32]) {
        let gain = self.gain();
        if gain == FIXED32_ONE {
            return;
        }
        for sample in samples {
            *sample = gain.scale_f32(*sample);
        }
    }

    pub fn apply_i16(&self, samples: &mut [i16]) {
        let gain = self.gain();
        for sample in samples {
            *sample = gain.scale_i16(*sample);
        }
    }
}

impl Default for GainControl {
    fn default() -> Self {
        Self::new(100)
    }
}
