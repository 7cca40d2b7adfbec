//! Sample stream descriptors and sink capability sets.

pub mod pcm;

use std::fmt;

use crate::engine::error::{PipelineError, Result};
use crate::engine::Timestamp;

/// Byte size of one S/PDIF frame. Passthrough buffers must be exactly this size.
pub const SPDIF_FRAME_SIZE: usize = 6144;

/// Audio frames carried by one S/PDIF frame (2 channels x 16 bit carrier).
pub const SPDIF_FRAME_SAMPLES: usize = 1536;

/// Bytes per frame of the S/PDIF carrier.
const SPDIF_CARRIER_FRAME_BYTES: usize = SPDIF_FRAME_SIZE / SPDIF_FRAME_SAMPLES;

/// Sample encodings understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    MuLaw,
    ALaw,
    ImaAdpcm,
    U8,
    S8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    Float32,
    /// 4.28 fixed point, see [`Fixed32`](crate::engine::fixed::Fixed32).
    Fixed32,
    /// Generic S/PDIF digital passthrough.
    Spdif,
    Ac3,
    Dts,
}

/// How an encoding can travel to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingClass {
    /// Decoded samples; convertible to any other PCM encoding.
    Pcm,
    /// Compressed bitstream; only ever forwarded verbatim.
    Bitstream(Encoding),
}

impl Encoding {
    /// Signed 16-bit in host byte order.
    #[cfg(target_endian = "little")]
    pub const S16_NE: Encoding = Encoding::S16Le;
    #[cfg(target_endian = "big")]
    pub const S16_NE: Encoding = Encoding::S16Be;

    /// Unsigned 16-bit in host byte order.
    #[cfg(target_endian = "little")]
    pub const U16_NE: Encoding = Encoding::U16Le;
    #[cfg(target_endian = "big")]
    pub const U16_NE: Encoding = Encoding::U16Be;

    pub fn is_bitstream(self) -> bool {
        matches!(self, Encoding::Spdif | Encoding::Ac3 | Encoding::Dts)
    }

    pub fn class(self) -> EncodingClass {
        if self.is_bitstream() {
            EncodingClass::Bitstream(self)
        } else {
            EncodingClass::Pcm
        }
    }

    /// Bytes per single-channel sample, when the encoding has a fixed one.
    pub fn bytes_per_sample(self) -> Option<usize> {
        match self {
            Encoding::MuLaw | Encoding::ALaw | Encoding::U8 | Encoding::S8 => Some(1),
            Encoding::S16Le | Encoding::S16Be | Encoding::U16Le | Encoding::U16Be => Some(2),
            Encoding::Float32 | Encoding::Fixed32 => Some(4),
            Encoding::ImaAdpcm | Encoding::Spdif | Encoding::Ac3 | Encoding::Dts => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Encoding::MuLaw => "mu-law",
            Encoding::ALaw => "a-law",
            Encoding::ImaAdpcm => "ima-adpcm",
            Encoding::U8 => "u8",
            Encoding::S8 => "s8",
            Encoding::S16Le => "s16le",
            Encoding::S16Be => "s16be",
            Encoding::U16Le => "u16le",
            Encoding::U16Be => "u16be",
            Encoding::Float32 => "f32",
            Encoding::Fixed32 => "fixed32",
            Encoding::Spdif => "spdif",
            Encoding::Ac3 => "ac3",
            Encoding::Dts => "dts",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Channel count of a stream; `Any` matches every concrete count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channels {
    Any,
    Count(u16),
}

impl Channels {
    pub fn matches(self, other: Channels) -> bool {
        match (self, other) {
            (Channels::Any, _) | (_, Channels::Any) => true,
            (Channels::Count(a), Channels::Count(b)) => a == b,
        }
    }

    pub fn count(self) -> Option<u16> {
        match self {
            Channels::Any => None,
            Channels::Count(n) => Some(n),
        }
    }
}

impl fmt::Display for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channels::Any => f.write_str("any"),
            Channels::Count(n) => write!(f, "{n}"),
        }
    }
}

/// Encoding, rate and channel layout of a sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatDescriptor {
    pub encoding: Encoding,
    /// Sample rate in Hz.
    pub rate: u32,
    pub channels: Channels,
}

impl FormatDescriptor {
    /// Create a descriptor, rejecting a zero rate or a zero channel count.
    pub fn new(encoding: Encoding, rate: u32, channels: Channels) -> Result<Self> {
        let format = Self {
            encoding,
            rate,
            channels,
        };
        format.validate()?;
        Ok(format)
    }

    /// Check the invariants of a materialized stream: rate > 0, channels != 0.
    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(PipelineError::InvalidFormat(format!(
                "{}: sample rate must be > 0",
                self.encoding
            )));
        }
        if self.channels == Channels::Count(0) {
            return Err(PipelineError::InvalidFormat(format!(
                "{}@{}: channel count must be non-zero",
                self.encoding, self.rate
            )));
        }
        Ok(())
    }

    /// Shorthand for a concrete channel count.
    pub fn with_count(encoding: Encoding, rate: u32, channels: u16) -> Result<Self> {
        Self::new(encoding, rate, Channels::Count(channels))
    }

    /// Same encoding and rate, and channel counts equal or either wildcard.
    pub fn is_identical(&self, other: &FormatDescriptor) -> bool {
        self.encoding == other.encoding
            && self.rate == other.rate
            && self.channels.matches(other.channels)
    }

    pub fn is_bitstream(&self) -> bool {
        self.encoding.is_bitstream()
    }

    /// Replace a wildcard channel count with `fallback`.
    pub fn materialize(mut self, fallback: Channels) -> Self {
        if self.channels == Channels::Any {
            self.channels = fallback;
        }
        self
    }

    /// Bytes per interleaved frame, when both encoding and channels are fixed.
    pub fn frame_bytes(&self) -> Option<usize> {
        if self.is_bitstream() {
            return Some(SPDIF_CARRIER_FRAME_BYTES);
        }
        let channels = self.channels.count()? as usize;
        Some(self.encoding.bytes_per_sample()? * channels)
    }

    /// Bytes per second of the stream.
    pub fn byte_rate(&self) -> Option<u64> {
        Some(self.frame_bytes()? as u64 * self.rate as u64)
    }

    /// Bytes needed to hold `frames` frames.
    pub fn byte_size(&self, frames: usize) -> Option<usize> {
        frames.checked_mul(self.frame_bytes()?)
    }

    /// Presentation length of `frames` frames at this rate.
    pub fn duration_of(&self, frames: usize) -> Timestamp {
        frames_to_micros(frames, self.rate)
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Hz {}ch", self.encoding, self.rate, self.channels)
    }
}

/// Convert a frame count to microseconds at `rate`, truncating.
pub fn frames_to_micros(frames: usize, rate: u32) -> Timestamp {
    if rate == 0 {
        return 0;
    }
    (frames as i128 * 1_000_000 / rate as i128) as Timestamp
}

/// Convert microseconds to a frame count at `rate`, truncating.
pub fn micros_to_frames(micros: Timestamp, rate: u32) -> usize {
    if micros <= 0 {
        return 0;
    }
    (micros as i128 * rate as i128 / 1_000_000) as usize
}

/// The set of formats a sink can render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkCapabilities {
    formats: Vec<FormatDescriptor>,
}

impl SinkCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a format unless an identical one is already present.
    pub fn insert(&mut self, format: FormatDescriptor) {
        if !self.formats.iter().any(|f| f == &format) {
            self.formats.push(format);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FormatDescriptor> {
        self.formats.iter()
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn supports_encoding(&self, encoding: Encoding) -> bool {
        self.formats.iter().any(|f| f.encoding == encoding)
    }
}

impl FromIterator<FormatDescriptor> for SinkCapabilities {
    fn from_iter<I: IntoIterator<Item = FormatDescriptor>>(iter: I) -> Self {
        let mut caps = SinkCapabilities::new();
        for format in iter {
            caps.insert(format);
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_encoding() -> impl Strategy<Value = Encoding> {
        prop_oneof![
            Just(Encoding::MuLaw),
            Just(Encoding::ALaw),
            Just(Encoding::ImaAdpcm),
            Just(Encoding::U8),
            Just(Encoding::S8),
            Just(Encoding::S16Le),
            Just(Encoding::S16Be),
            Just(Encoding::U16Le),
            Just(Encoding::U16Be),
            Just(Encoding::Float32),
            Just(Encoding::Fixed32),
            Just(Encoding::Spdif),
            Just(Encoding::Ac3),
            Just(Encoding::Dts),
        ]
    }

    fn any_channels() -> impl Strategy<Value = Channels> {
        prop_oneof![Just(Channels::Any), (1u16..=8).prop_map(Channels::Count)]
    }

    fn any_format() -> impl Strategy<Value = FormatDescriptor> {
        (any_encoding(), 1u32..=192_000, any_channels()).prop_map(|(encoding, rate, channels)| {
            FormatDescriptor {
                encoding,
                rate,
                channels,
            }
        })
    }

    proptest! {
        #[test]
        fn prop_identity_is_reflexive(f in any_format()) {
            prop_assert!(f.is_identical(&f));
        }

        #[test]
        fn prop_identity_is_symmetric(a in any_format(), b in any_format()) {
            prop_assert_eq!(a.is_identical(&b), b.is_identical(&a));
        }

        #[test]
        fn prop_wildcard_matches_any_count(
            encoding in any_encoding(),
            rate in 1u32..=192_000,
            count in 1u16..=32,
        ) {
            let wild = FormatDescriptor { encoding, rate, channels: Channels::Any };
            let concrete = FormatDescriptor { encoding, rate, channels: Channels::Count(count) };
            prop_assert!(wild.is_identical(&concrete));
            prop_assert!(concrete.is_identical(&wild));
        }
    }

    #[test]
    fn test_rate_or_encoding_mismatch_is_not_identical() {
        let a = FormatDescriptor::with_count(Encoding::S16Le, 44_100, 2).unwrap();
        let b = FormatDescriptor::with_count(Encoding::S16Le, 48_000, 2).unwrap();
        let c = FormatDescriptor::with_count(Encoding::S16Be, 44_100, 2).unwrap();
        let d = FormatDescriptor::with_count(Encoding::S16Le, 44_100, 6).unwrap();
        assert!(!a.is_identical(&b));
        assert!(!a.is_identical(&c));
        assert!(!a.is_identical(&d));
    }

    #[test]
    fn test_new_rejects_zero_rate_and_channels() {
        assert!(matches!(
            FormatDescriptor::new(Encoding::Float32, 0, Channels::Count(2)),
            Err(PipelineError::InvalidFormat(_))
        ));
        assert!(matches!(
            FormatDescriptor::new(Encoding::Float32, 48_000, Channels::Count(0)),
            Err(PipelineError::InvalidFormat(_))
        ));
        assert!(FormatDescriptor::new(Encoding::Float32, 48_000, Channels::Any).is_ok());
    }

    #[test]
    fn test_native_endian_alias() {
        if cfg!(target_endian = "little") {
            assert_eq!(Encoding::S16_NE, Encoding::S16Le);
            assert_eq!(Encoding::U16_NE, Encoding::U16Le);
        } else {
            assert_eq!(Encoding::S16_NE, Encoding::S16Be);
            assert_eq!(Encoding::U16_NE, Encoding::U16Be);
        }
    }

    #[test]
    fn test_byte_rate_and_size() {
        let cd = FormatDescriptor::with_count(Encoding::S16Le, 44_100, 2).unwrap();
        assert_eq!(cd.frame_bytes(), Some(4));
        assert_eq!(cd.byte_rate(), Some(176_400));
        assert_eq!(cd.byte_size(1024), Some(4096));

        let ac3 = FormatDescriptor::with_count(Encoding::Ac3, 48_000, 6).unwrap();
        assert_eq!(ac3.byte_size(SPDIF_FRAME_SAMPLES), Some(SPDIF_FRAME_SIZE));
        assert_eq!(ac3.byte_rate(), Some(192_000));

        let wild = FormatDescriptor::new(Encoding::Float32, 48_000, Channels::Any).unwrap();
        assert_eq!(wild.byte_rate(), None);

        let adpcm = FormatDescriptor::with_count(Encoding::ImaAdpcm, 22_050, 1).unwrap();
        assert_eq!(adpcm.frame_bytes(), None);
    }

    #[test]
    fn test_duration_conversions() {
        assert_eq!(frames_to_micros(44_100, 44_100), 1_000_000);
        assert_eq!(frames_to_micros(441, 44_100), 10_000);
        assert_eq!(micros_to_frames(10_000, 48_000), 480);
        assert_eq!(micros_to_frames(-5, 48_000), 0);
    }

    #[test]
    fn test_capabilities_dedup_and_lookup() {
        let f = FormatDescriptor::with_count(Encoding::S16Le, 44_100, 2).unwrap();
        let caps: SinkCapabilities = [f, f].into_iter().collect();
        assert_eq!(caps.len(), 1);
        assert!(caps.supports_encoding(Encoding::S16Le));
        assert!(!caps.supports_encoding(Encoding::Ac3));
    }
}
