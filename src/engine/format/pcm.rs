//! Conversion between interleaved `f32` samples and raw PCM bytes.
//!
//! Only linear PCM encodings are handled here. Companded (mu-law, A-law),
//! ADPCM and bitstream encodings need a codec and are rejected.

use crate::engine::error::{PipelineError, Result};
use crate::engine::fixed::Fixed32;
use crate::engine::format::Encoding;

fn unsupported(encoding: Encoding) -> PipelineError {
    PipelineError::InvalidFormat(format!("{encoding} is not linear PCM"))
}

/// Append `samples` to `out`, encoded as `encoding`.
pub fn encode_f32(encoding: Encoding, samples: &[f32], out: &mut Vec<u8>) -> Result<()> {
    let width = encoding.bytes_per_sample().ok_or_else(|| unsupported(encoding))?;
    out.reserve(samples.len() * width);

    for &s in samples {
        let s = s.clamp(-1.0, 1.0);
        match encoding {
            Encoding::U8 => out.push(((s * 127.0).round() as i16 + 128) as u8),
            Encoding::S8 => out.push((s * 127.0).round() as i8 as u8),
            Encoding::S16Le => out.extend_from_slice(&to_i16(s).to_le_bytes()),
            Encoding::S16Be => out.extend_from_slice(&to_i16(s).to_be_bytes()),
            Encoding::U16Le => out.extend_from_slice(&to_u16(s).to_le_bytes()),
            Encoding::U16Be => out.extend_from_slice(&to_u16(s).to_be_bytes()),
            Encoding::Float32 => out.extend_from_slice(&s.to_ne_bytes()),
            Encoding::Fixed32 => {
                out.extend_from_slice(&Fixed32::from_f64(s as f64).raw().to_ne_bytes())
            }
            other => return Err(unsupported(other)),
        }
    }
    Ok(())
}

/// Append the samples held in `bytes` to `out` as `f32`.
///
/// Trailing bytes that do not form a whole sample are ignored.
pub fn decode_to_f32(encoding: Encoding, bytes: &[u8], out: &mut Vec<f32>) -> Result<()> {
    let width = encoding.bytes_per_sample().ok_or_else(|| unsupported(encoding))?;
    out.reserve(bytes.len() / width);

    for chunk in bytes.chunks_exact(width) {
        let sample = match encoding {
            Encoding::U8 => (chunk[0] as f32 - 128.0) / 128.0,
            Encoding::S8 => chunk[0] as i8 as f32 / 128.0,
            Encoding::S16Le => i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0,
            Encoding::S16Be => i16::from_be_bytes([chunk[0], chunk[1]]) as f32 / 32768.0,
            Encoding::U16Le => (u16::from_le_bytes([chunk[0], chunk[1]]) as f32 - 32768.0) / 32768.0,
            Encoding::U16Be => (u16::from_be_bytes([chunk[0], chunk[1]]) as f32 - 32768.0) / 32768.0,
            Encoding::Float32 => f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            Encoding::Fixed32 => {
                Fixed32::from_raw(i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .to_f32()
            }
            other => return Err(unsupported(other)),
        };
        out.push(sample);
    }
    Ok(())
}

fn to_i16(s: f32) -> i16 {
    (s * 32767.0).round() as i16
}

fn to_u16(s: f32) -> u16 {
    (to_i16(s) as i32 + 32768) as u16
}
