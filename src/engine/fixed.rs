//! 32-bit fixed-point numbers used for gain and rate factors.
//!
//! Layout is `0xABBBBBBB`: a sign plus 3 integer bits, then 28 fractional
//! bits. The representable range is `-8.0 ..= 7.9999999962747097`, and the
//! smallest positive step is `2^-28` (about 3.725e-9).
//!
//! Addition and subtraction operate directly on the raw integers.
//! Multiplication goes through a 64-bit product that is shifted back from 56
//! to 28 fractional bits with round-to-nearest.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Number of fractional bits.
pub const FIXED32_FRACBITS: u32 = 28;
/// Most negative representable value (-8.0).
pub const FIXED32_MIN: Fixed32 = Fixed32(i32::MIN);
/// Largest representable value (just below 8.0).
pub const FIXED32_MAX: Fixed32 = Fixed32(i32::MAX);
/// 1.0
pub const FIXED32_ONE: Fixed32 = Fixed32(1 << FIXED32_FRACBITS);
/// Smallest positive increment.
pub const FIXED32_EPSILON: Fixed32 = Fixed32(1);

const ROUND_HALF: i64 = 1 << (FIXED32_FRACBITS - 1);
const SCALE: f64 = (1u64 << FIXED32_FRACBITS) as f64;

/// Signed 4.28 fixed-point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed32(i32);

impl Fixed32 {
    pub const ZERO: Fixed32 = Fixed32(0);

    /// Wrap a raw 4.28 value.
    pub const fn from_raw(raw: i32) -> Self {
        Fixed32(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Convert from `f64`, rounding to the nearest step and saturating at the
    /// range limits. NaN maps to zero.
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return Self::ZERO;
        }
        let scaled = (value * SCALE).round();
        if scaled >= i32::MAX as f64 {
            FIXED32_MAX
        } else if scaled <= i32::MIN as f64 {
            FIXED32_MIN
        } else {
            Fixed32(scaled as i32)
        }
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE
    }

    pub fn to_f32(self) -> f32 {
        self.to_f64() as f32
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Fixed32)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Fixed32)
    }

    pub fn saturating_add(self, rhs: Self) -> Self {
        Fixed32(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Fixed32(self.0.saturating_sub(rhs.0))
    }

    /// Multiply with round-to-nearest on the 28 discarded bits.
    ///
    /// Returns `None` if the product falls outside the representable range.
    pub fn checked_mul(self, rhs: Self) -> Option<Self> {
        let product = self.0 as i64 * rhs.0 as i64;
        let rounded = (product + ROUND_HALF) >> FIXED32_FRACBITS;
        i32::try_from(rounded).ok().map(Fixed32)
    }

    /// Multiply, clamping out-of-range products to [`FIXED32_MIN`] / [`FIXED32_MAX`].
    pub fn saturating_mul(self, rhs: Self) -> Self {
        let product = self.0 as i64 * rhs.0 as i64;
        let rounded = (product + ROUND_HALF) >> FIXED32_FRACBITS;
        Fixed32(rounded.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
    }

    /// Divide with round-to-nearest (halves away from zero).
    ///
    /// Returns `None` on division by zero or when the quotient is out of range.
    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        if rhs.0 == 0 {
            return None;
        }
        let numerator = (self.0 as i64) << FIXED32_FRACBITS;
        let divisor = rhs.0 as i64;
        let half = divisor / 2;
        let quotient = if (numerator < 0) == (divisor < 0) {
            (numerator + half) / divisor
        } else {
            (numerator - half) / divisor
        };
        i32::try_from(quotient).ok().map(Fixed32)
    }

    /// Scale a signed 16-bit PCM sample, rounding and clipping to `i16`.
    pub fn scale_i16(self, sample: i16) -> i16 {
        let product = sample as i64 * self.0 as i64;
        let rounded = (product + ROUND_HALF) >> FIXED32_FRACBITS;
        rounded.clamp(i16::MIN as i64, i16::MAX as i64) as i16
    }

    /// Scale a 32-bit float sample.
    pub fn scale_f32(self, sample: f32) -> f32 {
        sample * self.to_f32()
    }

    pub fn abs_diff(self, other: Self) -> u32 {
        self.0.abs_diff(other.0)
    }
}

impl Add for Fixed32 {
    type Output = Fixed32;

    fn add(self, rhs: Self) -> Self {
        Fixed32(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Fixed32 {
    type Output = Fixed32;

    fn sub(self, rhs: Self) -> Self {
        Fixed32(self.0.wrapping_sub(rhs.0))
    }
}

impl Neg for Fixed32 {
    type Output = Fixed32;

    fn neg(self) -> Self {
        Fixed32(self.0.wrapping_neg())
    }
}

impl Mul for Fixed32 {
    type Output = Fixed32;

    fn mul(self, rhs: Self) -> Self {
        self.saturating_mul(rhs)
    }
}

impl Div for Fixed32 {
    type Output = Fixed32;

    /// # Panics
    /// Panics on division by zero, like integer division.
    fn div(self, rhs: Self) -> Self {
        assert!(rhs.0 != 0, "attempt to divide by zero");
        match self.checked_div(rhs) {
            Some(q) => q,
            None if (self.0 < 0) == (rhs.0 < 0) => FIXED32_MAX,
            None => FIXED32_MIN,
        }
    }
}

impl fmt::Display for Fixed32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.9}", self.to_f64())
    }
}
