//! # Signed 64.64 Fixed Point
//!
//! Every rate and share in the engine is a `Fixed64x64`: a signed 128-bit integer read
//! as `raw / 2^64`. All operations are checked and round toward negative infinity,
//! so truncation never creates value.
//!
//! | Operation | Result | Rounding |
//! |-----------|--------|----------|
//! | `from_ratio(n, d)` | `n / d` as 64.64 | floor |
//! | `mulu(x)` | `self * x` as integer | floor |
//! | `checked_mul(y)` | `self * y` as 64.64 | floor |
//! | `from_decimal_str` | exact decimal as 64.64 | floor |

use crate::error::{NmxError, Result};
use primitive_types::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const FRACTION_BITS: u32 = 64;
const FRACTION_MASK: u128 = (1u128 << FRACTION_BITS) - 1;

/// Signed 64.64 fixed-point number
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed64x64(i128);

impl Fixed64x64 {
    pub const ZERO: Self = Self(0);

    /// 1.0 (`1 << 64`)
    pub const ONE: Self = Self(1i128 << FRACTION_BITS);

    pub const MAX: Self = Self(i128::MAX);

    pub const fn from_raw(raw: i128) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> i128 {
        self.0
    }

    pub const fn from_int(value: i64) -> Self {
        Self((value as i128) << FRACTION_BITS)
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// `numerator / denominator` as 64.64, floored
    pub fn from_ratio(numerator: u128, denominator: u128) -> Result<Self> {
        if denominator == 0 {
            return Err(NmxError::DivisionByZero);
        }
        let quotient = (U256::from(numerator) << FRACTION_BITS) / U256::from(denominator);
        to_signed(quotient)
    }

    /// Multiply an unsigned integer by this value and floor the result
    pub fn mulu(&self, value: u128) -> Result<u128> {
        if self.0 < 0 {
            return Err(NmxError::ArithmeticOverflow);
        }
        if value == 0 || self.0 == 0 {
            return Ok(0);
        }
        let product = (U256::from(self.0 as u128) * U256::from(value)) >> FRACTION_BITS;
        if product > U256::from(u128::MAX) {
            return Err(NmxError::ArithmeticOverflow);
        }
        Ok(product.low_u128())
    }

    pub fn checked_add(&self, other: Self) -> Result<Self> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(NmxError::ArithmeticOverflow)
    }

    pub fn checked_sub(&self, other: Self) -> Result<Self> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(NmxError::ArithmeticOverflow)
    }

    pub fn checked_mul(&self, other: Self) -> Result<Self> {
        let negative = (self.0 < 0) != (other.0 < 0);
        let product = U256::from(self.0.unsigned_abs()) * U256::from(other.0.unsigned_abs());
        if negative {
            let magnitude = (product + U256::from(FRACTION_MASK)) >> FRACTION_BITS;
            if magnitude > U256::from(i128::MIN.unsigned_abs()) {
                return Err(NmxError::ArithmeticOverflow);
            }
            Ok(Self(0i128.wrapping_sub_unsigned(magnitude.low_u128())))
        } else {
            to_signed(product >> FRACTION_BITS)
        }
    }

    /// Parse an exact decimal fraction such as `"0.994"` or `"-1.5"`, flooring the
    /// part that 64 binary digits cannot hold
    pub fn from_decimal_str(s: &str) -> Result<Self> {
        let invalid = || NmxError::InvalidDecimal(s.to_string());
        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let integer: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        if integer > (i128::MAX >> FRACTION_BITS) as u128 {
            return Err(NmxError::ArithmeticOverflow);
        }

        // Horner from the least significant digit keeps a single floor overall
        let mut fraction: u128 = 0;
        for digit in frac_part.bytes().rev() {
            let d = (digit - b'0') as u128;
            fraction = ((d << FRACTION_BITS) + fraction) / 10;
        }

        let magnitude = (integer << FRACTION_BITS) | fraction;
        let raw = magnitude as i128;
        if negative {
            // floor of a negative value rounds away from zero when bits were dropped
            let dropped = !frac_part.is_empty() && !exact_in_binary(frac_part, fraction);
            let raw = if dropped {
                raw.checked_add(1).ok_or(NmxError::ArithmeticOverflow)?
            } else {
                raw
            };
            Ok(Self(-raw))
        } else {
            Ok(Self(raw))
        }
    }

    /// Exact decimal expansion (always terminates, at most 64 fractional digits)
    pub fn to_decimal_string(&self) -> String {
        let magnitude = self.0.unsigned_abs();
        let integer = magnitude >> FRACTION_BITS;
        let mut fraction = magnitude & FRACTION_MASK;

        let mut out = String::new();
        if self.0 < 0 {
            out.push('-');
        }
        out.push_str(&integer.to_string());
        if fraction != 0 {
            out.push('.');
            while fraction != 0 {
                fraction *= 10;
                out.push(char::from(b'0' + (fraction >> FRACTION_BITS) as u8));
                fraction &= FRACTION_MASK;
            }
        }
        out
    }

    /// Lossy conversion, display only
    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / (1u128 << FRACTION_BITS) as f64
    }
}

fn to_signed(value: U256) -> Result<Fixed64x64> {
    if value > U256::from(i128::MAX as u128) {
        return Err(NmxError::ArithmeticOverflow);
    }
    Ok(Fixed64x64(value.low_u128() as i128))
}

/// Whether the floored binary fraction reproduces the decimal digits exactly
fn exact_in_binary(frac_digits: &str, fraction: u128) -> bool {
    let expansion = Fixed64x64(fraction as i128).to_decimal_string();
    let expanded = expansion.split_once('.').map(|(_, f)| f).unwrap_or("");
    expanded == frac_digits.trim_end_matches('0')
}

impl fmt::Debug for Fixed64x64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed64x64({})", self.to_f64())
    }
}

impl fmt::Display for Fixed64x64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal_string())
    }
}

impl FromStr for Fixed64x64 {
    type Err = NmxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_decimal_str(s)
    }
}

impl Serialize for Fixed64x64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_decimal_string())
    }
}

impl<'de> Deserialize<'de> for Fixed64x64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_decimal_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_one_is_identity_for_mulu() {
        assert_eq!(Fixed64x64::ONE.mulu(12345).unwrap(), 12345);
        assert_eq!(Fixed64x64::ZERO.mulu(u128::MAX).unwrap(), 0);
    }

    #[test]
    fn test_from_ratio_floors() {
        let third = Fixed64x64::from_ratio(1, 3).unwrap();
        assert_eq!(third.mulu(3).unwrap(), 0);
        assert_eq!(third.mulu(300).unwrap(), 99);
        assert_eq!(
            Fixed64x64::from_ratio(1, 0).unwrap_err(),
            NmxError::DivisionByZero
        );
    }

    #[test]
    fn test_from_ratio_overflow() {
        assert_eq!(
            Fixed64x64::from_ratio(u128::MAX, 1).unwrap_err(),
            NmxError::ArithmeticOverflow
        );
    }

    #[test]
    fn test_mulu_rejects_negative() {
        assert!(Fixed64x64::from_int(-1).mulu(10).is_err());
    }

    #[test]
    fn test_checked_mul() {
        let half = Fixed64x64::from_ratio(1, 2).unwrap();
        let quarter = half.checked_mul(half).unwrap();
        assert_eq!(quarter, Fixed64x64::from_ratio(1, 4).unwrap());

        let minus_half = Fixed64x64::ZERO.checked_sub(half).unwrap();
        assert_eq!(
            minus_half.checked_mul(half).unwrap(),
            Fixed64x64::ZERO.checked_sub(quarter).unwrap()
        );
        assert!(Fixed64x64::MAX.checked_mul(Fixed64x64::from_int(2)).is_err());
    }

    #[test]
    fn test_decimal_parsing() {
        assert_eq!(Fixed64x64::from_decimal_str("1").unwrap(), Fixed64x64::ONE);
        assert_eq!(
            Fixed64x64::from_decimal_str("0.5").unwrap(),
            Fixed64x64::from_ratio(1, 2).unwrap()
        );
        assert_eq!(
            Fixed64x64::from_decimal_str(".25").unwrap(),
            Fixed64x64::from_ratio(1, 4).unwrap()
        );
        assert_eq!(
            Fixed64x64::from_decimal_str("0.994").unwrap(),
            Fixed64x64::from_ratio(994, 1000).unwrap()
        );
        assert_eq!(
            Fixed64x64::from_decimal_str("-1.5").unwrap(),
            Fixed64x64::from_raw(-(3i128 << 63))
        );
        assert!(Fixed64x64::from_decimal_str("").is_err());
        assert!(Fixed64x64::from_decimal_str("1.2.3").is_err());
        assert!(Fixed64x64::from_decimal_str("abc").is_err());
    }

    #[test]
    fn test_negative_decimal_floors_down() {
        let tenth = Fixed64x64::from_decimal_str("0.1").unwrap();
        let minus_tenth = Fixed64x64::from_decimal_str("-0.1").unwrap();
        assert_eq!(minus_tenth.raw(), -tenth.raw() - 1);
    }

    #[test]
    fn test_decimal_string() {
        assert_eq!(Fixed64x64::ONE.to_decimal_string(), "1");
        assert_eq!(Fixed64x64::from_ratio(1, 4).unwrap().to_string(), "0.25");
        assert_eq!(Fixed64x64::from_int(-2).to_string(), "-2");
    }

    #[test]
    fn test_serde_is_exact() {
        let value = Fixed64x64::from_ratio(994, 1000).unwrap();
        let json = serde_json::to_string(&value).unwrap();
        let back: Fixed64x64 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    proptest! {
        #[test]
        fn prop_ratio_never_rounds_up(n in 0u128..u64::MAX as u128, d in 1u128..u64::MAX as u128) {
            let r = Fixed64x64::from_ratio(n, d).unwrap();
            prop_assert!(r.mulu(d).unwrap() <= n);
        }

        #[test]
        fn prop_decimal_expansion_is_exact(raw in 0i128..i128::MAX) {
            let value = Fixed64x64::from_raw(raw);
            let parsed = Fixed64x64::from_decimal_str(&value.to_decimal_string()).unwrap();
            prop_assert_eq!(parsed, value);
        }

        #[test]
        fn prop_mulu_monotonic(raw in 0i128..(1i128 << 70), a in 0u128..(1u128 << 100), b in 0u128..(1u128 << 100)) {
            let value = Fixed64x64::from_raw(raw);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(value.mulu(lo).unwrap() <= value.mulu(hi).unwrap());
        }
    }
}
