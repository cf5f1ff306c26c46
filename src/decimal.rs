//! Exact decimal arithmetic for monetary values.
//!
//! A [`Decimal`] is an `i128` mantissa paired with a base-10 scale. Nothing in
//! this module rounds: every operation is either exact or fails with
//! [`GuardError::Overflow`]. Parsing only accepts the canonical textual form of
//! a value, so `parse(s)?.to_string() == s` holds for every accepted `s`.

use crate::error::{GuardError, GuardResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Largest scale and digit count an `i128` mantissa can carry.
pub const MAX_PRECISION: u32 = 38;

/// Significant digits accepted by [`FromStr`].
pub const DEFAULT_PRECISION: u32 = 28;

/// Exact base-10 number.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    mantissa: i128,
    scale: u32,
}

const fn pow10(exp: u32) -> i128 {
    let mut value: i128 = 1;
    let mut i = 0;
    while i < exp {
        value *= 10;
        i += 1;
    }
    value
}

impl Decimal {
    pub const ZERO: Decimal = Decimal {
        mantissa: 0,
        scale: 0,
    };

    /// Build from raw parts. `scale` is the number of fractional digits.
    pub fn from_parts(mantissa: i128, scale: u32) -> GuardResult<Self> {
        if scale > MAX_PRECISION {
            return Err(GuardError::PrecisionLoss {
                input: format!("{mantissa}e-{scale}"),
                reason: format!("scale exceeds {MAX_PRECISION}"),
            });
        }
        Ok(Self { mantissa, scale })
    }

    /// Parse the canonical decimal text of a value.
    ///
    /// Accepts `-?(0|[1-9][0-9]*)(\.[0-9]+)?` with at most `precision`
    /// significant digits. Anything else, including input that is numerically
    /// valid but would not reproduce itself when printed (`+1`, `01`, `1.`,
    /// `-0`, `1e3`), is refused rather than coerced.
    pub fn parse(text: &str, precision: u32) -> GuardResult<Self> {
        let loss = |reason: &str| GuardError::PrecisionLoss {
            input: text.to_string(),
            reason: reason.to_string(),
        };

        let precision = precision.min(MAX_PRECISION);
        let (negative, body) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (body, None),
        };

        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(loss("integer part must be a non-empty run of digits"));
        }
        if int_part.len() > 1 && int_part.starts_with('0') {
            return Err(loss("leading zeros do not round-trip"));
        }
        let frac_part = frac_part.unwrap_or("");
        if body.contains('.') && frac_part.is_empty() {
            return Err(loss("trailing decimal point does not round-trip"));
        }
        if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(loss("fractional part must be digits only"));
        }

        let digits = format!("{int_part}{frac_part}");
        let significant = digits.trim_start_matches('0').len();
        if significant > precision as usize {
            return Err(loss(&format!(
                "{significant} significant digits exceed precision {precision}"
            )));
        }
        if frac_part.len() > precision as usize {
            return Err(loss(&format!(
                "{} fractional digits exceed precision {precision}",
                frac_part.len()
            )));
        }

        let mut mantissa: i128 = 0;
        for b in digits.bytes() {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(b - b'0')))
                .ok_or_else(|| loss("value exceeds 128-bit mantissa"))?;
        }
        if negative {
            if mantissa == 0 {
                return Err(loss("negative zero does not round-trip"));
            }
            mantissa = -mantissa;
        }

        let value = Self {
            mantissa,
            scale: frac_part.len() as u32,
        };
        if value.to_string() != text {
            return Err(loss("value does not round-trip"));
        }
        Ok(value)
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    pub fn is_negative(&self) -> bool {
        self.mantissa < 0
    }

    /// Same value with trailing fractional zeros removed.
    pub fn normalize(&self) -> Self {
        let mut mantissa = self.mantissa;
        let mut scale = self.scale;
        while scale > 0 && mantissa % 10 == 0 {
            mantissa /= 10;
            scale -= 1;
        }
        Self { mantissa, scale }
    }

    fn rescaled(&self, scale: u32, operation: &str) -> GuardResult<i128> {
        debug_assert!(scale >= self.scale);
        self.mantissa
            .checked_mul(pow10(scale - self.scale))
            .ok_or_else(|| GuardError::Overflow {
                operation: operation.to_string(),
            })
    }

    pub fn checked_add(&self, other: &Self) -> GuardResult<Self> {
        let scale = self.scale.max(other.scale);
        let a = self.rescaled(scale, "decimal add")?;
        let b = other.rescaled(scale, "decimal add")?;
        let mantissa = a.checked_add(b).ok_or_else(|| GuardError::Overflow {
            operation: "decimal add".to_string(),
        })?;
        Ok(Self { mantissa, scale })
    }

    pub fn checked_sub(&self, other: &Self) -> GuardResult<Self> {
        self.checked_add(&other.checked_neg()?)
    }

    pub fn checked_neg(&self) -> GuardResult<Self> {
        let mantissa = self.mantissa.checked_neg().ok_or_else(|| GuardError::Overflow {
            operation: "decimal negate".to_string(),
        })?;
        Ok(Self {
            mantissa,
            scale: self.scale,
        })
    }

    pub fn checked_mul(&self, other: &Self) -> GuardResult<Self> {
        let overflow = || GuardError::Overflow {
            operation: "decimal multiply".to_string(),
        };
        let a = self.normalize();
        let b = other.normalize();
        let mantissa = a.mantissa.checked_mul(b.mantissa).ok_or_else(overflow)?;
        let scale = a.scale + b.scale;
        if scale > MAX_PRECISION {
            return Err(overflow());
        }
        Ok(Self { mantissa, scale })
    }

    pub fn abs(&self) -> GuardResult<Self> {
        if self.is_negative() {
            self.checked_neg()
        } else {
            Ok(*self)
        }
    }

    /// Exact sum of an iterator of decimals.
    pub fn try_sum<'a, I>(values: I) -> GuardResult<Self>
    where
        I: IntoIterator<Item = &'a Decimal>,
    {
        values
            .into_iter()
            .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
    }
}

impl From<i64> for Decimal {
    fn from(value: i64) -> Self {
        Self {
            mantissa: i128::from(value),
            scale: 0,
        }
    }
}

impl Default for Decimal {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        // Integer parts first, then fractions rescaled to a common scale.
        // |fraction| < 10^scale <= 10^38, so the rescale cannot overflow.
        let int_a = self.mantissa / pow10(self.scale);
        let int_b = other.mantissa / pow10(other.scale);
        match int_a.cmp(&int_b) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        let scale = self.scale.max(other.scale);
        let frac_a = (self.mantissa % pow10(self.scale)) * pow10(scale - self.scale);
        let frac_b = (other.mantissa % pow10(other.scale)) * pow10(scale - other.scale);
        frac_a.cmp(&frac_b)
    }
}

impl Hash for Decimal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let n = self.normalize();
        n.mantissa.hash(state);
        n.scale.hash(state);
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.mantissa.unsigned_abs().to_string();
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let scale = self.scale as usize;
        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

impl FromStr for Decimal {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, DEFAULT_PRECISION)
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Decimal::parse(&text, MAX_PRECISION).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmp_across_scales_without_overflow() {
        let big = Decimal::from_parts(10i128.pow(37), 0).unwrap();
        let tiny = Decimal::from_parts(1, 38).unwrap();
        assert!(big > tiny);
        assert!(tiny.checked_neg().unwrap() < Decimal::ZERO);
    }

    #[test]
    fn pow10_table_edges() {
        assert_eq!(pow10(0), 1);
        assert_eq!(pow10(38), 100_000_000_000_000_000_000_000_000_000_000_000_000);
    }
}
