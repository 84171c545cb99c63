//! Kubernetes resource quantity parsing.
//!
//! Quantities are normalised to nano-units so CPU (`100m`), memory (`10Gi`)
//! and plain counts (`nvidia.com/gpu: 1`) compare with integer arithmetic.

use crate::error::CrdError;
use std::cmp::Ordering;

const NANOS_PER_UNIT: u128 = 1_000_000_000;

/// A parsed, non-negative resource quantity in nano-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct ResourceQuantity(u128);

impl ResourceQuantity {
    /// Zero quantity
    pub const ZERO: Self = Self(0);

    /// Raw nano-unit value
    pub fn nanos(&self) -> u128 {
        self.0
    }

    /// Build from whole units
    pub fn from_units(units: u128) -> Self {
        Self(units.saturating_mul(NANOS_PER_UNIT))
    }

    /// Saturating addition
    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction (floors at zero)
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

/// Parse a Kubernetes quantity string (`1`, `1.5`, `250m`, `10Gi`, `1e3`, `2k`).
pub fn parse_quantity(input: &str) -> Result<ResourceQuantity, CrdError> {
    let s = input.trim();
    let err = || CrdError::Quantity(input.to_string());

    let number_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_end);
    if number.is_empty() || number == "." {
        return Err(err());
    }

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if frac_part.contains('.') || frac_part.len() > 18 {
        return Err(err());
    }

    let int_value: u128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| err())?
    };
    let frac_value: u128 = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse().map_err(|_| err())?
    };
    let frac_scale = 10u128.pow(frac_part.len() as u32);

    // Multiplier expressed as (numerator, denominator) over nano-units.
    let (numerator, denominator): (u128, u128) = match suffix {
        "" => (NANOS_PER_UNIT, 1),
        "n" => (1, 1),
        "u" => (1_000, 1),
        "m" => (1_000_000, 1),
        "k" => (NANOS_PER_UNIT * 1_000, 1),
        "M" => (NANOS_PER_UNIT * 1_000_000, 1),
        "G" => (NANOS_PER_UNIT * 1_000_000_000, 1),
        "T" => (NANOS_PER_UNIT * 1_000_000_000_000, 1),
        "P" => (NANOS_PER_UNIT * 1_000_000_000_000_000, 1),
        "E" => (NANOS_PER_UNIT * 1_000_000_000_000_000_000, 1),
        "Ki" => (NANOS_PER_UNIT << 10, 1),
        "Mi" => (NANOS_PER_UNIT << 20, 1),
        "Gi" => (NANOS_PER_UNIT << 30, 1),
        "Ti" => (NANOS_PER_UNIT << 40, 1),
        "Pi" => (NANOS_PER_UNIT << 50, 1),
        "Ei" => (NANOS_PER_UNIT << 60, 1),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let power: i32 = exp[1..].parse().map_err(|_| err())?;
            match power.cmp(&0) {
                Ordering::Less if power >= -9 => (NANOS_PER_UNIT / 10u128.pow(power.unsigned_abs()), 1),
                Ordering::Less => (1, 10u128.pow((power.unsigned_abs() - 9).min(38))),
                _ if power <= 18 => (NANOS_PER_UNIT * 10u128.pow(power as u32), 1),
                _ => return Err(err()),
            }
        }
        _ => return Err(err()),
    };

    let whole = int_value.checked_mul(numerator).ok_or_else(err)?;
    let fractional = frac_value
        .checked_mul(numerator)
        .ok_or_else(err)?
        / frac_scale;

    Ok(ResourceQuantity(
        whole.checked_add(fractional).ok_or_else(err)? / denominator,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(parse_quantity("1").unwrap(), parse_quantity("1000m").unwrap());
        assert_eq!(parse_quantity("0.5").unwrap(), parse_quantity("500m").unwrap());
        assert!(parse_quantity("100m").unwrap() < parse_quantity("1").unwrap());
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_quantity("1Gi").unwrap(), parse_quantity("1024Mi").unwrap());
        assert_eq!(parse_quantity("1k").unwrap(), parse_quantity("1000").unwrap());
        assert_eq!(parse_quantity("1.5Gi").unwrap(), parse_quantity("1536Mi").unwrap());
        assert!(parse_quantity("10Gi").unwrap() > parse_quantity("10G").unwrap());
    }

    #[test]
    fn test_exponent_quantities() {
        assert_eq!(parse_quantity("1e3").unwrap(), parse_quantity("1k").unwrap());
        assert_eq!(parse_quantity("1e-3").unwrap(), parse_quantity("1m").unwrap());
    }

    #[test]
    fn test_invalid_quantities() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("1.2.3").is_err());
        assert!(parse_quantity("10XB").is_err());
        assert!(parse_quantity("-1").is_err());
    }
}
