//! Fixed-point money in minor units (cents).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use crate::error::{FleetError, Result};

/// Cents per major currency unit
pub const CENTS_PER_UNIT: u64 = 100;

/// A non-negative amount in minor currency units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub u64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    pub fn from_major(units: u64) -> Self {
        Cents(units * CENTS_PER_UNIT)
    }

    /// Parse a decimal string such as `"12"`, `"12.5"` or `"12.34"`
    pub fn parse_decimal(input: &str) -> Result<Self> {
        let s = input.trim();
        let invalid = || FleetError::Validation(format!("invalid amount '{input}'"));
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let whole: u64 = whole.parse().map_err(|_| invalid())?;
        let frac_cents: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };
        whole
            .checked_mul(CENTS_PER_UNIT)
            .and_then(|c| c.checked_add(frac_cents))
            .map(Cents)
            .ok_or_else(invalid)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Multiply by a ratio in [0, 1], rounding to the nearest cent
    pub fn scale(self, ratio: f64) -> Cents {
        Cents((self.0 as f64 * ratio).round() as u64)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / CENTS_PER_UNIT, self.0 % CENTS_PER_UNIT)
    }
}

impl Add for Cents {
    type Output = Cents;
    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0 + rhs.0)
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Cents) {
        self.0 += rhs.0;
    }
}

impl Sub for Cents {
    type Output = Cents;
    fn sub(self, rhs: Cents) -> Cents {
        Cents(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Cents {
        iter.fold(Cents::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Cents> for Cents {
    fn sum<I: Iterator<Item = &'a Cents>>(iter: I) -> Cents {
        iter.copied().sum()
    }
}

/// Split `total` proportionally to `weights` with the largest-remainder
/// method. The parts always sum to exactly `total`; ties go to the earlier
/// weight. Returns all zeros when the weights sum to zero.
pub fn apportion(total: Cents, weights: &[f64]) -> Vec<Cents> {
    let weight_sum: f64 = weights.iter().sum();
    if weights.is_empty() || weight_sum <= 0.0 {
        return vec![Cents::ZERO; weights.len()];
    }

    let mut parts = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let exact = total.0 as f64 * (w / weight_sum);
        let floor = exact.floor();
        parts.push(floor as u64);
        remainders.push((i, exact - floor));
    }

    let assigned: u64 = parts.iter().sum();
    let mut leftover = total.0.saturating_sub(assigned);
    remainders.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    for (i, _) in remainders {
        if leftover == 0 {
            break;
        }
        parts[i] += 1;
        leftover -= 1;
    }

    parts.into_iter().map(Cents).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal() {
        assert_eq!(Cents::parse_decimal("12").unwrap(), Cents(1200));
        assert_eq!(Cents::parse_decimal("12.5").unwrap(), Cents(1250));
        assert_eq!(Cents::parse_decimal(" 0.07 ").unwrap(), Cents(7));
        assert!(Cents::parse_decimal("-3").is_err());
        assert!(Cents::parse_decimal("1.234").is_err());
        assert!(Cents::parse_decimal(".5").is_err());
        assert!(Cents::parse_decimal("abc").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Cents(75_000).to_string(), "750.00");
        assert_eq!(Cents(5).to_string(), "0.05");
    }

    #[test]
    fn test_scale_rounds_to_nearest_cent() {
        assert_eq!(Cents::from_major(1000).scale(0.75), Cents(75_000));
        assert_eq!(Cents(333).scale(0.15), Cents(50));
    }

    #[test]
    fn test_apportion_is_exact() {
        let parts = apportion(Cents(75_000), &[60.0, 40.0]);
        assert_eq!(parts, vec![Cents(45_000), Cents(30_000)]);

        let parts = apportion(Cents(100), &[1.0, 1.0, 1.0]);
        assert_eq!(parts, vec![Cents(34), Cents(33), Cents(33)]);
        assert_eq!(parts.iter().sum::<Cents>(), Cents(100));

        let weights: Vec<f64> = (1..=37).map(|i| i as f64 * 1.37).collect();
        let parts = apportion(Cents(999_999), &weights);
        assert_eq!(parts.iter().sum::<Cents>(), Cents(999_999));
    }

    #[test]
    fn test_apportion_zero_weights() {
        assert_eq!(apportion(Cents(10), &[0.0, 0.0]), vec![Cents::ZERO, Cents::ZERO]);
        assert!(apportion(Cents(10), &[]).is_empty());
    }
}
