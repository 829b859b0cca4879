//! # Fixed-Point Arithmetic
//!
//! All weight and reward math is integer math so that independent
//! recomputations reproduce bit-identical results.
//!
//! - A [`Weight`] is a count of parts per [`WEIGHT_SCALE`] (10^18).
//! - Products go through a 256-bit intermediate and are floored.
//! - Normalization to exactly one uses largest-remainder apportionment,
//!   ties broken by ascending key.

use crate::error::{OceansError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use primitive_types::U256;

/// Parts per unit for a [`Weight`]
pub const WEIGHT_SCALE: u128 = 1_000_000_000_000_000_000; // 10^18

/// Native base units a [`crate::Quote`] price refers to
pub const PRICE_SCALE: u128 = 1_000_000_000; // 10^9

/// Normalized weight in [0, 1], stored as parts per [`WEIGHT_SCALE`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weight(u128);

impl Weight {
    pub const ZERO: Weight = Weight(0);
    pub const ONE: Weight = Weight(WEIGHT_SCALE);

    /// Construct from raw parts; rejects values above one
    pub fn from_parts(parts: u128) -> Result<Self> {
        if parts > WEIGHT_SCALE {
            return Err(OceansError::InvalidInput(format!(
                "weight {} exceeds scale {}",
                parts, WEIGHT_SCALE
            )));
        }
        Ok(Self(parts))
    }

    /// floor(numerator / denominator) as a weight
    pub fn from_ratio(numerator: u128, denominator: u128) -> Result<Self> {
        if denominator == 0 || numerator > denominator {
            return Err(OceansError::InvalidInput(format!(
                "ratio {}/{} is not in [0, 1]",
                numerator, denominator
            )));
        }
        let parts = mul_div(numerator, WEIGHT_SCALE, denominator)?;
        Ok(Self(parts))
    }

    pub fn parts(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// floor(amount · self)
    pub fn apply(&self, amount: u128) -> Result<u128> {
        mul_div(amount, self.0, WEIGHT_SCALE)
    }

    /// Lossy conversion, for logs and metrics only
    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / WEIGHT_SCALE as f64
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:018}", self.0 / WEIGHT_SCALE, self.0 % WEIGHT_SCALE)
    }
}

/// floor(a · b / c) without intermediate overflow
pub fn mul_div(a: u128, b: u128, c: u128) -> Result<u128> {
    if c == 0 {
        return Err(OceansError::ComputationInvariantViolation(
            "division by zero in mul_div".to_string(),
        ));
    }
    let quotient = U256::from(a) * U256::from(b) / U256::from(c);
    to_u128(quotient)
}

/// Narrow a 256-bit value, treating overflow as an invariant violation
pub fn to_u128(value: U256) -> Result<u128> {
    if value > U256::from(u128::MAX) {
        return Err(OceansError::ComputationInvariantViolation(format!(
            "value {} does not fit in 128 bits",
            value
        )));
    }
    Ok(value.low_u128())
}

/// Split `total` across keys in proportion to `tallies`.
///
/// Every share is `floor(total · t / Σt)`; the leftover units go one each to
/// the largest remainders, ties broken by key order. The result always sums
/// to exactly `total` unless every tally is zero, in which case `Ok(None)`.
pub fn apportion<K: Clone + Ord>(
    total: u128,
    tallies: &[(K, U256)],
) -> Result<Option<Vec<(K, u128)>>> {
    let overflow = || {
        OceansError::ComputationInvariantViolation("apportionment tally overflow".to_string())
    };

    let mut sum = U256::zero();
    for (_, tally) in tallies {
        sum = sum.checked_add(*tally).ok_or_else(overflow)?;
    }
    if sum.is_zero() {
        return Ok(None);
    }

    let total_wide = U256::from(total);
    let mut shares: Vec<(K, u128, U256)> = Vec::with_capacity(tallies.len());
    for (key, tally) in tallies {
        let product = total_wide.checked_mul(*tally).ok_or_else(overflow)?;
        // tally <= sum, so floor <= total
        let floor = (product / sum).low_u128();
        shares.push((key.clone(), floor, product % sum));
    }

    let assigned: u128 = shares.iter().map(|(_, floor, _)| *floor).sum();
    let mut leftover = total.saturating_sub(assigned);

    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|&a, &b| {
        shares[b]
            .2
            .cmp(&shares[a].2)
            .then_with(|| shares[a].0.cmp(&shares[b].0))
    });
    for idx in order {
        if leftover == 0 {
            break;
        }
        if shares[idx].2.is_zero() {
            continue;
        }
        shares[idx].1 += 1;
        leftover -= 1;
    }

    let mut result: Vec<(K, u128)> = shares.into_iter().map(|(k, s, _)| (k, s)).collect();
    result.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_weight_display() {
        let quarter = Weight::from_ratio(1, 4).unwrap();
        assert_eq!(quarter.to_string(), "0.250000000000000000");
        assert_eq!(Weight::ONE.to_string(), "1.000000000000000000");
    }

    #[test]
    fn test_weight_rejects_above_one() {
        assert!(Weight::from_parts(WEIGHT_SCALE + 1).is_err());
        assert!(Weight::from_ratio(3, 2).is_err());
        assert!(Weight::from_ratio(1, 0).is_err());
    }

    #[test]
    fn test_mul_div_wide() {
        let big = u128::MAX / 2;
        assert_eq!(mul_div(big, 4, 4).unwrap(), big);
        assert!(mul_div(u128::MAX, 2, 1).is_err());
        assert!(mul_div(1, 1, 0).is_err());
    }

    #[test]
    fn test_apportion_thirds() {
        let tallies = vec![
            ("a", U256::from(1u8)),
            ("b", U256::from(1u8)),
            ("c", U256::from(1u8)),
        ];
        let shares = apportion(10, &tallies).unwrap().unwrap();
        // 3 + 3 + 3, the extra unit goes to the first key on a tie
        assert_eq!(shares, vec![("a", 4), ("b", 3), ("c", 3)]);
    }

    #[test]
    fn test_apportion_zero_tallies() {
        let tallies = vec![("a", U256::zero())];
        assert!(apportion(10, &tallies).unwrap().is_none());
    }

    #[test]
    fn test_apportion_keeps_zero_tally_at_zero() {
        let tallies = vec![("a", U256::from(1u8)), ("b", U256::zero()), ("c", U256::from(2u8))];
        let shares = apportion(WEIGHT_SCALE, &tallies).unwrap().unwrap();
        assert_eq!(shares[1], ("b", 0));
        assert_eq!(shares.iter().map(|(_, s)| s).sum::<u128>(), WEIGHT_SCALE);
    }

    proptest! {
        #[test]
        fn prop_apportion_sums_exactly(tallies in proptest::collection::vec(0u64..1_000_000, 1..20)) {
            let keyed: Vec<(usize, U256)> = tallies
                .iter()
                .enumerate()
                .map(|(i, t)| (i, U256::from(*t)))
                .collect();
            match apportion(WEIGHT_SCALE, &keyed).unwrap() {
                Some(shares) => {
                    prop_assert_eq!(shares.iter().map(|(_, s)| *s).sum::<u128>(), WEIGHT_SCALE);
                }
                None => prop_assert!(tallies.iter().all(|t| *t == 0)),
            }
        }
    }
}
