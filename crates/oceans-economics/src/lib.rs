//! # Oceans Economics - Vote Aggregation & Reward Engine
//!
//! Pure, synchronous, integer-only functions that turn frozen epoch inputs
//! into a published allocation.
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐
//! │ VoteSnapshot │ + │ StakeSnapshot  │ ──► VoteAggregator ──► GlobalWeightVector ─┐
//! └──────────────┘   └────────────────┘                                           │
//!                                                                                 ▼
//!                       Position set ──────────────────────────────────────► RewardEngine ──► RewardVector
//!                                                                                 ▲
//!                                                            emission budget E ───┘
//! ```
//!
//! ## Reward Formula
//!
//! | Term | Meaning |
//! |------|---------|
//! | `pool_k = ⌊E · W_k⌋` | Budget share of target k |
//! | `r_{i,k} = ⌊pool_k · L_{i,k} / L_k⌋` | Participant i's cut of target k |
//! | `L_k = 0` | Pool is unrealized, never redistributed |

pub mod rewards;
pub mod votes;

// Re-exports
pub use rewards::{RewardEngine, RewardOutcome, RewardVector, TargetAllocation};
pub use votes::{
    AggregationOutcome, AggregationStats, GlobalWeightVector, StakeSnapshot, VoteAggregator,
    VoteSnapshot,
};

/// Emission constants
pub mod constants {
    /// Decimal places of the emission unit
    pub const DECIMALS: u8 = 9;

    /// One emission unit in base units
    pub const ONE_UNIT: u128 = 1_000_000_000; // 10^9

    /// Default emission budget per epoch
    pub const DEFAULT_EPOCH_EMISSION: u128 = ONE_UNIT;

    /// Maximum value of a published weight
    pub const MAX_PUBLISH_WEIGHT: u16 = u16::MAX;
}

pub use constants::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_emission() {
        assert_eq!(DEFAULT_EPOCH_EMISSION, 10u128.pow(DECIMALS as u32));
    }
}
