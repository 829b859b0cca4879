//! # Reward Calculation
//!
//! Splits the epoch emission budget across participants in proportion to
//! voted target weight and observed liquidity.
//!
//! ## Accounting
//!
//! Every base unit of the budget ends up in exactly one bucket:
//!
//! 1. **Distributed**: paid to participants
//! 2. **Unrealized**: pools of weighted targets nobody supplied liquidity to
//! 3. **Rounding dust**: floors of `pool_k` and of each participant's cut
//!
//! Unrealized pools are never handed to other targets.

use crate::votes::GlobalWeightVector;
use crate::MAX_PUBLISH_WEIGHT;
use oceans_core::fixed::mul_div;
use oceans_core::{
    BlockHeight, EpochId, OceansError, OperatingKey, ParticipantKey, Position, Result, TargetId,
    Weight,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Per-participant reward for one epoch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardVector {
    /// Epoch number
    pub epoch: EpochId,

    /// Emission budget the vector was computed from
    pub emission_budget: u128,

    /// Reward by operating key, every observed participant present
    pub rewards: BTreeMap<OperatingKey, u128>,
}

impl RewardVector {
    /// Sum of all rewards
    pub fn total(&self) -> u128 {
        self.rewards.values().sum()
    }

    /// True when nobody earns anything
    pub fn is_empty_allocation(&self) -> bool {
        self.rewards.values().all(|r| *r == 0)
    }

    pub fn reward_of(&self, key: &OperatingKey) -> u128 {
        self.rewards.get(key).copied().unwrap_or(0)
    }

    /// Each reward as a fraction of the budget; sums to at most one
    pub fn normalized_shares(&self) -> Result<BTreeMap<OperatingKey, Weight>> {
        if self.emission_budget == 0 {
            return Ok(self
                .rewards
                .keys()
                .map(|k| (k.clone(), Weight::ZERO))
                .collect());
        }
        self.rewards
            .iter()
            .map(|(k, r)| Ok((k.clone(), Weight::from_ratio(*r, self.emission_budget)?)))
            .collect()
    }

    /// Rewards scaled so the largest becomes `u16::MAX`, in key order
    pub fn publish_weights(&self) -> Result<Vec<(OperatingKey, u16)>> {
        let max = self.rewards.values().copied().max().unwrap_or(0);
        self.rewards
            .iter()
            .map(|(k, r)| {
                let scaled = if max == 0 {
                    0
                } else {
                    mul_div(*r, MAX_PUBLISH_WEIGHT as u128, max)?
                };
                let weight = u16::try_from(scaled).map_err(|_| {
                    OceansError::ComputationInvariantViolation(format!(
                        "publish weight {} exceeds u16",
                        scaled
                    ))
                })?;
                Ok((k.clone(), weight))
            })
            .collect()
    }

    /// Content digest: blake3 over the canonical bincode encoding, hex
    pub fn digest(&self) -> Result<String> {
        let bytes =
            bincode::serialize(self).map_err(|e| OceansError::Serialization(e.to_string()))?;
        Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
    }
}

/// How one target's pool was split
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAllocation {
    /// Voted weight of the target
    pub weight: Weight,
    /// floor(E · weight)
    pub pool: u128,
    /// Total available liquidity observed in the target
    pub liquidity: u128,
    /// Amount of the pool actually paid out
    pub distributed: u128,
    /// Participants with positive liquidity
    pub providers: usize,
}

impl TargetAllocation {
    /// Pool with no liquidity behind it
    pub fn is_unrealized(&self) -> bool {
        self.liquidity == 0 && self.pool > 0
    }
}

/// Reward vector plus the accounting behind it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardOutcome {
    pub vector: RewardVector,
    pub distributed: u128,
    pub unrealized: u128,
    pub rounding_dust: u128,
    pub per_target: BTreeMap<TargetId, TargetAllocation>,
}

/// Pure reward engine
#[derive(Clone, Copy, Debug, Default)]
pub struct RewardEngine;

impl RewardEngine {
    pub fn new() -> Self {
        Self
    }

    /// Compute the reward vector for `weights` over `positions` with budget `budget`.
    ///
    /// Unavailable positions count as no liquidity for their unit. Several
    /// custody keys bound to one operating key have their rewards summed.
    ///
    /// Every pool and every share is floored, so the distributed total
    /// equals `budget` only up to `rounding_dust`, even when every weighted
    /// target has liquidity. `distributed + unrealized + rounding_dust`
    /// always equals `budget`.
    pub fn compute(
        &self,
        weights: &GlobalWeightVector,
        positions: &[Position],
        budget: u128,
    ) -> Result<RewardOutcome> {
        let epoch = weights.epoch;
        check_single_reference(epoch, positions)?;

        // Liquidity per target per participant
        let mut liquidity: BTreeMap<TargetId, BTreeMap<&ParticipantKey, u128>> = BTreeMap::new();
        let mut rewards: BTreeMap<OperatingKey, u128> = BTreeMap::new();

        for position in positions {
            rewards.entry(position.participant.operating.clone()).or_insert(0);
            let Some(value) = position.value.available() else {
                continue;
            };
            if value == 0 {
                continue;
            }
            let cell = liquidity
                .entry(position.target)
                .or_default()
                .entry(&position.participant)
                .or_insert(0);
            *cell = cell.checked_add(value).ok_or_else(|| {
                OceansError::ComputationInvariantViolation(format!(
                    "liquidity overflow for {} in {}",
                    position.participant.custody, position.target
                ))
            })?;
        }

        let mut per_target = BTreeMap::new();
        let mut distributed: u128 = 0;
        let mut unrealized: u128 = 0;

        for (target, weight) in &weights.weights {
            let pool = weight.apply(budget)?;

            let providers = liquidity.get(target);
            let total_liquidity = match providers {
                Some(cells) => cells
                    .values()
                    .try_fold(0u128, |acc, v| acc.checked_add(*v))
                    .ok_or_else(|| {
                        OceansError::ComputationInvariantViolation(format!(
                            "total liquidity overflow in {}",
                            target
                        ))
                    })?,
                None => 0,
            };

            let mut allocation = TargetAllocation {
                weight: *weight,
                pool,
                liquidity: total_liquidity,
                distributed: 0,
                providers: providers.map(|c| c.len()).unwrap_or(0),
            };

            match providers {
                Some(cells) if total_liquidity > 0 => {
                    for (participant, amount) in cells {
                        let reward = mul_div(pool, *amount, total_liquidity)?;
                        allocation.distributed += reward;
                        *rewards.entry(participant.operating.clone()).or_insert(0) += reward;
                    }
                }
                _ => {
                    if pool > 0 {
                        debug!("Epoch {}: {} has weight {} but no liquidity", epoch, target, weight);
                    }
                    unrealized += pool;
                }
            }

            distributed += allocation.distributed;
            per_target.insert(*target, allocation);
        }

        let rounding_dust = budget
            .checked_sub(distributed + unrealized)
            .ok_or_else(|| {
                OceansError::ComputationInvariantViolation(format!(
                    "epoch {} allocated {} of a {} budget",
                    epoch,
                    distributed + unrealized,
                    budget
                ))
            })?;

        let vector = RewardVector {
            epoch,
            emission_budget: budget,
            rewards,
        };
        if vector.total() != distributed {
            return Err(OceansError::ComputationInvariantViolation(format!(
                "epoch {} reward vector sums to {}, distributed {}",
                epoch,
                vector.total(),
                distributed
            )));
        }

        Ok(RewardOutcome {
            vector,
            distributed,
            unrealized,
            rounding_dust,
            per_target,
        })
    }
}

fn check_single_reference(epoch: EpochId, positions: &[Position]) -> Result<()> {
    let mut blocks = positions.iter().map(|p| p.reference_block);
    let Some(first) = blocks.next() else {
        return Ok(());
    };
    if let Some(other) = blocks.find(|b: &BlockHeight| *b != first) {
        return Err(OceansError::ComputationInvariantViolation(format!(
            "epoch {} positions observed at blocks {} and {}",
            epoch, first, other
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oceans_core::{PositionValue, UnavailableReason};
    use proptest::prelude::*;

    fn gwv(entries: &[(u16, u128, u128)]) -> GlobalWeightVector {
        GlobalWeightVector {
            epoch: EpochId(3),
            weights: entries
                .iter()
                .map(|(t, n, d)| (TargetId(*t), Weight::from_ratio(*n, *d).unwrap()))
                .collect(),
        }
    }

    fn position(who: &str, target: u16, value: u128) -> Position {
        Position {
            participant: ParticipantKey::new(format!("cold-{}", who), format!("hot-{}", who)),
            target: TargetId(target),
            reference_block: 1_080,
            value: PositionValue::Available { value },
        }
    }

    fn hot(who: &str) -> OperatingKey {
        OperatingKey::new(format!("hot-{}", who))
    }

    #[test]
    fn test_single_target_split() {
        let outcome = RewardEngine::new()
            .compute(
                &gwv(&[(1, 1, 1)]),
                &[position("p1", 1, 100), position("p2", 1, 300)],
                1_000,
            )
            .unwrap();

        assert_eq!(outcome.vector.reward_of(&hot("p1")), 250);
        assert_eq!(outcome.vector.reward_of(&hot("p2")), 750);
        assert_eq!(outcome.distributed, 1_000);
        assert_eq!(outcome.unrealized, 0);
        assert_eq!(outcome.rounding_dust, 0);
    }

    #[test]
    fn test_zero_liquidity_target_unrealized() {
        let outcome = RewardEngine::new()
            .compute(
                &gwv(&[(1, 1, 2), (2, 1, 2)]),
                &[position("p1", 1, 10), position("p2", 1, 30)],
                1_000,
            )
            .unwrap();

        // Target 2 keeps its half; nothing moves to target 1
        assert_eq!(outcome.vector.reward_of(&hot("p1")), 125);
        assert_eq!(outcome.vector.reward_of(&hot("p2")), 375);
        assert_eq!(outcome.unrealized, 500);
        assert!(outcome.per_target[&TargetId(2)].is_unrealized());
        assert!(outcome.vector.total() <= 1_000);
    }

    #[test]
    fn test_unavailable_positions_count_as_no_liquidity() {
        let mut missing = position("p2", 1, 0);
        missing.value = PositionValue::Unavailable {
            cause: UnavailableReason::Timeout,
        };
        let outcome = RewardEngine::new()
            .compute(&gwv(&[(1, 1, 1)]), &[position("p1", 1, 50), missing], 900)
            .unwrap();

        assert_eq!(outcome.vector.reward_of(&hot("p1")), 900);
        // Still listed, with nothing
        assert_eq!(outcome.vector.rewards.get(&hot("p2")), Some(&0));
    }

    #[test]
    fn test_custody_keys_sharing_operating_key_are_summed() {
        let mut second = position("p1", 1, 100);
        second.participant.custody = "cold-p1-b".into();
        let outcome = RewardEngine::new()
            .compute(
                &gwv(&[(1, 1, 1)]),
                &[position("p1", 1, 100), second, position("p2", 1, 200)],
                400,
            )
            .unwrap();
        assert_eq!(outcome.vector.reward_of(&hot("p1")), 200);
        assert_eq!(outcome.vector.reward_of(&hot("p2")), 200);
    }

    #[test]
    fn test_rounding_dust_accounted() {
        let outcome = RewardEngine::new()
            .compute(
                &gwv(&[(1, 1, 1)]),
                &[position("a", 1, 1), position("b", 1, 1), position("c", 1, 1)],
                100,
            )
            .unwrap();
        assert_eq!(outcome.distributed, 99);
        assert_eq!(outcome.rounding_dust, 1);
        assert_eq!(outcome.distributed + outcome.unrealized + outcome.rounding_dust, 100);
    }

    #[test]
    fn test_mixed_reference_blocks_rejected() {
        let mut late = position("p2", 1, 1);
        late.reference_block += 1;
        let err = RewardEngine::new()
            .compute(&gwv(&[(1, 1, 1)]), &[position("p1", 1, 1), late], 10)
            .unwrap_err();
        assert!(matches!(err, OceansError::ComputationInvariantViolation(_)));
    }

    #[test]
    fn test_publish_weights_max_normalized() {
        let vector = RewardVector {
            epoch: EpochId(1),
            emission_budget: 1_000,
            rewards: [(hot("a"), 250), (hot("b"), 750), (hot("c"), 0)]
                .into_iter()
                .collect(),
        };
        let weights = vector.publish_weights().unwrap();
        assert_eq!(
            weights,
            vec![(hot("a"), 21_845), (hot("b"), u16::MAX), (hot("c"), 0)]
        );

        let shares = vector.normalized_shares().unwrap();
        assert_eq!(shares[&hot("a")], Weight::from_ratio(1, 4).unwrap());
    }

    #[test]
    fn test_empty_allocation() {
        let vector = RewardVector {
            epoch: EpochId(1),
            emission_budget: 1_000,
            rewards: [(hot("a"), 0)].into_iter().collect(),
        };
        assert!(vector.is_empty_allocation());
        assert_eq!(vector.publish_weights().unwrap(), vec![(hot("a"), 0)]);
    }

    #[test]
    fn test_digest_stable() {
        let engine = RewardEngine::new();
        let weights = gwv(&[(1, 1, 3), (2, 2, 3)]);
        let positions = vec![position("p1", 1, 7), position("p2", 2, 11)];
        let a = engine.compute(&weights, &positions, 10_000).unwrap();
        let b = engine.compute(&weights, &positions, 10_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.vector.digest().unwrap(), b.vector.digest().unwrap());
        assert_eq!(a.vector.digest().unwrap().len(), 64);
    }

    proptest! {
        #[test]
        fn prop_budget_conserved(
            liquidity in proptest::collection::vec((0u16..4, 0u64..1_000_000), 0..30),
            budget in 0u64..u64::MAX,
        ) {
            let weights = gwv(&[(1, 1, 4), (2, 1, 4), (3, 1, 2)]);
            let positions: Vec<Position> = liquidity
                .iter()
                .enumerate()
                .map(|(i, (t, v))| position(&format!("p{}", i), *t, *v as u128))
                .collect();
            let outcome = RewardEngine::new().compute(&weights, &positions, budget as u128).unwrap();
            prop_assert!(outcome.vector.total() <= budget as u128);
            prop_assert_eq!(
                outcome.distributed + outcome.unrealized + outcome.rounding_dust,
                budget as u128
            );
        }

        #[test]
        fn prop_budget_exhausted_iff_every_weighted_target_supplied(
            liquidity in proptest::collection::vec((0u16..4, 0u64..1_000_000), 0..30),
            budget in 4u64..u64::MAX,
        ) {
            // With budget >= 4 every target below has a positive pool
            let weights = gwv(&[(1, 1, 4), (2, 1, 4), (3, 1, 2)]);
            let positions: Vec<Position> = liquidity
                .iter()
                .enumerate()
                .map(|(i, (t, v))| position(&format!("p{}", i), *t, *v as u128))
                .collect();
            let supplied = [1u16, 2, 3]
                .iter()
                .all(|t| liquidity.iter().any(|(target, v)| target == t && *v > 0));

            let outcome = RewardEngine::new().compute(&weights, &positions, budget as u128).unwrap();

            prop_assert_eq!(outcome.unrealized == 0, supplied);
            if supplied {
                prop_assert_eq!(outcome.distributed + outcome.rounding_dust, budget as u128);
            }
            // One unit at most per pool and per provider is lost to flooring
            prop_assert!(outcome.rounding_dust < 3 + positions.len() as u128);
        }

        #[test]
        fn prop_monotonic_in_own_liquidity(
            others in proptest::collection::vec(1u64..1_000_000, 1..10),
            mine in 0u64..1_000_000,
            extra in 1u64..1_000_000,
        ) {
            let weights = gwv(&[(1, 1, 1)]);
            let build = |own: u64| {
                let mut positions = vec![position("me", 1, own as u128)];
                positions.extend(
                    others
                        .iter()
                        .enumerate()
                        .map(|(i, v)| position(&format!("o{}", i), 1, *v as u128)),
                );
                RewardEngine::new().compute(&weights, &positions, 1_000_000_000).unwrap()
            };
            let before = build(mine);
            let after = build(mine + extra);
            prop_assert!(after.vector.reward_of(&hot("me")) >= before.vector.reward_of(&hot("me")));
            for i in 0..others.len() {
                let key = hot(&format!("o{}", i));
                prop_assert!(after.vector.reward_of(&key) <= before.vector.reward_of(&key));
            }
        }

        #[test]
        fn prop_order_independent(
            liquidity in proptest::collection::vec((1u16..3, 1u64..1_000), 1..20),
        ) {
            let weights = gwv(&[(1, 1, 3), (2, 2, 3)]);
            let mut positions: Vec<Position> = liquidity
                .iter()
                .enumerate()
                .map(|(i, (t, v))| position(&format!("p{}", i), *t, *v as u128))
                .collect();
            let forward = RewardEngine::new().compute(&weights, &positions, 1_000_000).unwrap();
            positions.reverse();
            let backward = RewardEngine::new().compute(&weights, &positions, 1_000_000).unwrap();
            prop_assert_eq!(forward, backward);
        }
    }
}
