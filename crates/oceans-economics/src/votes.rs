//! # Vote Aggregation
//!
//! Combines holder ballots with the stake snapshot taken at the same
//! reference point into a [`GlobalWeightVector`].
//!
//! 1. Each holder's preferences are normalized to sum to one (a zero vector
//!    contributes nothing).
//! 2. The normalized vector is scaled by the holder's stake; holders without
//!    stake are skipped.
//! 3. Tallies are summed per target, ineligible targets are dropped, and the
//!    remainder is apportioned to exactly [`Weight::ONE`].

use oceans_core::fixed::{apportion, U256};
use oceans_core::{
    Ballot, BlockHeight, EpochId, HolderId, OceansError, ReferencePoint, Result, TargetId,
    Weight, WEIGHT_SCALE,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One holder's effective ballot for an epoch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderBallot {
    /// Block the ballot was cast at
    pub cast_at: BlockHeight,
    /// Raw preferences, duplicate targets merged
    pub preferences: BTreeMap<TargetId, u128>,
}

/// Frozen vote store read for one reference point
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSnapshot {
    pub reference: ReferencePoint,
    pub ballots: BTreeMap<HolderId, HolderBallot>,
    /// Ballots ignored because they were cast after the reference block
    #[serde(default)]
    pub discarded_late: usize,
}

impl VoteSnapshot {
    /// Freeze raw ballots.
    ///
    /// A holder may appear several times; the latest ballot cast at or before
    /// the reference block wins. Equal blocks are resolved by comparing the
    /// merged preference lists, so the result never depends on input order.
    pub fn from_ballots(reference: ReferencePoint, ballots: Vec<Ballot>) -> Self {
        let mut chosen: BTreeMap<HolderId, HolderBallot> = BTreeMap::new();
        let mut discarded_late = 0;

        for ballot in ballots {
            if ballot.block > reference.block {
                discarded_late += 1;
                continue;
            }

            let mut preferences: BTreeMap<TargetId, u128> = BTreeMap::new();
            for (target, value) in ballot.preferences {
                let entry = preferences.entry(target).or_insert(0);
                *entry = entry.saturating_add(value);
            }
            let candidate = HolderBallot {
                cast_at: ballot.block,
                preferences,
            };

            match chosen.get(&ballot.holder) {
                Some(existing) if !supersedes(&candidate, existing) => {}
                _ => {
                    chosen.insert(ballot.holder, candidate);
                }
            }
        }

        if discarded_late > 0 {
            debug!(
                "Discarded {} ballots cast after block {}",
                discarded_late, reference.block
            );
        }

        Self {
            reference,
            ballots: chosen,
            discarded_late,
        }
    }

    pub fn len(&self) -> usize {
        self.ballots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ballots.is_empty()
    }
}

fn supersedes(candidate: &HolderBallot, existing: &HolderBallot) -> bool {
    (candidate.cast_at, &candidate.preferences) > (existing.cast_at, &existing.preferences)
}

/// Frozen stake snapshot for one reference point
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeSnapshot {
    pub reference: ReferencePoint,
    pub stakes: BTreeMap<HolderId, u128>,
}

impl StakeSnapshot {
    pub fn new(reference: ReferencePoint, stakes: BTreeMap<HolderId, u128>) -> Self {
        Self { reference, stakes }
    }

    pub fn stake_of(&self, holder: &HolderId) -> u128 {
        self.stakes.get(holder).copied().unwrap_or(0)
    }
}

/// Normalized, stake-weighted preference over eligible targets
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalWeightVector {
    /// Epoch the vector was computed for
    pub epoch: EpochId,
    /// One entry per eligible target, summing to exactly one
    pub weights: BTreeMap<TargetId, Weight>,
}

impl GlobalWeightVector {
    /// Weight of `target`; ineligible targets carry zero
    pub fn weight(&self, target: &TargetId) -> Weight {
        self.weights.get(target).copied().unwrap_or(Weight::ZERO)
    }

    /// Sum of all weights in parts
    pub fn total_parts(&self) -> u128 {
        self.weights.values().map(|w| w.parts()).sum()
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetId> {
        self.weights.keys()
    }

    /// Verify the vector is normalized over exactly `eligible`
    pub fn check(&self, eligible: &BTreeSet<TargetId>) -> Result<()> {
        if let Some(stray) = self.weights.keys().find(|t| !eligible.contains(t)) {
            return Err(OceansError::ComputationInvariantViolation(format!(
                "weight vector for epoch {} assigns weight to ineligible target {}",
                self.epoch, stray
            )));
        }
        let total = self.total_parts();
        if total != WEIGHT_SCALE {
            return Err(OceansError::ComputationInvariantViolation(format!(
                "weight vector for epoch {} sums to {} parts, expected {}",
                self.epoch, total, WEIGHT_SCALE
            )));
        }
        Ok(())
    }

    /// Carry this vector into `epoch`, renormalized over the current
    /// eligible set. `None` when no weighted target remains eligible.
    pub fn restricted_to(
        &self,
        epoch: EpochId,
        eligible: &BTreeSet<TargetId>,
    ) -> Result<Option<GlobalWeightVector>> {
        let tallies: Vec<(TargetId, U256)> = eligible
            .iter()
            .map(|t| (*t, U256::from(self.weight(t).parts())))
            .collect();
        let Some(shares) = apportion(WEIGHT_SCALE, &tallies)? else {
            return Ok(None);
        };
        let weights = shares
            .into_iter()
            .map(|(t, parts)| Ok((t, Weight::from_parts(parts)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Some(GlobalWeightVector { epoch, weights }))
    }
}

/// Counters describing one aggregation run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationStats {
    /// Holders whose ballot contributed
    pub holders_counted: usize,
    /// Holders skipped for zero or missing stake
    pub holders_without_stake: usize,
    /// Holders who voted an all-zero vector
    pub holders_zero_vector: usize,
    /// Targets with tallies that were dropped as ineligible
    pub ineligible_targets_dropped: Vec<TargetId>,
    /// Stake of counted holders
    pub counted_stake: u128,
}

/// Result of aggregating one epoch's votes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggregationOutcome {
    /// A fresh, normalized weight vector
    Fresh {
        weights: GlobalWeightVector,
        stats: AggregationStats,
    },
    /// No stake-weighted preference reached an eligible target
    NoEffectiveWeight { stats: AggregationStats },
}

impl AggregationOutcome {
    pub fn stats(&self) -> &AggregationStats {
        match self {
            AggregationOutcome::Fresh { stats, .. } => stats,
            AggregationOutcome::NoEffectiveWeight { stats } => stats,
        }
    }

    pub fn weights(&self) -> Option<&GlobalWeightVector> {
        match self {
            AggregationOutcome::Fresh { weights, .. } => Some(weights),
            AggregationOutcome::NoEffectiveWeight { .. } => None,
        }
    }
}

/// Stake-weighted vote aggregator
#[derive(Clone, Copy, Debug, Default)]
pub struct VoteAggregator;

impl VoteAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Aggregate frozen snapshots into a weight vector over `eligible`
    pub fn aggregate(
        &self,
        votes: &VoteSnapshot,
        stakes: &StakeSnapshot,
        eligible: &BTreeSet<TargetId>,
    ) -> Result<AggregationOutcome> {
        if votes.reference != stakes.reference {
            return Err(OceansError::ComputationInvariantViolation(format!(
                "vote snapshot at {} and stake snapshot at {} differ",
                votes.reference, stakes.reference
            )));
        }

        let epoch = votes.reference.epoch;
        let mut stats = AggregationStats::default();
        let mut tallies: BTreeMap<TargetId, U256> = BTreeMap::new();

        for (holder, ballot) in &votes.ballots {
            let stake = stakes.stake_of(holder);
            if stake == 0 {
                stats.holders_without_stake += 1;
                continue;
            }

            let shares = normalized_preferences(ballot);
            if shares.is_empty() {
                stats.holders_zero_vector += 1;
                continue;
            }

            for (target, share) in shares {
                let contribution = U256::from(stake) * U256::from(share);
                let tally = tallies.entry(target).or_insert_with(U256::zero);
                *tally = tally.checked_add(contribution).ok_or_else(|| {
                    OceansError::ComputationInvariantViolation(format!(
                        "tally overflow for target {}",
                        target
                    ))
                })?;
            }

            stats.holders_counted += 1;
            stats.counted_stake = stats.counted_stake.saturating_add(stake);
        }

        stats.ineligible_targets_dropped = tallies
            .iter()
            .filter(|(t, tally)| !eligible.contains(*t) && !tally.is_zero())
            .map(|(t, _)| *t)
            .collect();

        // Every eligible target stays in the denominator, voted or not
        let eligible_tallies: Vec<(TargetId, U256)> = eligible
            .iter()
            .map(|t| (*t, tallies.get(t).copied().unwrap_or_else(U256::zero)))
            .collect();

        let Some(shares) = apportion(WEIGHT_SCALE, &eligible_tallies)? else {
            debug!(
                "Epoch {}: no effective vote weight ({} holders counted)",
                epoch, stats.holders_counted
            );
            return Ok(AggregationOutcome::NoEffectiveWeight { stats });
        };

        let weights = shares
            .into_iter()
            .map(|(t, parts)| Ok((t, Weight::from_parts(parts)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let vector = GlobalWeightVector { epoch, weights };
        vector.check(eligible)?;

        Ok(AggregationOutcome::Fresh {
            weights: vector,
            stats,
        })
    }
}

/// Normalized preference of a single holder, in weight parts.
///
/// Targets voted with zero are left out; a zero vector yields an empty map.
pub fn normalized_preferences(ballot: &HolderBallot) -> BTreeMap<TargetId, u128> {
    let total = ballot
        .preferences
        .values()
        .fold(U256::zero(), |acc, v| acc + U256::from(*v));
    if total.is_zero() {
        return BTreeMap::new();
    }
    ballot
        .preferences
        .iter()
        .filter(|(_, v)| **v != 0)
        .map(|(t, v)| {
            // v <= total, so the share is at most WEIGHT_SCALE
            let share = U256::from(*v) * U256::from(WEIGHT_SCALE) / total;
            (*t, share.low_u128())
        })
        .collect()
}
