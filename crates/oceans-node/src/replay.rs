//! # Audit Replay
//!
//! Recomputes an exported epoch from the inputs it recorded and compares
//! the result with what was stored. Fresh weights are re-aggregated from the
//! vote and stake snapshots; reused weights are taken as recorded.

use oceans_core::{EpochId, OceansError, Result};
use oceans_economics::{AggregationOutcome, RewardEngine, VoteAggregator};
use oceans_storage::{EpochRecord, WeightOrigin};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Outcome of checking the weight vector
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum WeightCheck {
    /// Re-aggregated from the snapshots
    Recomputed { matches: bool },
    /// Carried over from an earlier epoch; taken as recorded
    Reused { from: EpochId },
    /// The epoch ended before weights were settled
    Absent,
}

/// Outcome of checking the reward vector
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RewardCheck {
    Recomputed {
        matches: bool,
        /// Digest of the recomputed vector
        digest: String,
        digest_matches: bool,
    },
    /// The epoch ended before rewards were computed
    Absent,
}

/// Result of replaying one epoch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub epoch: EpochId,
    pub weights: WeightCheck,
    pub rewards: RewardCheck,
}

impl ReplayReport {
    /// Every recomputed artifact equals the recorded one
    pub fn is_consistent(&self) -> bool {
        let weights_ok = !matches!(self.weights, WeightCheck::Recomputed { matches: false });
        let rewards_ok = match &self.rewards {
            RewardCheck::Recomputed {
                matches,
                digest_matches,
                ..
            } => *matches && *digest_matches,
            RewardCheck::Absent => true,
        };
        weights_ok && rewards_ok
    }
}

/// Replay `record` and report whether its weights and rewards reproduce.
///
/// Errors mean the record is malformed (e.g. snapshots missing for fresh
/// weights), not that it failed to reproduce.
pub fn verify(record: &EpochRecord) -> Result<ReplayReport> {
    let weights = match (&record.weights_origin, &record.weights) {
        (Some(WeightOrigin::Fresh), Some(recorded)) => {
            let (Some(votes), Some(stakes)) = (&record.votes, &record.stakes) else {
                return Err(OceansError::InvalidInput(format!(
                    "epoch {} has fresh weights but no snapshots",
                    record.epoch
                )));
            };
            let outcome = VoteAggregator::new().aggregate(votes, stakes, &record.eligible_targets)?;
            let matches = match &outcome {
                AggregationOutcome::Fresh { weights, .. } => weights == recorded,
                AggregationOutcome::NoEffectiveWeight { .. } => false,
            };
            if !matches {
                warn!("Epoch {} weight vector does not reproduce", record.epoch);
            }
            WeightCheck::Recomputed { matches }
        }
        (Some(WeightOrigin::Reused { from }), Some(_)) => WeightCheck::Reused { from: *from },
        (_, None) => WeightCheck::Absent,
        (None, Some(_)) => {
            return Err(OceansError::InvalidInput(format!(
                "epoch {} has weights of unknown origin",
                record.epoch
            )))
        }
    };

    let rewards = match (&record.weights, &record.rewards) {
        (Some(gwv), Some(recorded)) => {
            let outcome =
                RewardEngine::new().compute(gwv, &record.positions, record.emission_budget)?;
            let digest = outcome.vector.digest()?;
            let matches = outcome.vector == *recorded;
            let digest_matches = record.reward_digest.as_deref() == Some(digest.as_str());
            if !matches || !digest_matches {
                warn!("Epoch {} reward vector does not reproduce", record.epoch);
            }
            RewardCheck::Recomputed {
                matches,
                digest,
                digest_matches,
            }
        }
        _ => RewardCheck::Absent,
    };

    debug!("Replayed epoch {}: {:?} / {:?}", record.epoch, weights, rewards);
    Ok(ReplayReport {
        epoch: record.epoch,
        weights,
        rewards,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oceans_core::{
        Ballot, EpochId, HolderId, ParticipantKey, Position, PositionValue, ReferencePoint,
        TargetId,
    };
    use oceans_economics::{StakeSnapshot, VoteSnapshot};
    use std::collections::{BTreeMap, BTreeSet};

    fn finished_record() -> EpochRecord {
        let at = ReferencePoint::new(EpochId(3), 1_080);
        let eligible = BTreeSet::from([TargetId(1), TargetId(2)]);
        let mut record = EpochRecord::open(at, eligible.clone(), 1_000_000);

        let votes = VoteSnapshot::from_ballots(
            at,
            vec![
                Ballot {
                    holder: HolderId::new("h1"),
                    block: 1_000,
                    preferences: vec![(TargetId(1), 1)],
                },
                Ballot {
                    holder: HolderId::new("h2"),
                    block: 1_000,
                    preferences: vec![(TargetId(2), 1)],
                },
            ],
        );
        let stakes = StakeSnapshot::new(
            at,
            BTreeMap::from([(HolderId::new("h1"), 100), (HolderId::new("h2"), 300)]),
        );
        let outcome = VoteAggregator::new()
            .aggregate(&votes, &stakes, &eligible)
            .unwrap();
        let weights = outcome.weights().unwrap().clone();

        record.positions = vec![
            Position {
                participant: ParticipantKey::new("c1", "op1"),
                target: TargetId(1),
                reference_block: 1_080,
                value: PositionValue::Available { value: 500 },
            },
            Position {
                participant: ParticipantKey::new("c2", "op2"),
                target: TargetId(2),
                reference_block: 1_080,
                value: PositionValue::Available { value: 200 },
            },
        ];
        let rewards = RewardEngine::new()
            .compute(&weights, &record.positions, record.emission_budget)
            .unwrap();

        record.votes = Some(votes);
        record.stakes = Some(stakes);
        record.weights = Some(weights);
        record.weights_origin = Some(WeightOrigin::Fresh);
        record.reward_digest = Some(rewards.vector.digest().unwrap());
        record.rewards = Some(rewards.vector);
        record
    }

    #[test]
    fn test_recorded_epoch_reproduces() {
        let report = verify(&finished_record()).unwrap();
        assert_eq!(report.weights, WeightCheck::Recomputed { matches: true });
        assert!(report.is_consistent());
    }

    #[test]
    fn test_tampered_rewards_detected() {
        let mut record = finished_record();
        if let Some(rewards) = record.rewards.as_mut() {
            for amount in rewards.rewards.values_mut() {
                *amount += 1;
            }
        }
        let report = verify(&record).unwrap();
        assert!(matches!(
            report.rewards,
            RewardCheck::Recomputed { matches: false, .. }
        ));
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_tampered_stake_detected() {
        let mut record = finished_record();
        if let Some(stakes) = record.stakes.as_mut() {
            stakes.stakes.insert(HolderId::new("h1"), 900);
        }
        let report = verify(&record).unwrap();
        assert_eq!(report.weights, WeightCheck::Recomputed { matches: false });
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_reused_weights_taken_as_recorded() {
        let mut record = finished_record();
        record.votes = None;
        record.stakes = None;
        record.weights_origin = Some(WeightOrigin::Reused { from: EpochId(2) });
        let report = verify(&record).unwrap();
        assert_eq!(report.weights, WeightCheck::Reused { from: EpochId(2) });
        assert!(report.is_consistent());
    }

    #[test]
    fn test_fresh_weights_without_snapshots_rejected() {
        let mut record = finished_record();
        record.votes = None;
        assert!(verify(&record).is_err());
    }

    #[test]
    fn test_early_failure_has_nothing_to_check() {
        let at = ReferencePoint::new(EpochId(1), 360);
        let record = EpochRecord::open(at, BTreeSet::from([TargetId(1)]), 10);
        let report = verify(&record).unwrap();
        assert_eq!(report.weights, WeightCheck::Absent);
        assert_eq!(report.rewards, RewardCheck::Absent);
    }
}
