//! # Epoch Status
//!
//! ```text
//! Open → SnapshotCollecting → Computing → Published → Finalized
//!              ↓                  ↓           ↓
//!                             Failed
//! ```
//!
//! Staleness and degradation are markers carried next to the status by the
//! epoch record, not states of their own.

use crate::error::{OceansError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one epoch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EpochStatus {
    /// Created, waiting for the boundary
    Open,
    /// Vote and position snapshots are being collected
    SnapshotCollecting,
    /// Reward engine running on frozen inputs
    Computing,
    /// Publisher acknowledged the reward vector
    Published,
    /// Publication confirmed durable
    Finalized,
    /// Terminal failure; the next epoch is the recovery path
    Failed { reason: String },
}

impl EpochStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EpochStatus::Finalized | EpochStatus::Failed { .. })
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, EpochStatus::Finalized)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EpochStatus::Failed { .. })
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: &EpochStatus) -> bool {
        use EpochStatus::*;
        match (self, next) {
            (Open, SnapshotCollecting) => true,
            (SnapshotCollecting, Computing) => true,
            (Computing, Published) => true,
            (Published, Finalized) => true,
            (Open | SnapshotCollecting | Computing | Published, Failed { .. }) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the machine does not allow
    pub fn transition(&mut self, next: EpochStatus) -> Result<()> {
        if !self.can_transition_to(&next) {
            return Err(OceansError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl Default for EpochStatus {
    fn default() -> Self {
        EpochStatus::Open
    }
}

impl fmt::Display for EpochStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochStatus::Open => f.write_str("open"),
            EpochStatus::SnapshotCollecting => f.write_str("snapshot-collecting"),
            EpochStatus::Computing => f.write_str("computing"),
            EpochStatus::Published => f.write_str("published"),
            EpochStatus::Finalized => f.write_str("finalized"),
            EpochStatus::Failed { reason } => write!(f, "failed ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut status = EpochStatus::default();
        for next in [
            EpochStatus::SnapshotCollecting,
            EpochStatus::Computing,
            EpochStatus::Published,
            EpochStatus::Finalized,
        ] {
            status.transition(next).unwrap();
        }
        assert!(status.is_finalized());
        assert!(status.is_terminal());
    }

    #[test]
    fn test_no_skipping_states() {
        let mut status = EpochStatus::Open;
        let err = status.transition(EpochStatus::Computing).unwrap_err();
        assert!(matches!(err, OceansError::InvalidTransition { .. }));
        assert_eq!(status, EpochStatus::Open);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let failed = EpochStatus::Failed {
            reason: "publish".into(),
        };
        assert!(!failed.can_transition_to(&EpochStatus::Open));
        assert!(!EpochStatus::Finalized.can_transition_to(&EpochStatus::Failed {
            reason: "late".into()
        }));
    }

    #[test]
    fn test_any_live_state_can_fail() {
        let failed = EpochStatus::Failed { reason: "x".into() };
        assert!(EpochStatus::SnapshotCollecting.can_transition_to(&failed));
        assert!(EpochStatus::Published.can_transition_to(&failed));
    }
}
