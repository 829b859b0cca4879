//! Error types for the Oceans incentive pipeline

use crate::types::{EpochId, SourceKind};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, OceansError>;

/// Errors that can occur while computing an epoch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OceansError {
    // === Source Errors ===
    /// A consumed dependency did not answer within its deadline
    #[error("Source unavailable: {kind}: {detail}")]
    SourceUnavailable { kind: SourceKind, detail: String },

    /// A dependency answered with missing entries or stale data
    #[error("Source degraded: {kind}: {detail}")]
    SourceDegraded { kind: SourceKind, detail: String },

    /// A single read exceeded its timeout
    #[error("Read from {kind} timed out after {after_ms}ms")]
    Timeout { kind: SourceKind, after_ms: u64 },

    // === Computation Errors ===
    /// Programming-level bug; always fatal to the epoch
    #[error("Computation invariant violated: {0}")]
    ComputationInvariantViolation(String),

    /// Every participant's reward is zero; nothing worth publishing
    #[error("EmptyRewardVector: no participant earned a reward in epoch {0}")]
    EmptyRewardVector(EpochId),

    // === Publishing Errors ===
    /// Publisher rejected the submission or timed out
    #[error("Publish failure: {0}")]
    PublishFailure(String),

    // === Epoch Lifecycle ===
    /// Status change not permitted by the state machine
    #[error("Invalid epoch transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Epoch is terminal and cannot be written
    #[error("Epoch {0} is terminal and immutable")]
    EpochFinalized(EpochId),

    /// Epoch has no record
    #[error("Epoch not found: {0}")]
    EpochNotFound(EpochId),

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === General Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OceansError {
    pub fn unavailable(kind: SourceKind, detail: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            kind,
            detail: detail.into(),
        }
    }

    pub fn degraded(kind: SourceKind, detail: impl Into<String>) -> Self {
        Self::SourceDegraded {
            kind,
            detail: detail.into(),
        }
    }

    /// Error code reported in audit exports
    pub fn code(&self) -> u32 {
        match self {
            Self::SourceUnavailable { .. } | Self::Timeout { .. } => 2001,
            Self::SourceDegraded { .. } => 2002,
            Self::ComputationInvariantViolation(_) => 2003,
            Self::PublishFailure(_) => 2004,
            Self::InvalidTransition { .. } | Self::EpochFinalized(_) => 2005,
            Self::EpochNotFound(_) => 2006,
            Self::EmptyRewardVector(_) => 2007,
            _ => 9999,
        }
    }

    /// Worth retrying within the same epoch
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::Timeout { .. } | Self::PublishFailure(_)
        )
    }

    /// The source this error is attributed to, if any
    pub fn source_kind(&self) -> Option<SourceKind> {
        match self {
            Self::SourceUnavailable { kind, .. }
            | Self::SourceDegraded { kind, .. }
            | Self::Timeout { kind, .. } => Some(*kind),
            Self::PublishFailure(_) => Some(SourceKind::Publisher),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = OceansError::unavailable(SourceKind::VoteStore, "connection refused");
        assert_eq!(err.code(), 2001);
        assert_eq!(
            OceansError::ComputationInvariantViolation("sum".into()).code(),
            2003
        );
        let empty = OceansError::EmptyRewardVector(EpochId(4));
        assert_eq!(empty.code(), 2007);
        assert!(empty.to_string().starts_with("EmptyRewardVector"));
    }

    #[test]
    fn test_error_display() {
        let err = OceansError::Timeout {
            kind: SourceKind::Chain,
            after_ms: 10_000,
        };
        assert_eq!(err.to_string(), "Read from chain timed out after 10000ms");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(OceansError::PublishFailure("busy".into()).is_recoverable());
        assert!(!OceansError::ComputationInvariantViolation("x".into()).is_recoverable());
        assert_eq!(
            OceansError::PublishFailure("busy".into()).source_kind(),
            Some(SourceKind::Publisher)
        );
    }
}
