//! Core identifiers and observation types

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Chain block height
pub type BlockHeight = u64;

/// Sequence number of an epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochId(pub u64);

impl EpochId {
    /// The epoch immediately before this one, if any
    pub fn previous(&self) -> Option<EpochId> {
        self.0.checked_sub(1).map(EpochId)
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocation destination: a liquidity pool tied to a subnet
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u16);

impl TargetId {
    /// The root network never receives weight
    pub const ROOT: TargetId = TargetId(0);

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sn{}", self.0)
    }
}

/// A target together with its eligibility for one epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub eligible: bool,
}

/// Build the eligible set from a list of targets, never including root
pub fn eligible_set<I: IntoIterator<Item = Target>>(targets: I) -> BTreeSet<TargetId> {
    targets
        .into_iter()
        .filter(|t| t.eligible && !t.id.is_root())
        .map(|t| t.id)
        .collect()
}

macro_rules! string_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Abbreviated form for log lines
            pub fn short(&self) -> &str {
                let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
                &self.0[..end]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_key!(
    /// Identity of a voting stakeholder
    HolderId
);
string_key!(
    /// Key that owns a participant's funds and positions
    CustodyKey
);
string_key!(
    /// Key that receives a participant's rewards
    OperatingKey
);
string_key!(
    /// Native asset identifier as reported by the chain
    AssetId
);

/// Miner identity: custody key bound to an operating key at epoch close
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantKey {
    /// Owns the liquidity positions
    pub custody: CustodyKey,
    /// Receives the rewards
    pub operating: OperatingKey,
}

impl ParticipantKey {
    pub fn new(custody: impl Into<String>, operating: impl Into<String>) -> Self {
        Self {
            custody: CustodyKey::new(custody),
            operating: OperatingKey::new(operating),
        }
    }
}

/// The single instant every source is queried at for one epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferencePoint {
    /// Epoch being computed
    pub epoch: EpochId,
    /// Reference block (observation horizon)
    pub block: BlockHeight,
}

impl ReferencePoint {
    pub fn new(epoch: EpochId, block: BlockHeight) -> Self {
        Self { epoch, block }
    }
}

impl fmt::Display for ReferencePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {} @ block {}", self.epoch, self.block)
    }
}

/// A holder's ballot as read from the vote store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub holder: HolderId,
    /// Block at which the ballot was cast
    pub block: BlockHeight,
    /// Raw, holder-scaled, non-negative preferences
    pub preferences: Vec<(TargetId, u128)>,
}

/// Native-asset amount inside a liquidity position
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeAmount {
    pub asset: AssetId,
    /// Amount in the asset's base units
    pub amount: u128,
}

/// Price oracle quote
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub asset: AssetId,
    /// Block the quote was observed at
    pub block: BlockHeight,
    /// Common-unit base units per [`crate::PRICE_SCALE`] native base units
    pub price: u128,
}

/// Why a position could not be valued
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// Oracle has no quote at or before the reference block
    NoQuote { asset: AssetId },
    /// Latest quote is older than the staleness window
    StaleQuote { asset: AssetId, quote_block: BlockHeight },
    /// Chain read returned an error
    ReadFailed { detail: String },
    /// Chain or oracle read exceeded its timeout
    Timeout,
}

/// Value of a position in the common unit, or why it is missing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionValue {
    Available { value: u128 },
    Unavailable { cause: UnavailableReason },
}

impl PositionValue {
    pub fn available(&self) -> Option<u128> {
        match self {
            PositionValue::Available { value } => Some(*value),
            PositionValue::Unavailable { .. } => None,
        }
    }

    /// True when the chain itself could not be read for this unit
    pub fn is_read_failure(&self) -> bool {
        matches!(
            self,
            PositionValue::Unavailable {
                cause: UnavailableReason::ReadFailed { .. } | UnavailableReason::Timeout
            }
        )
    }
}

/// One (participant, target) observation at the epoch's reference block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub participant: ParticipantKey,
    pub target: TargetId,
    pub reference_block: BlockHeight,
    pub value: PositionValue,
}

/// External collaborator that produced (or failed to produce) data
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    VoteStore,
    StakeSnapshot,
    Registry,
    Chain,
    PriceOracle,
    Publisher,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::VoteStore => "vote-store",
            SourceKind::StakeSnapshot => "stake-snapshot",
            SourceKind::Registry => "registry",
            SourceKind::Chain => "chain",
            SourceKind::PriceOracle => "price-oracle",
            SourceKind::Publisher => "publisher",
        };
        f.write_str(name)
    }
}

/// Severity of a source problem
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Answered, but with missing entries or stale data
    Degraded,
    /// Did not answer within its deadline
    Unavailable,
}

/// Failure flag attached to an epoch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFlag {
    pub source: SourceKind,
    pub severity: Severity,
    pub detail: String,
}

impl SourceFlag {
    pub fn degraded(source: SourceKind, detail: impl Into<String>) -> Self {
        Self {
            source,
            severity: Severity::Degraded,
            detail: detail.into(),
        }
    }

    pub fn unavailable(source: SourceKind, detail: impl Into<String>) -> Self {
        Self {
            source,
            severity: Severity::Unavailable,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligible_set_excludes_root() {
        let set = eligible_set(vec![
            Target { id: TargetId(0), eligible: true },
            Target { id: TargetId(10), eligible: true },
            Target { id: TargetId(27), eligible: false },
        ]);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![TargetId(10)]);
    }

    #[test]
    fn test_short_key() {
        let key = HolderId::new("5HdK1zyMbMoq1NM2sDL2Len9");
        assert_eq!(key.short(), "5HdK1zyM");
        assert_eq!(HolderId::new("abc").short(), "abc");
    }

    #[test]
    fn test_position_value_serde() {
        let value = PositionValue::Unavailable {
            cause: UnavailableReason::StaleQuote {
                asset: AssetId::new("alpha-10"),
                quote_block: 90,
            },
        };
        let json = serde_json::to_string(&value).unwrap();
        let back: PositionValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
        assert!(!value.is_read_failure());
    }

    #[test]
    fn test_epoch_previous() {
        assert_eq!(EpochId(5).previous(), Some(EpochId(4)));
        assert_eq!(EpochId(0).previous(), None);
    }
}
