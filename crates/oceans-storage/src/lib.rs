//! # Oceans Storage
//!
//! Append-only epoch records held in memory, optionally mirrored to a
//! directory of JSON files so audits survive restarts.
//!
//! ## Storage Layout
//!
//! - `epoch-<n>.json` - one [`EpochRecord`] per epoch, rewritten on every
//!   status change until the epoch is terminal
//!
//! Terminal records (Finalized, Failed) are never rewritten.

pub mod record {
    //! Audit record of one epoch

    use chrono::{DateTime, Utc};
    use oceans_core::{
        EpochId, EpochStatus, Position, ReferencePoint, SourceFlag, TargetId,
    };
    use oceans_economics::{
        AggregationStats, GlobalWeightVector, RewardVector, StakeSnapshot, VoteSnapshot,
    };
    use oceans_observer::{ExcludedParticipant, UnitFailure};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    /// Where an epoch's weight vector came from
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum WeightOrigin {
        /// Aggregated from this epoch's snapshots
        Fresh,
        /// Carried over from an earlier epoch
        Reused { from: EpochId },
    }

    /// Budget accounting of the reward computation
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RewardAccounting {
        pub distributed: u128,
        pub unrealized: u128,
        pub rounding_dust: u128,
    }

    /// One publish submission
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PublishAttempt {
        /// 1-based attempt number
        pub attempt: u32,
        pub at: DateTime<Utc>,
        pub accepted: bool,
        pub detail: String,
    }

    /// Terminal failure details
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FailureInfo {
        /// Error code of the cause
        pub code: u32,
        pub reason: String,
    }

    /// Everything needed to inspect or replay one epoch
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EpochRecord {
        /// Epoch number
        pub epoch: EpochId,

        /// Reference point every source was queried at
        pub reference: ReferencePoint,

        pub status: EpochStatus,

        /// Weight vector was reused from an earlier epoch
        pub stale: bool,

        /// At least one source answered incompletely
        pub degraded: bool,

        pub eligible_targets: BTreeSet<TargetId>,

        pub emission_budget: u128,

        /// Raw vote snapshot (absent when the vote store was unavailable)
        pub votes: Option<VoteSnapshot>,

        /// Raw stake snapshot (absent when unavailable)
        pub stakes: Option<StakeSnapshot>,

        pub aggregation: Option<AggregationStats>,

        pub weights: Option<GlobalWeightVector>,

        pub weights_origin: Option<WeightOrigin>,

        /// Full observed position set
        pub positions: Vec<Position>,

        pub excluded: Vec<ExcludedParticipant>,

        pub unit_failures: Vec<UnitFailure>,

        pub rewards: Option<RewardVector>,

        pub accounting: Option<RewardAccounting>,

        /// Hex blake3 digest of the reward vector
        pub reward_digest: Option<String>,

        pub publish_attempts: Vec<PublishAttempt>,

        pub flags: Vec<SourceFlag>,

        pub failure: Option<FailureInfo>,

        pub created_at: DateTime<Utc>,

        pub updated_at: DateTime<Utc>,

        pub finalized_at: Option<DateTime<Utc>>,
    }

    impl EpochRecord {
        /// Fresh record in the `Open` state
        pub fn open(
            reference: ReferencePoint,
            eligible_targets: BTreeSet<TargetId>,
            emission_budget: u128,
        ) -> Self {
            let now = Utc::now();
            Self {
                epoch: reference.epoch,
                reference,
                status: EpochStatus::Open,
                stale: false,
                degraded: false,
                eligible_targets,
                emission_budget,
                votes: None,
                stakes: None,
                aggregation: None,
                weights: None,
                weights_origin: None,
                positions: Vec::new(),
                excluded: Vec::new(),
                unit_failures: Vec::new(),
                rewards: None,
                accounting: None,
                reward_digest: None,
                publish_attempts: Vec::new(),
                flags: Vec::new(),
                failure: None,
                created_at: now,
                updated_at: now,
                finalized_at: None,
            }
        }

        pub fn is_terminal(&self) -> bool {
            self.status.is_terminal()
        }

        /// Attach a source flag, marking the epoch degraded
        pub fn flag(&mut self, flag: SourceFlag) {
            self.degraded = true;
            self.flags.push(flag);
        }

        pub fn touch(&mut self) {
            self.updated_at = Utc::now();
        }
    }
}

pub mod error {
    //! Storage errors

    use oceans_core::{EpochId, OceansError};
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum StorageError {
        #[error("Epoch {0} is terminal and cannot be rewritten")]
        Immutable(EpochId),

        #[error("Epoch {0} not found")]
        NotFound(EpochId),

        #[error("Epoch {epoch} is still {status}; only terminal epochs can be exported")]
        NotTerminal { epoch: EpochId, status: String },

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Serialization error: {0}")]
        Serialization(#[from] serde_json::Error),
    }

    impl From<StorageError> for OceansError {
        fn from(err: StorageError) -> Self {
            match err {
                StorageError::Immutable(epoch) => OceansError::EpochFinalized(epoch),
                StorageError::NotFound(epoch) => OceansError::EpochNotFound(epoch),
                StorageError::Serialization(e) => OceansError::Serialization(e.to_string()),
                other => OceansError::Storage(other.to_string()),
            }
        }
    }

    pub type StorageResult<T> = std::result::Result<T, StorageError>;
}

pub mod epoch_db {
    //! Epoch record persistence

    use crate::error::{StorageError, StorageResult};
    use crate::export::AuditExport;
    use crate::record::EpochRecord;
    use oceans_core::EpochId;
    use oceans_economics::GlobalWeightVector;
    use parking_lot::RwLock;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tracing::{debug, info};

    /// Epoch records keyed by epoch, optionally backed by a directory
    pub struct EpochStore {
        records: RwLock<BTreeMap<EpochId, EpochRecord>>,
        dir: Option<PathBuf>,
    }

    impl EpochStore {
        /// Records live only as long as the process
        pub fn in_memory() -> Self {
            Self {
                records: RwLock::new(BTreeMap::new()),
                dir: None,
            }
        }

        /// Open (or create) a directory-backed store, loading existing records
        pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
            let dir = dir.as_ref().to_path_buf();
            fs::create_dir_all(&dir)?;

            let mut records = BTreeMap::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let is_record = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("epoch-") && n.ends_with(".json"))
                    .unwrap_or(false);
                if !is_record {
                    continue;
                }
                let record: EpochRecord = serde_json::from_slice(&fs::read(&path)?)?;
                records.insert(record.epoch, record);
            }

            info!("Loaded {} epoch records from {}", records.len(), dir.display());
            Ok(Self {
                records: RwLock::new(records),
                dir: Some(dir),
            })
        }

        /// Insert or update a record; terminal records are frozen
        pub fn put(&self, record: EpochRecord) -> StorageResult<()> {
            let mut records = self.records.write();
            if let Some(existing) = records.get(&record.epoch) {
                if existing.is_terminal() {
                    return Err(StorageError::Immutable(record.epoch));
                }
            }

            if let Some(dir) = &self.dir {
                write_atomic(dir, &record)?;
            }
            debug!("Stored epoch {} as {}", record.epoch, record.status);
            records.insert(record.epoch, record);
            Ok(())
        }

        pub fn get(&self, epoch: EpochId) -> Option<EpochRecord> {
            self.records.read().get(&epoch).cloned()
        }

        pub fn contains(&self, epoch: EpochId) -> bool {
            self.records.read().contains_key(&epoch)
        }

        /// Most recent record
        pub fn latest(&self) -> Option<EpochRecord> {
            self.records.read().values().next_back().cloned()
        }

        /// Weight vector of the most recent epoch before `epoch` that has one
        pub fn latest_weights_before(
            &self,
            epoch: EpochId,
        ) -> Option<(EpochId, GlobalWeightVector)> {
            self.records
                .read()
                .range(..epoch)
                .rev()
                .find_map(|(id, record)| record.weights.clone().map(|w| (*id, w)))
        }

        /// Epoch ids with their current status, ascending
        pub fn list(&self) -> Vec<(EpochId, String)> {
            self.records
                .read()
                .values()
                .map(|r| (r.epoch, r.status.to_string()))
                .collect()
        }

        pub fn len(&self) -> usize {
            self.records.read().len()
        }

        pub fn is_empty(&self) -> bool {
            self.records.read().is_empty()
        }

        /// Audit export of a terminal epoch
        pub fn export(&self, epoch: EpochId) -> StorageResult<AuditExport> {
            let record = self.get(epoch).ok_or(StorageError::NotFound(epoch))?;
            if !record.is_terminal() {
                return Err(StorageError::NotTerminal {
                    epoch,
                    status: record.status.to_string(),
                });
            }
            Ok(AuditExport::new(record))
        }
    }

    impl Default for EpochStore {
        fn default() -> Self {
            Self::in_memory()
        }
    }

    fn write_atomic(dir: &Path, record: &EpochRecord) -> StorageResult<()> {
        let name = format!("epoch-{:020}.json", record.epoch.0);
        let tmp = dir.join(format!("{}.tmp", name));
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, dir.join(name))?;
        Ok(())
    }
}

pub mod export {
    //! Audit export format

    use crate::record::EpochRecord;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    /// Current export format version
    pub const EXPORT_VERSION: u32 = 1;

    /// Self-contained, replayable description of a terminal epoch
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AuditExport {
        pub version: u32,
        pub exported_at: DateTime<Utc>,
        pub record: EpochRecord,
    }

    impl AuditExport {
        pub fn new(record: EpochRecord) -> Self {
            Self {
                version: EXPORT_VERSION,
                exported_at: Utc::now(),
                record,
            }
        }

        pub fn to_json(&self) -> serde_json::Result<String> {
            serde_json::to_string_pretty(self)
        }

        pub fn from_json(json: &str) -> serde_json::Result<Self> {
            serde_json::from_str(json)
        }
    }
}

// Re-export for convenience
pub use epoch_db::EpochStore;
pub use error::{StorageError, StorageResult};
pub use export::AuditExport;
pub use record::{EpochRecord, FailureInfo, PublishAttempt, RewardAccounting, WeightOrigin};

#[cfg(test)]
mod tests {
    use super::*;
    use oceans_core::{
        EpochId, EpochStatus, ParticipantKey, Position, PositionValue, ReferencePoint,
        SourceFlag, SourceKind, TargetId, Weight,
    };
    use oceans_economics::{GlobalWeightVector, RewardVector};

    fn record(epoch: u64) -> EpochRecord {
        EpochRecord::open(
            ReferencePoint::new(EpochId(epoch), epoch * 360),
            [TargetId(1)].into_iter().collect(),
            1_000,
        )
    }

    fn finalized(epoch: u64) -> EpochRecord {
        let mut r = record(epoch);
        r.weights = Some(GlobalWeightVector {
            epoch: EpochId(epoch),
            weights: [(TargetId(1), Weight::ONE)].into_iter().collect(),
        });
        r.weights_origin = Some(WeightOrigin::Fresh);
        r.positions.push(Position {
            participant: ParticipantKey::new("cold", "hot"),
            target: TargetId(1),
            reference_block: epoch * 360,
            value: PositionValue::Available {
                value: u128::MAX / 3,
            },
        });
        r.rewards = Some(RewardVector {
            epoch: EpochId(epoch),
            emission_budget: 1_000,
            rewards: [("hot".into(), 1_000)].into_iter().collect(),
        });
        r.status = EpochStatus::Finalized;
        r
    }

    #[test]
    fn test_terminal_records_are_frozen() {
        let store = EpochStore::in_memory();
        store.put(record(1)).unwrap();
        store.put(finalized(1)).unwrap();

        let err = store.put(record(1)).unwrap_err();
        assert!(matches!(err, StorageError::Immutable(EpochId(1))));
        assert_eq!(store.get(EpochId(1)).unwrap().status, EpochStatus::Finalized);
    }

    #[test]
    fn test_latest_weights_before() {
        let store = EpochStore::in_memory();
        store.put(finalized(1)).unwrap();
        store.put(record(2)).unwrap();

        let (from, weights) = store.latest_weights_before(EpochId(3)).unwrap();
        assert_eq!(from, EpochId(1));
        assert_eq!(weights.weight(&TargetId(1)), Weight::ONE);
        assert!(store.latest_weights_before(EpochId(1)).is_none());
    }

    #[test]
    fn test_export_requires_terminal() {
        let store = EpochStore::in_memory();
        store.put(record(4)).unwrap();
        assert!(matches!(
            store.export(EpochId(4)),
            Err(StorageError::NotTerminal { .. })
        ));
        assert!(matches!(
            store.export(EpochId(5)),
            Err(StorageError::NotFound(EpochId(5)))
        ));
    }

    #[test]
    fn test_export_json_roundtrip_keeps_flags() {
        let mut failed = record(6);
        failed.flag(SourceFlag::unavailable(SourceKind::VoteStore, "timeout"));
        failed.stale = true;
        failed.status = EpochStatus::Failed {
            reason: "no prior weights".into(),
        };
        failed.failure = Some(FailureInfo {
            code: 2001,
            reason: "no prior weights".into(),
        });
        let store = EpochStore::in_memory();
        store.put(failed).unwrap();

        let json = store.export(EpochId(6)).unwrap().to_json().unwrap();
        let back = AuditExport::from_json(&json).unwrap();
        assert!(back.record.stale && back.record.degraded);
        assert_eq!(back.record.flags[0].source, SourceKind::VoteStore);
        assert!(back.record.status.is_failed());
    }

    #[test]
    fn test_directory_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = EpochStore::open(dir.path()).unwrap();
            store.put(record(7)).unwrap();
            store.put(finalized(8)).unwrap();
        }

        let reopened = EpochStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.get(EpochId(8)).unwrap().status.is_finalized());
        assert_eq!(reopened.latest().unwrap().epoch, EpochId(8));
        assert!(matches!(
            reopened.put(record(8)),
            Err(StorageError::Immutable(_))
        ));
        assert_eq!(
            reopened.get(EpochId(8)).unwrap().positions[0].value,
            PositionValue::Available {
                value: u128::MAX / 3
            }
        );
    }
}
