//! Vote API client
//!
//! `GET {endpoint}/votes/latest?block=N` returns the latest ballot of every
//! holder:
//!
//! ```json
//! [{"voter_hotkey": "5Hd...", "block_height": 6073385,
//!   "weights": {"10": 0.5, "27": 0.5}, "voter_stake": 12.5}]
//! ```
//!
//! Stakes come from `GET {stake_endpoint}/stakes?block=N` (`{holder: f64}`)
//! when a stake endpoint is configured, otherwise from `voter_stake`.
//! Float values are converted to base units at 10^9 per unit; negative or
//! non-finite values drop the holder.

use async_trait::async_trait;
use oceans_core::sources::{StakeSnapshotProvider, VoteStore};
use oceans_core::{
    Ballot, BlockHeight, HolderId, OceansError, ReferencePoint, Result, SourceKind, TargetId,
};
use oceans_economics::ONE_UNIT;
use oceans_node::config::SourceSettings;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before the second HTTP attempt
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Backoff multiplier between attempts
const BACKOFF_FACTOR: u32 = 2;

/// One entry of the `/votes/latest` payload
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct VotePayload {
    pub voter_hotkey: String,
    pub block_height: BlockHeight,
    pub weights: BTreeMap<u16, f64>,
    #[serde(default)]
    pub voter_stake: Option<f64>,
}

/// Convert a non-negative float amount to base units
pub fn to_base_units(value: f64) -> Option<u128> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let scaled = value * ONE_UNIT as f64;
    if scaled >= u128::MAX as f64 {
        return None;
    }
    Some(scaled.floor() as u128)
}

/// Ballots from a vote payload, skipping holders with invalid weights
pub fn ballots_from_payload(payload: &[VotePayload]) -> Vec<Ballot> {
    payload
        .iter()
        .filter_map(|vote| {
            let preferences = vote
                .weights
                .iter()
                .map(|(target, weight)| to_base_units(*weight).map(|v| (TargetId(*target), v)))
                .collect::<Option<Vec<_>>>();
            match preferences {
                Some(preferences) => Some(Ballot {
                    holder: HolderId::new(vote.voter_hotkey.clone()),
                    block: vote.block_height,
                    preferences,
                }),
                None => {
                    warn!("Skipping ballot of {}: invalid weight", vote.voter_hotkey);
                    None
                }
            }
        })
        .collect()
}

/// Stakes carried by a vote payload
pub fn stakes_from_payload(payload: &[VotePayload]) -> BTreeMap<HolderId, u128> {
    payload
        .iter()
        .filter_map(|vote| {
            let stake = vote.voter_stake.and_then(to_base_units)?;
            Some((HolderId::new(vote.voter_hotkey.clone()), stake))
        })
        .collect()
}

/// Vote and stake source over HTTP
pub struct HttpVoteSource {
    client: reqwest::Client,
    vote_endpoint: String,
    stake_endpoint: Option<String>,
    max_tries: u32,
    /// Last vote payload, reused for `voter_stake` at the same block
    last_payload: Mutex<Option<(BlockHeight, Vec<VotePayload>)>>,
}

impl HttpVoteSource {
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| OceansError::Config(e.to_string()))?;
        Ok(Self {
            client,
            vote_endpoint: settings.vote_api_endpoint.trim_end_matches('/').to_string(),
            stake_endpoint: settings
                .stake_api_endpoint
                .as_ref()
                .map(|s| s.trim_end_matches('/').to_string()),
            max_tries: settings.max_retries.max(1),
            last_payload: Mutex::new(None),
        })
    }

    async fn get_json<T>(&self, kind: SourceKind, url: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let result = async {
                let response = self.client.get(url).send().await?.error_for_status()?;
                response.json::<T>().await
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_tries => {
                    debug!("GET {} failed (attempt {}): {}", url, attempt, e);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(BACKOFF_FACTOR);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(OceansError::unavailable(
                        kind,
                        format!("GET {} failed after {} attempts: {}", url, attempt, e),
                    ))
                }
            }
        }
    }

    async fn votes_at(&self, block: BlockHeight) -> Result<Vec<VotePayload>> {
        let cached = self.last_payload.lock().clone();
        if let Some((at, payload)) = cached {
            if at == block {
                return Ok(payload);
            }
        }
        let url = format!("{}/votes/latest?block={}", self.vote_endpoint, block);
        let payload: Vec<VotePayload> = self.get_json(SourceKind::VoteStore, &url).await?;
        debug!("Fetched {} votes at block {}", payload.len(), block);
        *self.last_payload.lock() = Some((block, payload.clone()));
        Ok(payload)
    }
}

#[async_trait]
impl VoteStore for HttpVoteSource {
    async fn ballots(&self, at: ReferencePoint) -> Result<Vec<Ballot>> {
        let payload = self.votes_at(at.block).await?;
        Ok(ballots_from_payload(&payload))
    }
}

#[async_trait]
impl StakeSnapshotProvider for HttpVoteSource {
    async fn stakes(&self, at: ReferencePoint) -> Result<BTreeMap<HolderId, u128>> {
        let Some(endpoint) = &self.stake_endpoint else {
            let payload = self.votes_at(at.block).await?;
            return Ok(stakes_from_payload(&payload));
        };
        let url = format!("{}/stakes?block={}", endpoint, at.block);
        let raw: BTreeMap<String, f64> = self.get_json(SourceKind::StakeSnapshot, &url).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(holder, stake)| Some((HolderId::new(holder), to_base_units(stake)?)))
            .collect())
    }
}

/// Fixed holders used while no vote endpoint is configured
const PLACEHOLDER_HOLDERS: [&str; 4] = [
    "5HdK1zyMbMoq1NM2sDL2Len9h2CsmBcVbrFthePccMN5R8jU",
    "5CdG8JDyzBPvXD1PM3ctdVmk3DbC52aTmYbQNezasVUXsn66",
    "5CsvRJXuR955WojnGMdok1hbhffZyB4N5ocrv82f3p5A2zVp",
    "5ExiuLNctkEUL5xMijujmAdhJGdzb5d6vxdzLdjpH3MLNovF",
];

/// Deterministic placeholder votes: equal weight on every eligible target,
/// one unit of stake per holder
pub struct OfflineVotes {
    eligible: BTreeSet<TargetId>,
}

impl OfflineVotes {
    pub fn new(eligible: BTreeSet<TargetId>) -> Self {
        Self { eligible }
    }
}

#[async_trait]
impl VoteStore for OfflineVotes {
    async fn ballots(&self, at: ReferencePoint) -> Result<Vec<Ballot>> {
        Ok(PLACEHOLDER_HOLDERS
            .iter()
            .map(|holder| Ballot {
                holder: HolderId::new(*holder),
                block: at.block,
                preferences: self.eligible.iter().map(|t| (*t, 1)).collect(),
            })
            .collect())
    }
}

#[async_trait]
impl StakeSnapshotProvider for OfflineVotes {
    async fn stakes(&self, _at: ReferencePoint) -> Result<BTreeMap<HolderId, u128>> {
        Ok(PLACEHOLDER_HOLDERS
            .iter()
            .map(|holder| (HolderId::new(*holder), ONE_UNIT))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oceans_core::EpochId;

    #[test]
    fn test_float_ingestion() {
        assert_eq!(to_base_units(1.0), Some(ONE_UNIT));
        assert_eq!(to_base_units(0.25), Some(ONE_UNIT / 4));
        assert_eq!(to_base_units(0.0), Some(0));
        assert_eq!(to_base_units(-0.5), None);
        assert_eq!(to_base_units(f64::NAN), None);
        assert_eq!(to_base_units(f64::INFINITY), None);
    }

    #[test]
    fn test_payload_parsing() {
        let json = r#"[
            {"voter_hotkey": "holder-a", "block_height": 100,
             "weights": {"10": 0.5, "27": 0.5}, "voter_stake": 2.0},
            {"voter_hotkey": "holder-b", "block_height": 101,
             "weights": {"10": -1.0}},
            {"voter_hotkey": "holder-c", "block_height": 102,
             "weights": {"27": 1.0}}
        ]"#;
        let payload: Vec<VotePayload> = serde_json::from_str(json).unwrap();

        let ballots = ballots_from_payload(&payload);
        assert_eq!(ballots.len(), 2);
        assert_eq!(ballots[0].holder, HolderId::new("holder-a"));
        assert_eq!(
            ballots[0].preferences,
            vec![(TargetId(10), ONE_UNIT / 2), (TargetId(27), ONE_UNIT / 2)]
        );

        let stakes = stakes_from_payload(&payload);
        assert_eq!(stakes.len(), 1);
        assert_eq!(stakes[&HolderId::new("holder-a")], 2 * ONE_UNIT);
    }

    #[tokio::test]
    async fn test_offline_votes_cover_eligible_targets() {
        let eligible = BTreeSet::from([TargetId(10), TargetId(27)]);
        let offline = OfflineVotes::new(eligible);
        let at = ReferencePoint::new(EpochId(5), 1_800);

        let ballots = offline.ballots(at).await.unwrap();
        assert_eq!(ballots.len(), PLACEHOLDER_HOLDERS.len());
        assert!(ballots.iter().all(|b| b.block == 1_800 && b.preferences.len() == 2));

        let stakes = offline.stakes(at).await.unwrap();
        assert!(stakes.values().all(|s| *s == ONE_UNIT));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let settings = SourceSettings {
            vote_api_endpoint: "http://127.0.0.1:1".to_string(),
            max_retries: 1,
            ..SourceSettings::default()
        };
        let source = HttpVoteSource::new(&settings).unwrap();
        let err = source
            .ballots(ReferencePoint::new(EpochId(1), 360))
            .await
            .unwrap_err();
        assert_eq!(err.source_kind(), Some(SourceKind::VoteStore));
        assert!(err.is_recoverable());
    }
}
