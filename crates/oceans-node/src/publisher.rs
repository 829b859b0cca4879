//! # Publication
//!
//! The [`Publisher`] trait is the seam to whatever makes a reward vector
//! public (an on-chain weight-setting call in production). Submissions are
//! idempotent per epoch: resubmitting the same vector is acknowledged as a
//! duplicate, a different vector for a published epoch is rejected.
//!
//! ```text
//! submit ──► ack ──► poll confirmations ──► depth >= required ──► durable
//!   ▲  │
//!   └──┘ retry with exponential backoff while the error is recoverable
//! ```

use async_trait::async_trait;
use chrono::Utc;
use oceans_core::sources::ChainHead;
use oceans_core::{BlockHeight, EpochId, OceansError, OperatingKey, Result};
use oceans_economics::RewardVector;
use oceans_storage::PublishAttempt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Publisher acknowledgement of a submission
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub epoch: EpochId,
    /// Digest of the acknowledged vector
    pub digest: String,
    /// The same vector had already been accepted
    pub duplicate: bool,
    /// Block the submission was included at, when known
    pub included_at: Option<BlockHeight>,
}

/// Destination of finished reward vectors
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Submit `vector`; must be idempotent for an identical vector
    async fn submit(&self, vector: &RewardVector) -> Result<PublishAck>;

    /// Confirmations accumulated by an acknowledged submission, `None` if
    /// it is not visible yet
    async fn confirmations(&self, ack: &PublishAck) -> Result<Option<u64>>;
}

/// Submission retry budget
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    /// Upper bound on the whole submission phase
    pub deadline: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            backoff_factor: 2,
            deadline: Duration::from_secs(300),
        }
    }
}

/// Durability requirement
#[derive(Clone, Debug)]
pub struct ConfirmationPolicy {
    /// Required confirmations
    pub depth: u64,
    pub poll_interval: Duration,
    pub max_polls: u32,
    /// Timeout of a single confirmation read
    pub poll_timeout: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            depth: 3,
            poll_interval: Duration::from_secs(12),
            max_polls: 10,
            poll_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of the submission phase
#[derive(Debug)]
pub struct PublishReport {
    pub ack: Option<PublishAck>,
    pub attempts: Vec<PublishAttempt>,
    pub error: Option<OceansError>,
}

/// Submit with bounded retry.
///
/// Non-recoverable errors stop immediately; the deadline cuts the whole
/// phase short, including any pending backoff.
pub async fn publish_with_retry(
    publisher: &dyn Publisher,
    vector: &RewardVector,
    policy: &RetryPolicy,
) -> PublishReport {
    let started = Instant::now();
    let mut attempts = Vec::new();
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        let remaining = policy.deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }

        let result = match tokio::time::timeout(remaining, publisher.submit(vector)).await {
            Ok(result) => result,
            Err(_) => Err(OceansError::PublishFailure(format!(
                "submission timed out after {:?}",
                policy.deadline
            ))),
        };

        match result {
            Ok(ack) => {
                attempts.push(PublishAttempt {
                    attempt,
                    at: Utc::now(),
                    accepted: true,
                    detail: if ack.duplicate {
                        "duplicate".to_string()
                    } else {
                        "accepted".to_string()
                    },
                });
                info!(
                    "Epoch {} published on attempt {}: {}",
                    vector.epoch,
                    attempt,
                    &ack.digest[..ack.digest.len().min(16)]
                );
                return PublishReport {
                    ack: Some(ack),
                    attempts,
                    error: None,
                };
            }
            Err(e) => {
                attempts.push(PublishAttempt {
                    attempt,
                    at: Utc::now(),
                    accepted: false,
                    detail: e.to_string(),
                });
                let recoverable = e.is_recoverable();
                warn!(
                    "Publish attempt {}/{} for epoch {} failed: {}",
                    attempt, policy.max_attempts, vector.epoch, e
                );
                last_error = Some(e);
                if !recoverable {
                    break;
                }
            }
        }

        if attempt < policy.max_attempts {
            let delay = policy.backoff(attempt);
            let remaining = policy.deadline.saturating_sub(started.elapsed());
            if delay >= remaining {
                debug!("Backoff {:?} exceeds remaining publish deadline", delay);
                break;
            }
            tokio::time::sleep(delay).await;
        }
    }

    PublishReport {
        ack: None,
        attempts,
        error: Some(last_error.unwrap_or_else(|| {
            OceansError::PublishFailure("publish deadline exhausted".to_string())
        })),
    }
}

/// Poll until the submission reaches the required depth
pub async fn await_confirmation(
    publisher: &dyn Publisher,
    ack: &PublishAck,
    policy: &ConfirmationPolicy,
) -> Result<u64> {
    for poll in 1..=policy.max_polls {
        let polled = match tokio::time::timeout(policy.poll_timeout, publisher.confirmations(ack))
            .await
        {
            Ok(polled) => polled,
            Err(_) => Err(OceansError::PublishFailure(format!(
                "confirmation poll timed out after {:?}",
                policy.poll_timeout
            ))),
        };
        match polled {
            Ok(Some(depth)) if depth >= policy.depth => {
                debug!("Epoch {} durable at depth {}", ack.epoch, depth);
                return Ok(depth);
            }
            Ok(depth) => {
                debug!(
                    "Epoch {} confirmation poll {}/{}: depth {:?}",
                    ack.epoch, poll, policy.max_polls, depth
                );
            }
            Err(e) if e.is_recoverable() => {
                warn!("Confirmation poll for epoch {} failed: {}", ack.epoch, e);
            }
            Err(e) => return Err(e),
        }
        if poll < policy.max_polls {
            tokio::time::sleep(policy.poll_interval).await;
        }
    }
    Err(OceansError::PublishFailure(format!(
        "epoch {} not confirmed at depth {} after {} polls",
        ack.epoch, policy.depth, policy.max_polls
    )))
}

/// What the local publisher keeps per epoch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedVector {
    pub epoch: EpochId,
    pub digest: String,
    /// `u16` weights in operating-key order
    pub weights: Vec<(OperatingKey, u16)>,
    pub vector: RewardVector,
    pub included_at: Option<BlockHeight>,
}

/// File-backed publisher.
///
/// Writes `published-<epoch>.json` per epoch. Without a chain head a
/// written file is final; with one, confirmations are counted in blocks
/// since submission.
pub struct LocalPublisher {
    dir: Option<PathBuf>,
    head: Option<Arc<dyn ChainHead>>,
    published: RwLock<BTreeMap<EpochId, PublishedVector>>,
}

impl LocalPublisher {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            head: None,
            published: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open a publish directory, reloading earlier publications
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| OceansError::Storage(e.to_string()))?;

        let mut published = BTreeMap::new();
        let entries = fs::read_dir(&dir).map_err(|e| OceansError::Storage(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| OceansError::Storage(e.to_string()))?.path();
            let is_publication = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("published-") && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_publication {
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| OceansError::Storage(e.to_string()))?;
            let record: PublishedVector = serde_json::from_slice(&bytes)
                .map_err(|e| OceansError::Serialization(e.to_string()))?;
            published.insert(record.epoch, record);
        }

        Ok(Self {
            dir: Some(dir),
            head: None,
            published: RwLock::new(published),
        })
    }

    /// Count confirmations against a chain head
    pub fn with_head(mut self, head: Arc<dyn ChainHead>) -> Self {
        self.head = Some(head);
        self
    }

    pub fn get(&self, epoch: EpochId) -> Option<PublishedVector> {
        self.published.read().get(&epoch).cloned()
    }

    fn write(&self, record: &PublishedVector) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let name = format!("published-{:020}.json", record.epoch.0);
        let tmp = dir.join(format!("{}.tmp", name));
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| OceansError::Serialization(e.to_string()))?;
        fs::write(&tmp, bytes).map_err(|e| OceansError::PublishFailure(e.to_string()))?;
        fs::rename(&tmp, dir.join(name)).map_err(|e| OceansError::PublishFailure(e.to_string()))
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn submit(&self, vector: &RewardVector) -> Result<PublishAck> {
        let digest = vector.digest()?;

        if let Some(existing) = self.get(vector.epoch) {
            if existing.digest == digest {
                return Ok(PublishAck {
                    epoch: vector.epoch,
                    digest,
                    duplicate: true,
                    included_at: existing.included_at,
                });
            }
            return Err(OceansError::InvalidInput(format!(
                "epoch {} already published with digest {}",
                vector.epoch, existing.digest
            )));
        }

        let included_at = match &self.head {
            Some(head) => Some(head.head().await?),
            None => None,
        };
        let record = PublishedVector {
            epoch: vector.epoch,
            digest: digest.clone(),
            weights: vector.publish_weights()?,
            vector: vector.clone(),
            included_at,
        };
        self.write(&record)?;
        self.published.write().insert(vector.epoch, record);

        Ok(PublishAck {
            epoch: vector.epoch,
            digest,
            duplicate: false,
            included_at,
        })
    }

    async fn confirmations(&self, ack: &PublishAck) -> Result<Option<u64>> {
        let Some(record) = self.get(ack.epoch) else {
            return Ok(None);
        };
        if record.digest != ack.digest {
            return Ok(None);
        }
        match (&self.head, record.included_at) {
            (Some(head), Some(block)) => Ok(Some(head.head().await?.saturating_sub(block))),
            _ => Ok(Some(u64::MAX)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    fn vector(epoch: u64, reward: u128) -> RewardVector {
        RewardVector {
            epoch: EpochId(epoch),
            emission_budget: 1_000,
            rewards: [(OperatingKey::new("hot-a"), reward)].into_iter().collect(),
        }
    }

    struct Flaky {
        failures: AtomicU32,
        fatal: bool,
        inner: LocalPublisher,
    }

    #[async_trait]
    impl Publisher for Flaky {
        async fn submit(&self, vector: &RewardVector) -> Result<PublishAck> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                if self.fatal {
                    return Err(OceansError::InvalidInput("rejected".into()));
                }
                return Err(OceansError::PublishFailure("busy".into()));
            }
            self.inner.submit(vector).await
        }

        async fn confirmations(&self, ack: &PublishAck) -> Result<Option<u64>> {
            self.inner.confirmations(ack).await
        }
    }

    struct Head(AtomicU64);

    #[async_trait]
    impl ChainHead for Head {
        async fn head(&self) -> Result<BlockHeight> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[test]
    fn test_backoff_grows() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_noop() {
        let publisher = LocalPublisher::in_memory();
        let first = publisher.submit(&vector(1, 10)).await.unwrap();
        let second = publisher.submit(&vector(1, 10)).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.digest, second.digest);
    }

    #[tokio::test]
    async fn test_conflicting_submission_rejected() {
        let publisher = LocalPublisher::in_memory();
        publisher.submit(&vector(1, 10)).await.unwrap();
        let err = publisher.submit(&vector(1, 11)).await.unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(publisher.get(EpochId(1)).unwrap().vector.reward_of(&"hot-a".into()), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_accepted() {
        let publisher = Flaky {
            failures: AtomicU32::new(2),
            fatal: false,
            inner: LocalPublisher::in_memory(),
        };
        let report = publish_with_retry(&publisher, &vector(2, 5), &RetryPolicy::default()).await;
        assert!(report.ack.is_some());
        assert_eq!(report.attempts.len(), 3);
        assert!(!report.attempts[0].accepted);
        assert!(report.attempts[2].accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let publisher = Flaky {
            failures: AtomicU32::new(100),
            fatal: false,
            inner: LocalPublisher::in_memory(),
        };
        let report = publish_with_retry(&publisher, &vector(2, 5), &RetryPolicy::default()).await;
        assert!(report.ack.is_none());
        assert_eq!(report.attempts.len(), 5);
        assert!(matches!(report.error, Some(OceansError::PublishFailure(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let publisher = Flaky {
            failures: AtomicU32::new(1),
            fatal: true,
            inner: LocalPublisher::in_memory(),
        };
        let report = publish_with_retry(&publisher, &vector(2, 5), &RetryPolicy::default()).await;
        assert_eq!(report.attempts.len(), 1);
        assert!(report.ack.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_counts_blocks() {
        let publisher = LocalPublisher::in_memory().with_head(Arc::new(Head(AtomicU64::new(100))));
        let ack = publisher.submit(&vector(3, 1)).await.unwrap();
        assert_eq!(ack.included_at, Some(100));

        let depth = await_confirmation(&publisher, &ack, &ConfirmationPolicy::default())
            .await
            .unwrap();
        assert!(depth >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_publication_fails() {
        let publisher = LocalPublisher::in_memory();
        let ack = PublishAck {
            epoch: EpochId(9),
            digest: "00".into(),
            duplicate: false,
            included_at: None,
        };
        let err = await_confirmation(&publisher, &ack, &ConfirmationPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OceansError::PublishFailure(_)));
    }

    /// Accepts submissions but never answers a confirmation read
    struct SilentConfirmations(LocalPublisher);

    #[async_trait]
    impl Publisher for SilentConfirmations {
        async fn submit(&self, vector: &RewardVector) -> Result<PublishAck> {
            self.0.submit(vector).await
        }

        async fn confirmations(&self, _ack: &PublishAck) -> Result<Option<u64>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_confirmation_read_times_out() {
        let publisher = SilentConfirmations(LocalPublisher::in_memory());
        let ack = publisher.submit(&vector(5, 1)).await.unwrap();
        let policy = ConfirmationPolicy {
            max_polls: 3,
            ..ConfirmationPolicy::default()
        };

        let started = Instant::now();
        let err = await_confirmation(&publisher, &ack, &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, OceansError::PublishFailure(_)));
        // Three timed-out reads with two intervals between them
        let bound = policy.poll_timeout * 3 + policy.poll_interval * 2;
        assert!(started.elapsed() >= bound);
        assert!(started.elapsed() < bound + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_publications_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let publisher = LocalPublisher::open(dir.path()).unwrap();
            publisher.submit(&vector(4, 7)).await.unwrap();
        }
        let reopened = LocalPublisher::open(dir.path()).unwrap();
        assert!(reopened.submit(&vector(4, 7)).await.unwrap().duplicate);
        assert_eq!(reopened.get(EpochId(4)).unwrap().weights[0].1, u16::MAX);
    }
}
