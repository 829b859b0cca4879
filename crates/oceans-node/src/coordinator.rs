//! # Epoch Coordinator
//!
//! Runs one epoch through the status machine and persists the record at
//! every transition.
//!
//! ```text
//! Open ─► SnapshotCollecting ─┬─ votes + stakes ──► VoteAggregator ─┐
//!                             └─ PositionObserver ─────────────────┤  (joined under
//!                                                                  │   the collection
//!                                                                  ▼   deadline)
//!                                Computing ─► RewardEngine ─► Publisher ─► Published ─► Finalized
//! ```
//!
//! ## Failure Policy
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | Vote store or stake snapshot unavailable | Reuse prior weights, `stale` |
//! | No stake-weighted preference | Reuse prior weights, `stale` |
//! | Nothing to reuse | `Failed` |
//! | Per-unit position failures | Continue, `degraded` |
//! | Position reads pending at the deadline | Continue, `degraded` |
//! | Registry unavailable | `Failed` |
//! | Invariant violation | `Failed`, ALERT logged |
//! | Every reward zero | `Failed` (`EmptyRewardVector`) |
//! | Publish retries or confirmation exhausted | `Failed` |

use crate::config::NodeConfig;
use crate::metrics::OceansMetrics;
use crate::publisher::{
    await_confirmation, publish_with_retry, ConfirmationPolicy, Publisher, RetryPolicy,
};
use chrono::Utc;
use oceans_core::sources::{
    ChainReader, ParticipantRegistry, PriceOracle, StakeSnapshotProvider, VoteStore,
};
use oceans_core::{
    EpochStatus, HolderId, OceansError, ReferencePoint, Result, SourceFlag, SourceKind, TargetId,
};
use oceans_economics::{
    AggregationOutcome, GlobalWeightVector, RewardEngine, StakeSnapshot, VoteAggregator,
    VoteSnapshot,
};
use oceans_observer::{Observation, ObserverConfig, PositionObserver};
use oceans_storage::{EpochRecord, EpochStore, FailureInfo, RewardAccounting, WeightOrigin};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Coordinator tuning
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub eligible: BTreeSet<TargetId>,
    pub emission_budget: u128,
    /// Hard deadline for both collection branches
    pub collection_deadline: Duration,
    /// Timeout of a single vote store or stake read
    pub source_timeout: Duration,
    pub observer: ObserverConfig,
    pub retry: RetryPolicy,
    pub confirmation: ConfirmationPolicy,
}

impl CoordinatorConfig {
    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self {
            eligible: config.eligible_targets(),
            emission_budget: config.emission_budget(),
            collection_deadline: config.collection_deadline(),
            source_timeout: config.source_timeout(),
            observer: config.observer_config(),
            retry: config.retry_policy(),
            confirmation: config.confirmation_policy(),
        }
    }
}

/// External collaborators consumed by the coordinator
#[derive(Clone)]
pub struct Sources {
    pub votes: Arc<dyn VoteStore>,
    pub stakes: Arc<dyn StakeSnapshotProvider>,
    pub registry: Arc<dyn ParticipantRegistry>,
    pub chain: Arc<dyn ChainReader>,
    pub oracle: Arc<dyn PriceOracle>,
}

type VoteCollection = (Result<VoteSnapshot>, Result<StakeSnapshot>);

/// Drives epochs from `Open` to a terminal state
pub struct EpochCoordinator {
    config: CoordinatorConfig,
    votes: Arc<dyn VoteStore>,
    stakes: Arc<dyn StakeSnapshotProvider>,
    observer: PositionObserver,
    publisher: Arc<dyn Publisher>,
    store: Arc<EpochStore>,
    metrics: Option<Arc<OceansMetrics>>,
    aggregator: VoteAggregator,
    engine: RewardEngine,
    /// Held for the whole of an epoch run
    running: Mutex<()>,
}

impl EpochCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        sources: Sources,
        publisher: Arc<dyn Publisher>,
        store: Arc<EpochStore>,
    ) -> Self {
        let observer = PositionObserver::new(
            sources.registry,
            sources.chain,
            sources.oracle,
            config.observer.clone(),
        );
        Self {
            config,
            votes: sources.votes,
            stakes: sources.stakes,
            observer,
            publisher,
            store,
            metrics: None,
            aggregator: VoteAggregator::new(),
            engine: RewardEngine::new(),
            running: Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<OceansMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EpochStore> {
        &self.store
    }

    /// Run the epoch identified by `at` to a terminal state.
    ///
    /// A terminal epoch is returned as stored without running again. Errors
    /// are returned only when the record itself cannot be persisted.
    pub async fn run_epoch(&self, at: ReferencePoint) -> Result<EpochRecord> {
        let _guard = self.running.lock().await;

        if let Some(existing) = self.store.get(at.epoch) {
            if existing.is_terminal() {
                debug!("Epoch {} already {}", at.epoch, existing.status);
                return Ok(existing);
            }
            warn!("Restarting epoch {} left in {}", at.epoch, existing.status);
        }

        info!("Epoch {} opened at block {}", at.epoch, at.block);
        let mut record =
            EpochRecord::open(at, self.config.eligible.clone(), self.config.emission_budget);
        self.persist(&record)?;

        self.drive(&mut record).await?;
        self.record_metrics(&record);

        match &record.status {
            EpochStatus::Finalized => info!(
                "Epoch {} finalized (stale: {}, degraded: {}, digest: {})",
                record.epoch,
                record.stale,
                record.degraded,
                record.reward_digest.as_deref().unwrap_or("-")
            ),
            status => warn!("Epoch {} ended {}", record.epoch, status),
        }
        Ok(record)
    }

    async fn drive(&self, record: &mut EpochRecord) -> Result<()> {
        let at = record.reference;
        self.advance(record, EpochStatus::SnapshotCollecting)?;

        // Both branches start together and share one deadline
        let deadline = self.config.collection_deadline;
        let expires = tokio::time::Instant::now() + deadline;
        let (vote_branch, observer_branch) = tokio::join!(
            tokio::time::timeout_at(expires, self.collect_votes(at)),
            self.observer.observe_until(at, &self.config.eligible, expires),
        );

        let vote_branch = vote_branch.unwrap_or_else(|_| {
            let late = |kind: SourceKind| OceansError::Timeout {
                kind,
                after_ms: deadline.as_millis() as u64,
            };
            (
                Err(late(SourceKind::VoteStore)),
                Err(late(SourceKind::StakeSnapshot)),
            )
        });
        // Both branches are recorded before either can fail the epoch
        let weights = self.resolve_weights(record, vote_branch);
        let observed = match observer_branch {
            Ok(observation) => {
                self.absorb_observation(record, observation);
                Ok(())
            }
            Err(e) => {
                if let Some(kind) = e.source_kind() {
                    record.flag(SourceFlag::unavailable(kind, e.to_string()));
                }
                Err(e)
            }
        };
        let weights = match weights {
            Ok(weights) => weights,
            Err(e) => return self.fail(record, e),
        };
        if let Err(e) = observed {
            return self.fail(record, e);
        }

        self.advance(record, EpochStatus::Computing)?;

        if let Err(e) = weights.check(&self.config.eligible) {
            return self.fail(record, e);
        }
        let outcome = match self
            .engine
            .compute(&weights, &record.positions, self.config.emission_budget)
        {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(record, e),
        };

        let digest = match outcome.vector.digest() {
            Ok(digest) => digest,
            Err(e) => return self.fail(record, e),
        };
        record.accounting = Some(RewardAccounting {
            distributed: outcome.distributed,
            unrealized: outcome.unrealized,
            rounding_dust: outcome.rounding_dust,
        });
        record.reward_digest = Some(digest);
        let vector = outcome.vector;
        record.rewards = Some(vector.clone());
        debug!(
            "Epoch {} computed: distributed {}, unrealized {}, dust {}",
            record.epoch, outcome.distributed, outcome.unrealized, outcome.rounding_dust
        );

        if vector.is_empty_allocation() {
            return self.fail(record, OceansError::EmptyRewardVector(record.epoch));
        }
        self.persist(record)?;

        let report = publish_with_retry(self.publisher.as_ref(), &vector, &self.config.retry).await;
        if let Some(metrics) = &self.metrics {
            metrics.publish_attempts.inc_by(report.attempts.len() as u64);
        }
        record.publish_attempts.extend(report.attempts);
        let Some(ack) = report.ack else {
            record.flag(SourceFlag::unavailable(
                SourceKind::Publisher,
                "publish retry budget exhausted",
            ));
            let err = report.error.unwrap_or_else(|| {
                OceansError::PublishFailure("publish retry budget exhausted".to_string())
            });
            return self.fail(record, err);
        };
        self.advance(record, EpochStatus::Published)?;

        match await_confirmation(self.publisher.as_ref(), &ack, &self.config.confirmation).await {
            Ok(depth) => {
                debug!("Epoch {} confirmed at depth {}", record.epoch, depth);
                record.finalized_at = Some(Utc::now());
                self.advance(record, EpochStatus::Finalized)
            }
            Err(e) => self.fail(record, e),
        }
    }

    /// Read the vote store and stake snapshot concurrently
    async fn collect_votes(&self, at: ReferencePoint) -> VoteCollection {
        let timeout = self.config.source_timeout;
        let (ballots, stakes) = tokio::join!(
            within(SourceKind::VoteStore, timeout, self.votes.ballots(at)),
            within(SourceKind::StakeSnapshot, timeout, self.stakes.stakes(at)),
        );
        (
            ballots.map(|b| VoteSnapshot::from_ballots(at, b)),
            stakes.map(|s: BTreeMap<HolderId, u128>| StakeSnapshot::new(at, s)),
        )
    }

    /// Fresh weights when both vote sources answered, else the prior vector
    fn resolve_weights(
        &self,
        record: &mut EpochRecord,
        (votes, stakes): VoteCollection,
    ) -> Result<GlobalWeightVector> {
        let eligible = &self.config.eligible;

        let reuse_reason = match (votes, stakes) {
            (Ok(votes), Ok(stakes)) => {
                let outcome = self.aggregator.aggregate(&votes, &stakes, eligible)?;
                record.aggregation = Some(outcome.stats().clone());
                record.votes = Some(votes);
                record.stakes = Some(stakes);
                match outcome {
                    AggregationOutcome::Fresh { weights, stats } => {
                        info!(
                            "Epoch {}: {} holders counted, {} without stake",
                            record.epoch, stats.holders_counted, stats.holders_without_stake
                        );
                        record.weights = Some(weights.clone());
                        record.weights_origin = Some(WeightOrigin::Fresh);
                        return Ok(weights);
                    }
                    AggregationOutcome::NoEffectiveWeight { .. } => {
                        record.flag(SourceFlag::degraded(
                            SourceKind::VoteStore,
                            "no stake-weighted preference for any eligible target",
                        ));
                        "no effective vote weight".to_string()
                    }
                }
            }
            (votes, stakes) => {
                let mut reasons = Vec::new();
                if let Err(e) = &votes {
                    record.flag(SourceFlag::unavailable(SourceKind::VoteStore, e.to_string()));
                    reasons.push(e.to_string());
                }
                if let Err(e) = &stakes {
                    record.flag(SourceFlag::unavailable(
                        SourceKind::StakeSnapshot,
                        e.to_string(),
                    ));
                    reasons.push(e.to_string());
                }
                reasons.join("; ")
            }
        };

        let prior = self
            .store
            .latest_weights_before(record.epoch)
            .map(|(from, weights)| weights.restricted_to(record.epoch, eligible).map(|w| (from, w)))
            .transpose()?;
        match prior {
            Some((from, Some(weights))) => {
                warn!(
                    "Epoch {} reusing weights of epoch {} ({})",
                    record.epoch, from, reuse_reason
                );
                record.stale = true;
                record.weights = Some(weights.clone());
                record.weights_origin = Some(WeightOrigin::Reused { from });
                Ok(weights)
            }
            Some((from, None)) => Err(OceansError::degraded(
                SourceKind::VoteStore,
                format!(
                    "{}; weights of epoch {} cover no eligible target",
                    reuse_reason, from
                ),
            )),
            None => Err(OceansError::unavailable(
                SourceKind::VoteStore,
                format!("{}; no prior weight vector to reuse", reuse_reason),
            )),
        }
    }

    fn absorb_observation(&self, record: &mut EpochRecord, observation: Observation) {
        if let Some(metrics) = &self.metrics {
            metrics
                .observer_unit_failures
                .inc_by(observation.failures.len() as u64);
        }
        for flag in observation.flags {
            record.flag(flag);
        }
        record.positions = observation.positions;
        record.excluded = observation.excluded;
        record.unit_failures = observation.failures;
    }

    fn advance(&self, record: &mut EpochRecord, next: EpochStatus) -> Result<()> {
        record.status.transition(next)?;
        record.touch();
        self.persist(record)
    }

    fn fail(&self, record: &mut EpochRecord, err: OceansError) -> Result<()> {
        if let OceansError::ComputationInvariantViolation(detail) = &err {
            error!("ALERT epoch {} invariant violation: {}", record.epoch, detail);
        }
        let reason = err.to_string();
        record.failure = Some(FailureInfo {
            code: err.code(),
            reason: reason.clone(),
        });
        self.advance(record, EpochStatus::Failed { reason })
    }

    fn persist(&self, record: &EpochRecord) -> Result<()> {
        self.store.put(record.clone()).map_err(OceansError::from)
    }

    fn record_metrics(&self, record: &EpochRecord) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match record.status {
            EpochStatus::Finalized => metrics.epochs_finalized.inc(),
            EpochStatus::Failed { .. } => metrics.epochs_failed.inc(),
            _ => {}
        }
        metrics.current_epoch.set(record.epoch.0 as i64);
        metrics.epoch_stale.set(record.stale as i64);
        metrics.epoch_degraded.set(record.degraded as i64);
    }
}

/// Bound a source read, reporting an elapsed timeout against `kind`
pub async fn within<T, F>(kind: SourceKind, timeout: Duration, read: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => result,
        Err(_) => Err(OceansError::Timeout {
            kind,
            after_ms: timeout.as_millis() as u64,
        }),
    }
}
