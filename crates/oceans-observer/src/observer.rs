//! # Position Observer
//!
//! | Condition | Position value |
//! |-----------|----------------|
//! | Quote at or before the reference block, within the window | `Available` |
//! | Latest quote older than the window | `Unavailable(StaleQuote)` |
//! | No quote, or only quotes after the reference block | `Unavailable(NoQuote)` |
//! | Chain or oracle read error | `Unavailable(ReadFailed)` |
//! | Read exceeded its timeout | `Unavailable(Timeout)` |
//! | Unit still pending at the collection deadline | `Unavailable(Timeout)` |
//!
//! A participant whose every chain read failed is excluded from the epoch.

use crate::pool::WorkerPool;
use oceans_core::fixed::mul_div;
use oceans_core::sources::{ChainReader, ParticipantRegistry, PriceOracle};
use oceans_core::{
    AssetId, BlockHeight, NativeAmount, OceansError, ParticipantKey, Position, PositionValue,
    Quote, ReferencePoint, Result, SourceFlag, SourceKind, TargetId, UnavailableReason,
    PRICE_SCALE,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Observer tuning
#[derive(Clone, Debug)]
pub struct ObserverConfig {
    /// Maximum concurrent chain reads
    pub max_concurrency: usize,
    /// Timeout of a single chain, oracle or registry read
    pub read_timeout: Duration,
    /// Oldest acceptable quote, in blocks before the reference block
    pub staleness_window_blocks: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            read_timeout: Duration::from_secs(10),
            staleness_window_blocks: 30,
        }
    }
}

/// A participant left out of the epoch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedParticipant {
    pub participant: ParticipantKey,
    pub reason: String,
}

/// One unit that could not be valued
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub participant: ParticipantKey,
    pub target: TargetId,
    /// Which read failed
    pub source: SourceKind,
    pub cause: UnavailableReason,
}

/// Everything observed for one reference point
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub reference: ReferencePoint,
    /// Positions of included participants, unavailable ones included
    pub positions: Vec<Position>,
    pub excluded: Vec<ExcludedParticipant>,
    pub failures: Vec<UnitFailure>,
    pub flags: Vec<SourceFlag>,
}

impl Observation {
    pub fn is_degraded(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Participants present in the position set
    pub fn participants(&self) -> BTreeSet<&ParticipantKey> {
        self.positions.iter().map(|p| &p.participant).collect()
    }
}

/// Which read failed and why
type UnitError = (SourceKind, UnavailableReason);
type QuoteLookup = std::result::Result<Quote, UnitError>;

/// Observes liquidity positions through the chain and oracle interfaces
pub struct PositionObserver {
    registry: Arc<dyn ParticipantRegistry>,
    chain: Arc<dyn ChainReader>,
    oracle: Arc<dyn PriceOracle>,
    config: ObserverConfig,
    pool: WorkerPool,
}

impl PositionObserver {
    pub fn new(
        registry: Arc<dyn ParticipantRegistry>,
        chain: Arc<dyn ChainReader>,
        oracle: Arc<dyn PriceOracle>,
        config: ObserverConfig,
    ) -> Self {
        let pool = WorkerPool::new(config.max_concurrency);
        Self {
            registry,
            chain,
            oracle,
            config,
            pool,
        }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Observe every participant's positions at `at`.
    ///
    /// Fails only when the registry cannot be read or a valuation overflows;
    /// per-unit problems end up in the observation.
    pub async fn observe(
        &self,
        at: ReferencePoint,
        eligible: &BTreeSet<TargetId>,
    ) -> Result<Observation> {
        self.observe_inner(at, eligible, None).await
    }

    /// Like [`observe`](Self::observe), but units without a value by
    /// `deadline` are recorded as timed out and the rest is kept.
    pub async fn observe_until(
        &self,
        at: ReferencePoint,
        eligible: &BTreeSet<TargetId>,
        deadline: Instant,
    ) -> Result<Observation> {
        self.observe_inner(at, eligible, Some(deadline)).await
    }

    async fn observe_inner(
        &self,
        at: ReferencePoint,
        eligible: &BTreeSet<TargetId>,
        deadline: Option<Instant>,
    ) -> Result<Observation> {
        let registry_read = self.timed(SourceKind::Registry, self.registry.participants(at));
        let listed = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, registry_read).await {
                Ok(listed) => listed,
                Err(_) => Err(OceansError::unavailable(
                    SourceKind::Registry,
                    "registry read missed the collection deadline",
                )),
            },
            None => registry_read.await,
        };
        let participants: BTreeSet<ParticipantKey> = listed?.into_iter().collect();

        info!(
            "Observing {} participants across {} targets at block {}",
            participants.len(),
            eligible.len(),
            at.block
        );

        let quotes: Mutex<HashMap<AssetId, QuoteLookup>> = Mutex::new(HashMap::new());
        let units: Vec<(&ParticipantKey, TargetId)> = participants
            .iter()
            .flat_map(|p| eligible.iter().map(move |t| (p, *t)))
            .collect();

        let jobs = units.iter().map(|(participant, target)| {
            self.observe_unit(participant, *target, at.block, &quotes)
        });
        let results = match deadline {
            Some(deadline) => self.pool.run_until(jobs, deadline).await,
            None => self.pool.run_all(jobs).await.into_iter().map(Some).collect(),
        };
        let pending = results.iter().filter(|r| r.is_none()).count();

        let mut by_participant: BTreeMap<&ParticipantKey, Vec<(Position, Option<UnitError>)>> =
            BTreeMap::new();
        for ((participant, target), result) in units.iter().zip(results) {
            let result =
                result.unwrap_or(Ok(Err((SourceKind::Chain, UnavailableReason::Timeout))));
            let (value, failure) = match result? {
                Ok(value) => (PositionValue::Available { value }, None),
                Err((source, cause)) => (
                    PositionValue::Unavailable {
                        cause: cause.clone(),
                    },
                    Some((source, cause)),
                ),
            };
            by_participant.entry(*participant).or_default().push((
                Position {
                    participant: (*participant).clone(),
                    target: *target,
                    reference_block: at.block,
                    value,
                },
                failure,
            ));
        }

        let mut observation = Observation {
            reference: at,
            positions: Vec::new(),
            excluded: Vec::new(),
            failures: Vec::new(),
            flags: Vec::new(),
        };

        for (participant, entries) in by_participant {
            let total_chain_failure = entries
                .iter()
                .all(|(_, f)| matches!(f, Some((SourceKind::Chain, _))));
            if total_chain_failure {
                debug!("Excluding {}: every chain read failed", participant.custody.short());
                observation.excluded.push(ExcludedParticipant {
                    participant: participant.clone(),
                    reason: "all chain reads failed".to_string(),
                });
            }
            for (position, failure) in entries {
                if let Some((source, cause)) = failure {
                    debug!(
                        "Unit {} / {} unavailable via {}: {:?}",
                        participant.custody.short(),
                        position.target,
                        source,
                        cause
                    );
                    observation.failures.push(UnitFailure {
                        participant: participant.clone(),
                        target: position.target,
                        source,
                        cause,
                    });
                }
                if !total_chain_failure {
                    observation.positions.push(position);
                }
            }
        }

        observation.flags = summarize(&observation.failures, &observation.excluded, units.len());
        if pending > 0 {
            warn!(
                "{} of {} units still pending at the collection deadline",
                pending,
                units.len()
            );
            observation.flags.push(SourceFlag::degraded(
                SourceKind::Chain,
                format!("{} units pending at the collection deadline", pending),
            ));
        }
        if !observation.failures.is_empty() {
            warn!(
                "{} of {} units unavailable at block {} ({} participants excluded)",
                observation.failures.len(),
                units.len(),
                at.block,
                observation.excluded.len()
            );
        }

        Ok(observation)
    }

    async fn observe_unit(
        &self,
        participant: &ParticipantKey,
        target: TargetId,
        block: BlockHeight,
        quotes: &Mutex<HashMap<AssetId, QuoteLookup>>,
    ) -> Result<std::result::Result<u128, UnitError>> {
        let amounts: Vec<NativeAmount> = match self
            .timed(
                SourceKind::Chain,
                self.chain.positions(&participant.custody, target, block),
            )
            .await
        {
            Ok(amounts) => amounts,
            Err(e) => return Ok(Err((SourceKind::Chain, unavailable_reason(&e)))),
        };

        let mut value: u128 = 0;
        for amount in amounts {
            if amount.amount == 0 {
                continue;
            }
            let quote = match self.quote(&amount.asset, block, quotes).await {
                Ok(quote) => quote,
                Err(failure) => return Ok(Err(failure)),
            };
            let converted = mul_div(amount.amount, quote.price, PRICE_SCALE)?;
            value = value.checked_add(converted).ok_or_else(|| {
                OceansError::ComputationInvariantViolation(format!(
                    "position value overflow for {} in {}",
                    participant.custody, target
                ))
            })?;
        }
        Ok(Ok(value))
    }

    async fn quote(
        &self,
        asset: &AssetId,
        block: BlockHeight,
        cache: &Mutex<HashMap<AssetId, QuoteLookup>>,
    ) -> QuoteLookup {
        let cached = cache.lock().get(asset).cloned();
        if let Some(lookup) = cached {
            return lookup;
        }

        let lookup = match self
            .timed(SourceKind::PriceOracle, self.oracle.quote(asset, block))
            .await
        {
            Ok(Some(quote)) => self.check_quote(asset, quote, block),
            Ok(None) => Err((
                SourceKind::PriceOracle,
                UnavailableReason::NoQuote {
                    asset: asset.clone(),
                },
            )),
            Err(e) => Err((SourceKind::PriceOracle, unavailable_reason(&e))),
        };

        // Read errors are retried by the next unit holding the asset
        let settled = match &lookup {
            Ok(_) => true,
            Err((_, cause)) => matches!(
                cause,
                UnavailableReason::NoQuote { .. } | UnavailableReason::StaleQuote { .. }
            ),
        };
        if settled {
            cache.lock().insert(asset.clone(), lookup.clone());
        }
        lookup
    }

    fn check_quote(&self, asset: &AssetId, quote: Quote, block: BlockHeight) -> QuoteLookup {
        if quote.block > block {
            // Quotes after the reference block are not visible
            return Err((
                SourceKind::PriceOracle,
                UnavailableReason::NoQuote {
                    asset: asset.clone(),
                },
            ));
        }
        if block - quote.block > self.config.staleness_window_blocks {
            return Err((
                SourceKind::PriceOracle,
                UnavailableReason::StaleQuote {
                    asset: asset.clone(),
                    quote_block: quote.block,
                },
            ));
        }
        Ok(quote)
    }

    async fn timed<T, F>(&self, kind: SourceKind, read: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.read_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(OceansError::Timeout {
                kind,
                after_ms: self.config.read_timeout.as_millis() as u64,
            }),
        }
    }
}

fn unavailable_reason(err: &OceansError) -> UnavailableReason {
    match err {
        OceansError::Timeout { .. } => UnavailableReason::Timeout,
        other => UnavailableReason::ReadFailed {
            detail: other.to_string(),
        },
    }
}

fn summarize(
    failures: &[UnitFailure],
    excluded: &[ExcludedParticipant],
    units: usize,
) -> Vec<SourceFlag> {
    let mut counts: BTreeMap<SourceKind, usize> = BTreeMap::new();
    for failure in failures {
        *counts.entry(failure.source).or_insert(0) += 1;
    }

    let mut flags: Vec<SourceFlag> = counts
        .into_iter()
        .map(|(source, count)| {
            SourceFlag::degraded(source, format!("{} of {} units unavailable", count, units))
        })
        .collect();
    if !excluded.is_empty() {
        flags.push(SourceFlag::degraded(
            SourceKind::Chain,
            format!("{} participants excluded", excluded.len()),
        ));
    }
    flags
}
