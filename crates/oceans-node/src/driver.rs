//! Periodic Epoch Driver
//!
//! Watches the chain head and runs the pipeline once at the first block of
//! every epoch. A bootstrap run for the epoch in progress happens as soon as
//! the driver starts.

use crate::coordinator::EpochCoordinator;
use async_trait::async_trait;
use oceans_core::sources::ChainHead;
use oceans_core::{BlockHeight, EpochId, EpochStatus, OceansError, ReferencePoint, Result};
use oceans_storage::EpochRecord;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Longest sleep between head polls, in blocks
const MAX_POLL_BLOCKS: u64 = 30;

/// Epoch `n` covers blocks `[n * length, (n + 1) * length)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochClock {
    length: u64,
}

/// Block range of one epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochWindow {
    pub epoch: EpochId,
    pub start: BlockHeight,
    /// Last block of the epoch (inclusive)
    pub end: BlockHeight,
}

impl EpochClock {
    pub fn new(length: u64) -> Result<Self> {
        if length == 0 {
            return Err(OceansError::Config("epoch length must be positive".into()));
        }
        Ok(Self { length })
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn epoch_of(&self, block: BlockHeight) -> EpochId {
        EpochId(block / self.length)
    }

    pub fn start_of(&self, epoch: EpochId) -> BlockHeight {
        epoch.0.saturating_mul(self.length)
    }

    /// Window containing `block`
    pub fn window(&self, block: BlockHeight) -> EpochWindow {
        let start = block - block % self.length;
        EpochWindow {
            epoch: self.epoch_of(block),
            start,
            end: start + (self.length - 1),
        }
    }

    /// Reference point of `epoch`: its first block
    pub fn reference_for(&self, epoch: EpochId) -> ReferencePoint {
        ReferencePoint::new(epoch, self.start_of(epoch))
    }

    /// Blocks from `block` to the first block of the next epoch (at least 1)
    pub fn blocks_until_next(&self, block: BlockHeight) -> u64 {
        self.length - block % self.length
    }

    /// Head poll delay in blocks: half the remaining distance within `[1, 30]`
    pub fn poll_blocks(&self, block: BlockHeight) -> u64 {
        (self.blocks_until_next(block) / 2).clamp(1, MAX_POLL_BLOCKS)
    }
}

/// Anything that can take an epoch to a terminal state
#[async_trait]
pub trait EpochRunner: Send + Sync {
    async fn run_epoch(&self, at: ReferencePoint) -> Result<EpochRecord>;
}

#[async_trait]
impl EpochRunner for EpochCoordinator {
    async fn run_epoch(&self, at: ReferencePoint) -> Result<EpochRecord> {
        EpochCoordinator::run_epoch(self, at).await
    }
}

/// Statistics for the driver loop
#[derive(Clone, Debug, Default)]
pub struct DriverStats {
    pub epochs_run: u64,
    pub epochs_finalized: u64,
    pub epochs_failed: u64,
    pub last_epoch: Option<EpochId>,
    pub last_head: Option<BlockHeight>,
    pub head_errors: u64,
}

/// Events emitted by the driver
#[derive(Clone, Debug)]
pub enum DriverEvent {
    /// Epoch reached Finalized
    EpochCompleted {
        epoch: EpochId,
        stale: bool,
        degraded: bool,
        digest: Option<String>,
    },
    /// Epoch reached Failed
    EpochFailed { epoch: EpochId, reason: String },
    /// Head read or persistence error
    Error { error: String },
}

/// The periodic driver
pub struct EpochDriver {
    clock: EpochClock,
    block_time: Duration,
    head: Arc<dyn ChainHead>,
    runner: Arc<dyn EpochRunner>,
    stats: Arc<RwLock<DriverStats>>,
    event_tx: broadcast::Sender<DriverEvent>,
    last_run: Option<EpochId>,
}

impl EpochDriver {
    pub fn new(
        clock: EpochClock,
        block_time: Duration,
        head: Arc<dyn ChainHead>,
        runner: Arc<dyn EpochRunner>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            clock,
            block_time,
            head,
            runner,
            stats: Arc::new(RwLock::new(DriverStats::default())),
            event_tx,
            last_run: None,
        }
    }

    /// Get event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.event_tx.subscribe()
    }

    /// Get current stats
    pub fn stats(&self) -> DriverStats {
        self.stats.read().clone()
    }

    pub fn clock(&self) -> EpochClock {
        self.clock
    }

    /// Run until a shutdown signal arrives
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            "Starting epoch driver (length: {} blocks, block time: {:?})",
            self.clock.length(),
            self.block_time
        );

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Epoch driver shutting down");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    delay = self.tick().await;
                }
            }
        }
    }

    /// Poll the head once, run the epoch if it has not run yet, and return
    /// the delay until the next poll
    pub async fn tick(&mut self) -> Duration {
        let head = match self.head.head().await {
            Ok(head) => head,
            Err(e) => {
                warn!("Chain head unavailable: {}", e);
                self.stats.write().head_errors += 1;
                let _ = self.event_tx.send(DriverEvent::Error {
                    error: e.to_string(),
                });
                return self.block_time;
            }
        };
        self.stats.write().last_head = Some(head);

        let window = self.clock.window(head);
        if self.last_run.map_or(true, |last| window.epoch > last) {
            if self.last_run.is_none() {
                info!("[bootstrap] running epoch {} immediately", window.epoch);
            } else {
                info!("[epoch {}] head at block {}", window.epoch, head);
            }
            self.run_once(window.epoch).await;
        } else {
            debug!(
                "Block {} | epoch {} [{}/{}] | next epoch in {} blocks",
                head,
                window.epoch,
                head - window.start,
                self.clock.length(),
                self.clock.blocks_until_next(head)
            );
        }

        let blocks = u32::try_from(self.clock.poll_blocks(head)).unwrap_or(u32::MAX);
        self.block_time.saturating_mul(blocks)
    }

    async fn run_once(&mut self, epoch: EpochId) {
        let at = self.clock.reference_for(epoch);
        match self.runner.run_epoch(at).await {
            Ok(record) => {
                self.last_run = Some(epoch);
                let event = {
                    let mut stats = self.stats.write();
                    stats.epochs_run += 1;
                    stats.last_epoch = Some(epoch);
                    match &record.status {
                        EpochStatus::Failed { reason } => {
                            stats.epochs_failed += 1;
                            DriverEvent::EpochFailed {
                                epoch,
                                reason: reason.clone(),
                            }
                        }
                        _ => {
                            stats.epochs_finalized += 1;
                            DriverEvent::EpochCompleted {
                                epoch,
                                stale: record.stale,
                                degraded: record.degraded,
                                digest: record.reward_digest.clone(),
                            }
                        }
                    }
                };
                let _ = self.event_tx.send(event);
            }
            Err(e) => {
                // Record could not be persisted; retried on the next tick
                warn!("Epoch {} could not be run: {}", epoch, e);
                let _ = self.event_tx.send(DriverEvent::Error {
                    error: e.to_string(),
                });
            }
        }
    }
}
