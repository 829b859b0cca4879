//! Oceans Node - wires storage, publisher, coordinator, driver and metrics

use crate::config::NodeConfig;
use crate::coordinator::{CoordinatorConfig, EpochCoordinator, Sources};
use crate::driver::{EpochClock, EpochDriver};
use crate::metrics::{MetricsServer, OceansMetrics};
use crate::publisher::{LocalPublisher, Publisher};
use oceans_core::sources::ChainHead;
use oceans_core::{BlockHeight, OceansError, Result};
use oceans_storage::{EpochRecord, EpochStore};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A running pipeline instance
pub struct OceansNode {
    config: NodeConfig,
    clock: EpochClock,
    head: Arc<dyn ChainHead>,
    store: Arc<EpochStore>,
    metrics: Arc<OceansMetrics>,
    coordinator: Arc<EpochCoordinator>,
}

impl OceansNode {
    /// Build a node publishing through the file-backed [`LocalPublisher`]
    pub fn new(config: NodeConfig, sources: Sources, head: Arc<dyn ChainHead>) -> Result<Self> {
        let mut publisher = if config.storage.persist {
            LocalPublisher::open(config.publish_dir())?
        } else {
            LocalPublisher::in_memory()
        };
        // A fixed head never advances, so confirmations could never accrue
        if config.sources.chain_head.is_none() {
            publisher = publisher.with_head(head.clone());
        }
        Self::with_publisher(config, sources, head, Arc::new(publisher))
    }

    /// Build a node around an embedder-supplied publisher
    pub fn with_publisher(
        config: NodeConfig,
        sources: Sources,
        head: Arc<dyn ChainHead>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        config.validate()?;
        let clock = EpochClock::new(config.epoch.length_blocks)?;

        let store = match config.storage_dir() {
            Some(dir) => {
                let store = EpochStore::open(&dir)?;
                info!("Epoch store at {} ({} records)", dir.display(), store.len());
                store
            }
            None => EpochStore::in_memory(),
        };
        let store = Arc::new(store);

        let metrics =
            Arc::new(OceansMetrics::new().map_err(|e| OceansError::Internal(e.to_string()))?);
        let coordinator = EpochCoordinator::new(
            CoordinatorConfig::from_node_config(&config),
            sources,
            publisher,
            store.clone(),
        )
        .with_metrics(metrics.clone());

        Ok(Self {
            config,
            clock,
            head,
            store,
            metrics,
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn clock(&self) -> EpochClock {
        self.clock
    }

    pub fn store(&self) -> &Arc<EpochStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<OceansMetrics> {
        &self.metrics
    }

    pub fn coordinator(&self) -> &Arc<EpochCoordinator> {
        &self.coordinator
    }

    /// Run the epoch containing `block` (or the current head) once
    pub async fn run_once(&self, block: Option<BlockHeight>) -> Result<EpochRecord> {
        let block = match block {
            Some(block) => block,
            None => self.head.head().await?,
        };
        let epoch = self.clock.epoch_of(block);
        self.coordinator.run_epoch(self.clock.reference_for(epoch)).await
    }

    /// Drive epochs until Ctrl+C or SIGTERM
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            "Starting node {} (targets: {:?}, budget: {})",
            self.config.node.name,
            self.config.eligible_targets(),
            self.config.emission_budget()
        );

        if self.config.metrics.enabled {
            let server = MetricsServer::new(&self.config.metrics, self.metrics.clone());
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    warn!("Metrics server stopped: {}", e);
                }
            });
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let mut driver = EpochDriver::new(
            self.clock,
            self.config.block_time(),
            self.head.clone(),
            self.coordinator.clone(),
        );
        let handle = tokio::spawn(async move {
            driver.run(shutdown_rx).await;
            driver.stats()
        });

        wait_for_shutdown().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(()).await;

        let stats = handle.await?;
        info!(
            "Node stopped after {} epochs ({} finalized, {} failed)",
            stats.epochs_run, stats.epochs_finalized, stats.epochs_failed
        );
        Ok(())
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
