//! Source adapters used by the `oceans` binary
//!
//! - [`http`]: vote and stake API client, with an offline placeholder mode
//! - [`fixture`]: registry, chain positions and quotes from JSON files
//! - [`head`]: fixed or wall-clock simulated chain head

pub mod fixture;
pub mod head;
pub mod http;

use anyhow::Context;
use oceans_core::sources::{ChainHead, StakeSnapshotProvider, VoteStore};
use oceans_node::config::{NodeConfig, OFFLINE_ENDPOINT};
use oceans_node::Sources;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub use fixture::FixtureSources;
pub use head::{FixedHead, SimulatedHead};
pub use http::{HttpVoteSource, OfflineVotes};

/// Build every source and the chain head from `config`
pub fn build(config: &NodeConfig) -> anyhow::Result<(Sources, Arc<dyn ChainHead>)> {
    let settings = &config.sources;

    let fixtures = Arc::new(
        FixtureSources::load(
            settings.registry_file.as_deref().map(Path::new),
            settings.positions_file.as_deref().map(Path::new),
            settings.quotes_file.as_deref().map(Path::new),
        )
        .context("loading fixture sources")?,
    );
    if fixtures.is_empty() {
        warn!("No registry fixture configured; every epoch will observe zero participants");
    }

    let offline = settings
        .vote_api_endpoint
        .eq_ignore_ascii_case(OFFLINE_ENDPOINT);
    let (votes, stakes): (Arc<dyn VoteStore>, Arc<dyn StakeSnapshotProvider>) = if offline {
        warn!("Vote source in offline mode: placeholder votes until an endpoint is configured");
        let placeholder = Arc::new(OfflineVotes::new(config.eligible_targets()));
        (placeholder.clone() as Arc<dyn VoteStore>, placeholder as _)
    } else {
        info!("Vote source online: {}", settings.vote_api_endpoint);
        let http = Arc::new(HttpVoteSource::new(settings)?);
        (http.clone() as Arc<dyn VoteStore>, http as _)
    };

    let head: Arc<dyn ChainHead> = match settings.chain_head {
        Some(block) => Arc::new(FixedHead(block)),
        None => Arc::new(SimulatedHead::new(
            settings.genesis_unix,
            config.epoch.block_time_secs,
        )),
    };

    let sources = Sources {
        votes,
        stakes,
        registry: fixtures.clone(),
        chain: fixtures.clone(),
        oracle: fixtures,
    };
    Ok((sources, head))
}
