//! JSON fixture sources for offline runs and replays
//!
//! ```text
//! registry.json   [{"custody": "5F...", "operating": "5G..."}]
//! positions.json  [{"custody": "5F...", "target": 10, "asset": "alpha10", "amount": 1000}]
//! quotes.json     [{"asset": "alpha10", "block": 1080, "price": 1000000000}]
//! ```
//!
//! Positions do not vary with the block. The oracle answers with the latest
//! quote at or before the requested block.

use async_trait::async_trait;
use oceans_core::sources::{ChainReader, ParticipantRegistry, PriceOracle};
use oceans_core::{
    AssetId, BlockHeight, CustodyKey, NativeAmount, OceansError, ParticipantKey, Quote,
    ReferencePoint, Result, TargetId,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One row of the positions fixture
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRow {
    pub custody: CustodyKey,
    pub target: TargetId,
    pub asset: AssetId,
    pub amount: u128,
}

/// Registry, chain and oracle backed by fixture files
#[derive(Debug, Default)]
pub struct FixtureSources {
    participants: Vec<ParticipantKey>,
    positions: BTreeMap<(CustodyKey, TargetId), Vec<NativeAmount>>,
    /// Quotes per asset, ordered by block
    quotes: BTreeMap<AssetId, BTreeMap<BlockHeight, Quote>>,
}

impl FixtureSources {
    /// Load whichever fixture files are given; absent ones are empty
    pub fn load(
        registry: Option<&Path>,
        positions: Option<&Path>,
        quotes: Option<&Path>,
    ) -> Result<Self> {
        let participants: Vec<ParticipantKey> = read_optional(registry)?;
        let rows: Vec<PositionRow> = read_optional(positions)?;
        let quotes: Vec<Quote> = read_optional(quotes)?;
        Ok(Self::from_parts(participants, rows, quotes))
    }

    pub fn from_parts(
        participants: Vec<ParticipantKey>,
        rows: Vec<PositionRow>,
        quotes: Vec<Quote>,
    ) -> Self {
        let mut positions: BTreeMap<(CustodyKey, TargetId), Vec<NativeAmount>> = BTreeMap::new();
        for row in rows {
            positions
                .entry((row.custody, row.target))
                .or_default()
                .push(NativeAmount {
                    asset: row.asset,
                    amount: row.amount,
                });
        }

        let mut by_asset: BTreeMap<AssetId, BTreeMap<BlockHeight, Quote>> = BTreeMap::new();
        for quote in quotes {
            by_asset
                .entry(quote.asset.clone())
                .or_default()
                .insert(quote.block, quote);
        }

        Self {
            participants,
            positions,
            quotes: by_asset,
        }
    }

    /// No participants registered
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

fn read_optional<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let bytes = std::fs::read(path)
        .map_err(|e| OceansError::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| OceansError::Serialization(format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl ParticipantRegistry for FixtureSources {
    async fn participants(&self, _at: ReferencePoint) -> Result<Vec<ParticipantKey>> {
        Ok(self.participants.clone())
    }
}

#[async_trait]
impl ChainReader for FixtureSources {
    async fn positions(
        &self,
        custody: &CustodyKey,
        target: TargetId,
        _block: BlockHeight,
    ) -> Result<Vec<NativeAmount>> {
        Ok(self
            .positions
            .get(&(custody.clone(), target))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PriceOracle for FixtureSources {
    async fn quote(&self, asset: &AssetId, block: BlockHeight) -> Result<Option<Quote>> {
        Ok(self
            .quotes
            .get(asset)
            .and_then(|series| series.range(..=block).next_back())
            .map(|(_, quote)| quote.clone()))
    }
}
