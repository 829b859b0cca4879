//! # External Sources
//!
//! Point-in-time query capabilities for the collaborators the pipeline
//! consumes. Every query takes the epoch's [`ReferencePoint`] (or its block)
//! explicitly; no implementation may substitute "now".

use crate::error::Result;
use crate::types::{
    AssetId, Ballot, BlockHeight, CustodyKey, HolderId, NativeAmount, ParticipantKey, Quote,
    ReferencePoint, TargetId,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Holder preference ballots
#[async_trait]
pub trait VoteStore: Send + Sync {
    /// Ballots cast at or before `at.block`
    async fn ballots(&self, at: ReferencePoint) -> Result<Vec<Ballot>>;
}

/// Stake balances used to weight ballots
#[async_trait]
pub trait StakeSnapshotProvider: Send + Sync {
    /// Stake of every voting holder at `at.block`
    async fn stakes(&self, at: ReferencePoint) -> Result<BTreeMap<HolderId, u128>>;
}

/// Registered participants and their key bindings
#[async_trait]
pub trait ParticipantRegistry: Send + Sync {
    /// Participants with the operating key bound to each custody key at `at.block`
    async fn participants(&self, at: ReferencePoint) -> Result<Vec<ParticipantKey>>;
}

/// On-chain liquidity reads
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Native-asset amounts held by `custody` in `target`'s pool at `block`
    async fn positions(
        &self,
        custody: &CustodyKey,
        target: TargetId,
        block: BlockHeight,
    ) -> Result<Vec<NativeAmount>>;
}

/// Current chain head, used by the periodic driver
#[async_trait]
pub trait ChainHead: Send + Sync {
    async fn head(&self) -> Result<BlockHeight>;
}

/// Asset prices in the common unit
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Latest quote observed at or before `block`, or `None`
    async fn quote(&self, asset: &AssetId, block: BlockHeight) -> Result<Option<Quote>>;
}
