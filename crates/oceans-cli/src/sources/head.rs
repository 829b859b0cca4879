//! Chain head sources

use async_trait::async_trait;
use chrono::Utc;
use oceans_core::sources::ChainHead;
use oceans_core::{BlockHeight, Result};

/// Head pinned to one block
#[derive(Clone, Copy, Debug)]
pub struct FixedHead(pub BlockHeight);

#[async_trait]
impl ChainHead for FixedHead {
    async fn head(&self) -> Result<BlockHeight> {
        Ok(self.0)
    }
}

/// Head derived from wall-clock time: one block every `block_time_secs`
/// since `genesis_unix`
#[derive(Clone, Copy, Debug)]
pub struct SimulatedHead {
    genesis_unix: i64,
    block_time_secs: u64,
}

impl SimulatedHead {
    pub fn new(genesis_unix: i64, block_time_secs: u64) -> Self {
        Self {
            genesis_unix,
            block_time_secs: block_time_secs.max(1),
        }
    }

    /// Block at unix time `now`
    pub fn block_at(&self, now: i64) -> BlockHeight {
        let elapsed = now.saturating_sub(self.genesis_unix).max(0) as u64;
        elapsed / self.block_time_secs
    }
}

#[async_trait]
impl ChainHead for SimulatedHead {
    async fn head(&self) -> Result<BlockHeight> {
        Ok(self.block_at(Utc::now().timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_head() {
        let head = SimulatedHead::new(1_000, 12);
        assert_eq!(head.block_at(500), 0);
        assert_eq!(head.block_at(1_000), 0);
        assert_eq!(head.block_at(1_011), 0);
        assert_eq!(head.block_at(1_012), 1);
        assert_eq!(head.block_at(1_000 + 12 * 360), 360);
    }

    #[tokio::test]
    async fn test_fixed_head() {
        assert_eq!(FixedHead(42).head().await.unwrap(), 42);
    }
}
