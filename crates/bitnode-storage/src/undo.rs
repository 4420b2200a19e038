//! Block undo data for chain reorganizations.
//!
//! Committing a block records the coin entries it removed together with everything it
//! added, so the block can be rolled back without replaying the chain.

use bitnode_primitives::{Hash256, OutPoint};
use serde::{Deserialize, Serialize};

/// Coin entry removed by a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentCoin {
    pub outpoint: OutPoint,
    /// Block containing the transaction that created the output.
    pub block_hash: Hash256,
}

/// Undo data for a single block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    /// Coins spent by this block, restored when reverting.
    pub spent_coins: Vec<SpentCoin>,
    /// Coins created by this block, removed when reverting.
    pub created_outpoints: Vec<OutPoint>,
    /// Address index keys written by this block.
    pub address_keys: Vec<Vec<u8>>,
}

impl BlockUndo {
    pub fn record_spend(&mut self, outpoint: OutPoint, block_hash: Hash256) {
        self.spent_coins.push(SpentCoin {
            outpoint,
            block_hash,
        });
    }

    pub fn record_create(&mut self, outpoint: OutPoint) {
        self.created_outpoints.push(outpoint);
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
