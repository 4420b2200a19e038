//! Chain state storage for bitnode.
//!
//! The store keeps the committed blocks and everything derived from them in a single
//! RocksDB instance:
//!
//! - **Chain index**: block by hash, height by hash, hash by height and a chain tip
//!   snapshot per height plus the current one.
//! - **Unspent outputs**: one entry per spendable output, valued by the containing block.
//! - **Transaction and address indexes**: location of every committed transaction and
//!   the transactions touching an address.
//! - **Undo data**: per-block records in a separate column family, written in the same
//!   atomic batch as the block, allowing the chain to be rolled back one block at a time.

mod cache;
mod error;
mod keys;
mod store;
mod undo;

pub use self::error::Error;
pub use self::store::ChainStore;
pub use self::undo::{BlockUndo, SpentCoin};

use bitnode_primitives::{BlockNumber, Hash256};
use serde::{Deserialize, Serialize};

/// Result type for chain store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Height reported for the null hash, the parent of genesis.
pub const NULL_HEIGHT: i64 = -1;

/// Snapshot of the best chain at a given height.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: BlockNumber,
    /// Number of transactions in the chain up to and including this block.
    pub tx_count: u64,
    /// Block timestamp.
    pub time: u32,
}

/// Location of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxLocation {
    pub block_hash: Hash256,
    pub height: BlockNumber,
    /// Position of the transaction within the block.
    pub tx_index: u32,
}

/// Committed transaction involving an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressTx {
    pub txid: Hash256,
    pub block_hash: Hash256,
    pub height: BlockNumber,
    pub tx_index: u32,
}
