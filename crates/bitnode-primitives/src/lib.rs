//! Primitive types shared by the bitnode crates.
//!
//! The [`codec`] module provides the binary reader/writer used for the consensus bytes of
//! blocks and transactions and for the stored records. Hashes, transactions and blocks
//! are built on it.

mod block;
pub mod codec;
mod hash;
mod network;
pub mod script;
mod transaction;

pub use self::block::{Block, BlockHeader, HEADER_SIZE, merkle_root};
pub use self::codec::{Decodable, DecodeError, Encodable, Reader, Writer};
pub use self::hash::Hash256;
pub use self::network::Network;
pub use self::script::{ScriptKind, extract_addresses};
pub use self::transaction::{MutableTransaction, OutPoint, Transaction, TxIn, TxOut};

/// Height of a block in the chain.
pub type BlockNumber = u32;

/// Block number and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct IndexedBlock {
    /// Block number.
    pub number: BlockNumber,
    /// Block hash.
    pub hash: Hash256,
}

impl std::fmt::Display for IndexedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{},{}", self.number, self.hash)
    }
}
