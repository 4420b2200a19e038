//! Error types of the chain state store.

use bitnode_primitives::{DecodeError, Hash256};

/// Errors that can occur during chain state store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored bytes could not be decoded.
    #[error("Failed to decode stored record: {0}")]
    Decode(#[from] DecodeError),

    /// Record has an unexpected shape.
    #[error("Corrupted {0} record")]
    Corrupted(&'static str),

    /// Undo record of a committed block is missing.
    #[error("Undo data not found for block {0}")]
    UndoNotFound(Hash256),

    /// Committed block body is missing.
    #[error("Block {0} not found")]
    BlockNotFound(Hash256),

    /// The store is not connected.
    #[error("Chain store is not connected")]
    NotConnected,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
