use bitnode_primitives::Hash256;

/// Errors that can occur when adding transactions to the mempool.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("Transaction {0} already in mempool")]
    AlreadyInMempool(Hash256),

    #[error("Coinbase transaction {0} not allowed")]
    Coinbase(Hash256),

    #[error("Transaction {0} has no inputs or no outputs")]
    Empty(Hash256),

    #[error("Failed to look up coins: {0}")]
    CoinsView(String),
}
