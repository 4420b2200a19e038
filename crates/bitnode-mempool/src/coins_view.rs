//! Access to the committed unspent outputs.

use crate::error::MempoolError;
use bitnode_chain::Chain;
use bitnode_primitives::{OutPoint, TxOut};

/// Read-only view of the committed unspent output set.
pub trait CoinsView: Send + Sync {
    /// Returns the output referenced by `outpoint` if it exists and is unspent.
    fn get_output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, MempoolError>;
}

impl CoinsView for Chain {
    fn get_output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, MempoolError> {
        Chain::get_output(self, outpoint).map_err(|err| MempoolError::CoinsView(err.to_string()))
    }
}
