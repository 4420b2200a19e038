//! Bitcoin p2p messages.
//!
//! Framing, the handshake and the inventory messages are those of `bitcoin::p2p`. Blocks,
//! headers and transactions cross between the `bitcoin` types and the node's own types
//! through their consensus bytes.

use crate::Error;
use bitcoin::consensus::{Decodable, Encodable, encode};
use bitnode_primitives::codec;

pub use bitcoin::p2p::address::Address;
pub use bitcoin::p2p::message::{MAX_INV_SIZE, MAX_MSG_SIZE, NetworkMessage, RawNetworkMessage};
pub use bitcoin::p2p::message_blockdata::{GetHeadersMessage, Inventory};
pub use bitcoin::p2p::message_network::VersionMessage;
pub use bitcoin::p2p::{Magic, ServiceFlags};

/// Maximum number of entries in an `addr` message.
pub const MAX_ADDR_SIZE: usize = 1_000;

/// Converts a block, header or transaction into its `bitcoin` counterpart.
pub fn to_bitcoin<T: Decodable>(value: &impl codec::Encodable) -> Result<T, Error> {
    Ok(encode::deserialize(&codec::serialize(value))?)
}

/// Converts a `bitcoin` block, header or transaction into the node's type.
pub fn from_bitcoin<T: codec::Decodable>(value: &impl Encodable) -> Result<T, Error> {
    Ok(codec::deserialize(&encode::serialize(value))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_primitives::{Block, BlockHeader, Hash256, Transaction};

    #[test]
    fn blocks_keep_their_hashes_across_the_conversion() {
        for block in bitnode_test_utils::block_data() {
            let bitcoin_block: bitcoin::Block = to_bitcoin(&block).unwrap();
            assert_eq!(Hash256::from(bitcoin_block.block_hash()), block.hash());
            assert!(bitcoin_block.check_merkle_root());

            let back: Block = from_bitcoin(&bitcoin_block).unwrap();
            assert_eq!(back.hash(), block.hash());
            assert_eq!(back.transactions().len(), block.transactions().len());
        }
    }

    #[test]
    fn headers_and_transactions_convert() {
        let block = bitnode_test_utils::block_data().remove(2);

        let header: bitcoin::block::Header = to_bitcoin(block.header()).unwrap();
        assert_eq!(Hash256::from(header.prev_blockhash), block.header().prev_blockhash());
        let header: BlockHeader = from_bitcoin(&header).unwrap();
        assert_eq!(header.hash(), block.hash());

        let coinbase = &block.transactions()[0];
        let tx: bitcoin::Transaction = to_bitcoin(coinbase).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(Hash256::from(tx.compute_txid()), coinbase.hash());
        let tx: Transaction = from_bitcoin(&tx).unwrap();
        assert_eq!(tx.hash(), coinbase.hash());
    }

    #[test]
    fn undecodable_payloads_are_reported() {
        let inventory = vec![Inventory::Block(Hash256::ZERO.into())];
        assert!(matches!(
            from_bitcoin::<Block>(&inventory),
            Err(Error::Decode(_))
        ));
    }
}
