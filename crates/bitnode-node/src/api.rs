//! Read API of the node.
//!
//! Every call carries the network the caller expects to talk to and is rejected when it differs
//! from the network of the node.

use bitnode_chain::Chain;
use bitnode_mempool::MemPool;
use bitnode_network::{NetworkApi, SendTransactionResult, SyncState};
use bitnode_primitives::codec::{self, DecodeError};
use bitnode_primitives::{Block, BlockNumber, Hash256, Network, Transaction};
use bitnode_storage::{AddressTx, TxLocation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Read API result type.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Read API errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Request for {got} sent to a {expected} node")]
    NetworkMismatch { expected: Network, got: Network },
    #[error("Invalid hex: {0}")]
    DecodeHex(#[from] hex::FromHexError),
    #[error("Invalid transaction: {0}")]
    Decode(#[from] DecodeError),
    #[error("Network is unavailable")]
    NetworkUnavailable,
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Chain(#[from] bitnode_chain::Error),
}

/// Best block of the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub network: Network,
    pub best_hash: Hash256,
    pub height: BlockNumber,
    /// Number of transactions in the chain.
    pub tx_count: u64,
    pub time: u32,
    pub sync_state: SyncState,
    pub num_sync_peers: usize,
    /// Best block number agreed by the peers.
    pub network_best_number: u32,
    pub mempool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub hash: Hash256,
    /// None if the block is not part of the best chain.
    pub height: Option<BlockNumber>,
    pub version: i32,
    pub prev_blockhash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub size: usize,
    pub txids: Vec<Hash256>,
    /// Serialized block, hex-encoded.
    pub raw: String,
}

impl BlockInfo {
    fn new(block: &Block, height: Option<BlockNumber>) -> Self {
        let header = block.header();
        Self {
            hash: block.hash(),
            height,
            version: header.version(),
            prev_blockhash: header.prev_blockhash(),
            merkle_root: header.merkle_root(),
            time: header.time(),
            bits: header.bits(),
            nonce: header.nonce(),
            size: block.total_size(),
            txids: block.transactions().iter().map(Transaction::hash).collect(),
            raw: hex::encode(codec::serialize(block)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub txid: Hash256,
    pub size: usize,
    /// Block containing the transaction, None while it is in the mempool.
    pub location: Option<TxLocation>,
    /// Serialized transaction, hex-encoded.
    pub raw: String,
}

impl TransactionInfo {
    fn new(tx: &Transaction, location: Option<TxLocation>) -> Self {
        Self {
            txid: tx.hash(),
            size: tx.total_size(),
            location,
            raw: hex::encode(codec::serialize(tx)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressHistory {
    pub address: String,
    pub confirmed: Vec<AddressTx>,
    /// Mempool transactions involving the address.
    pub unconfirmed: Vec<Hash256>,
}

/// In-process API over the chain, the mempool and the network.
pub struct NodeApi {
    chain: Arc<Chain>,
    mempool: Arc<MemPool>,
    network_api: Arc<dyn NetworkApi>,
}

impl NodeApi {
    pub fn new(chain: Arc<Chain>, mempool: Arc<MemPool>, network_api: Arc<dyn NetworkApi>) -> Self {
        Self {
            chain,
            mempool,
            network_api,
        }
    }

    fn ensure_network(&self, network: Network) -> Result<()> {
        let expected = self.chain.network();
        if network != expected {
            return Err(ApiError::NetworkMismatch {
                expected,
                got: network,
            });
        }
        Ok(())
    }

    pub fn chain_info(&self, network: Network) -> Result<ChainInfo> {
        self.ensure_network(network)?;

        let tip = self.chain.local_tip()?;

        Ok(ChainInfo {
            network,
            best_hash: tip.hash,
            height: tip.height,
            tx_count: tip.tx_count,
            time: tip.time,
            sync_state: self.network_api.sync_state(),
            num_sync_peers: self.network_api.sync_peers().len(),
            network_best_number: self.network_api.best_number(),
            mempool_size: self.mempool.len(),
        })
    }

    pub fn block(&self, network: Network, hash: Hash256) -> Result<Option<BlockInfo>> {
        self.ensure_network(network)?;

        let Some(block) = self.chain.get_block(&hash)? else {
            return Ok(None);
        };

        let height = self
            .chain
            .get_height(&hash)?
            .and_then(|height| BlockNumber::try_from(height).ok());

        Ok(Some(BlockInfo::new(&block, height)))
    }

    /// Looks up the mempool first, then the chain.
    pub fn transaction(&self, network: Network, txid: Hash256) -> Result<Option<TransactionInfo>> {
        self.ensure_network(network)?;

        if let Some(tx) = self.mempool.get(&txid) {
            return Ok(Some(TransactionInfo::new(&tx, None)));
        }

        Ok(self
            .chain
            .get_transaction(&txid)?
            .map(|(tx, location)| TransactionInfo::new(&tx, Some(location))))
    }

    pub fn history_by_address(
        &self,
        network: Network,
        address: &str,
        from_height: BlockNumber,
    ) -> Result<AddressHistory> {
        self.ensure_network(network)?;

        Ok(AddressHistory {
            address: address.to_string(),
            confirmed: self.chain.get_address_history(address, from_height)?,
            unconfirmed: self.mempool.history(address),
        })
    }

    /// Decodes `raw_tx`, adds it to the mempool and announces it to the peers.
    pub async fn broadcast_tx(&self, network: Network, raw_tx: &str) -> Result<Hash256> {
        self.ensure_network(network)?;

        let tx: Transaction = codec::deserialize(&hex::decode(raw_tx.trim())?)?;

        if !self.network_api.enabled() {
            return Err(ApiError::NetworkUnavailable);
        }

        match self.network_api.send_transaction(tx).await {
            SendTransactionResult::Success(txid) => Ok(txid),
            SendTransactionResult::Failure(reason) => Err(ApiError::Rejected(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_mempool::{AddOutcome, CoinsView};
    use bitnode_network::{NoNetwork, NetworkStatus, PeerSync};
    use bitnode_primitives::{OutPoint, TxOut, extract_addresses};
    use bitnode_storage::ChainStore;
    use bitnode_test_utils::{build_chain, p2pkh_script, spend};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Network accepting every transaction into the mempool.
    struct MockNetwork {
        mempool: Arc<MemPool>,
        sent: Mutex<Vec<Hash256>>,
    }

    #[async_trait::async_trait]
    impl NetworkApi for MockNetwork {
        fn enabled(&self) -> bool {
            true
        }

        async fn status(&self) -> Option<NetworkStatus> {
            None
        }

        fn sync_peers(&self) -> Vec<PeerSync> {
            Vec::new()
        }

        fn sync_state(&self) -> SyncState {
            SyncState::Synchronized
        }

        fn best_number(&self) -> u32 {
            2
        }

        async fn send_transaction(&self, transaction: Transaction) -> SendTransactionResult {
            let txid = transaction.hash();
            match self.mempool.add(transaction) {
                Ok(AddOutcome::Added { .. }) => {
                    self.sent.lock().push(txid);
                    SendTransactionResult::Success(txid)
                }
                Ok(AddOutcome::Orphan { .. }) => {
                    SendTransactionResult::Failure("Missing inputs".to_string())
                }
                Err(err) => SendTransactionResult::Failure(err.to_string()),
            }
        }
    }

    struct TestApi {
        _temp_dir: TempDir,
        chain: Arc<Chain>,
        mempool: Arc<MemPool>,
        blocks: Vec<Block>,
    }

    impl TestApi {
        /// Testnet chain of genesis and two blocks paying to `p2pkh_script(1)` and
        /// `p2pkh_script(2)`.
        fn new() -> Self {
            let temp_dir = tempfile::tempdir().unwrap();
            let store = ChainStore::new(temp_dir.path(), Network::Testnet);
            store.connect().unwrap();
            let chain = Arc::new(Chain::new(Arc::new(store)));
            let genesis = chain.create_genesis_block().unwrap();
            let blocks = build_chain(genesis.hash, 2, 1);
            for block in blocks.clone() {
                assert!(chain.add_block(block).unwrap().is_committed());
            }
            let coins: Arc<dyn CoinsView> = chain.clone();
            let mempool = Arc::new(MemPool::new(coins, Network::Testnet));
            Self {
                _temp_dir: temp_dir,
                chain,
                mempool,
                blocks,
            }
        }

        fn api(&self, network_api: Arc<dyn NetworkApi>) -> NodeApi {
            NodeApi::new(self.chain.clone(), self.mempool.clone(), network_api)
        }

        fn mock_network(&self) -> Arc<MockNetwork> {
            Arc::new(MockNetwork {
                mempool: self.mempool.clone(),
                sent: Mutex::new(Vec::new()),
            })
        }

        /// Spends the coinbase of the first block to `p2pkh_script(seed)`.
        fn spend_first_coinbase(&self, seed: u8) -> Transaction {
            spend(
                &[OutPoint::new(self.blocks[0].transactions()[0].hash(), 0)],
                vec![TxOut::new(1_000, p2pkh_script(seed))],
            )
        }
    }

    fn address(seed: u8) -> String {
        extract_addresses(&p2pkh_script(seed), Network::Testnet).remove(0)
    }

    #[test]
    fn requests_for_another_network_are_rejected() {
        let test_api = TestApi::new();
        let api = test_api.api(Arc::new(NoNetwork));

        assert!(matches!(
            api.chain_info(Network::Mainnet),
            Err(ApiError::NetworkMismatch {
                expected: Network::Testnet,
                got: Network::Mainnet
            })
        ));
        assert!(matches!(
            api.block(Network::Mainnet, test_api.blocks[0].hash()),
            Err(ApiError::NetworkMismatch { .. })
        ));
        assert!(matches!(
            api.history_by_address(Network::Mainnet, &address(1), 0),
            Err(ApiError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn chain_info_reports_the_tip() {
        let test_api = TestApi::new();
        let api = test_api.api(test_api.mock_network());

        let info = api.chain_info(Network::Testnet).unwrap();
        assert_eq!(info.height, 2);
        assert_eq!(info.best_hash, test_api.blocks[1].hash());
        assert_eq!(info.tx_count, 3);
        assert_eq!(info.sync_state, SyncState::Synchronized);
        assert_eq!(info.network_best_number, 2);
        assert_eq!(info.mempool_size, 0);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["network"], "testnet");
        assert_eq!(json["height"], 2);
        assert_eq!(json["bestHash"], test_api.blocks[1].hash().to_string());
    }

    #[test]
    fn block_lookup() {
        let test_api = TestApi::new();
        let api = test_api.api(Arc::new(NoNetwork));

        let block = &test_api.blocks[0];
        let info = api.block(Network::Testnet, block.hash()).unwrap().unwrap();
        assert_eq!(info.height, Some(1));
        assert_eq!(info.prev_blockhash, test_api.chain.get_hash(0).unwrap().unwrap());
        assert_eq!(info.txids, vec![block.transactions()[0].hash()]);
        let decoded: Block = codec::deserialize(&hex::decode(&info.raw).unwrap()).unwrap();
        assert_eq!(decoded.hash(), block.hash());

        assert_eq!(
            api.block(Network::Testnet, Hash256::from_bytes([7; 32])).unwrap(),
            None
        );
    }

    #[test]
    fn transaction_is_found_in_mempool_then_chain() {
        let test_api = TestApi::new();
        let api = test_api.api(Arc::new(NoNetwork));

        let coinbase = test_api.blocks[1].transactions()[0].hash();
        let confirmed = api.transaction(Network::Testnet, coinbase).unwrap().unwrap();
        assert_eq!(confirmed.txid, coinbase);
        let location = confirmed.location.unwrap();
        assert_eq!(location.height, 2);
        assert_eq!(location.block_hash, test_api.blocks[1].hash());
        assert_eq!(location.tx_index, 0);

        let tx = test_api.spend_first_coinbase(9);
        test_api.mempool.add(tx.clone()).unwrap();
        let pending = api.transaction(Network::Testnet, tx.hash()).unwrap().unwrap();
        assert_eq!(pending.location, None);
        assert_eq!(pending.raw, hex::encode(codec::serialize(&tx)));

        assert_eq!(
            api.transaction(Network::Testnet, Hash256::from_bytes([3; 32]))
                .unwrap(),
            None
        );
    }

    #[test]
    fn address_history_merges_chain_and_mempool() {
        let test_api = TestApi::new();
        let api = test_api.api(Arc::new(NoNetwork));

        let tx = test_api.spend_first_coinbase(1);
        test_api.mempool.add(tx.clone()).unwrap();

        let history = api
            .history_by_address(Network::Testnet, &address(1), 0)
            .unwrap();
        assert_eq!(history.address, address(1));
        assert_eq!(history.confirmed.len(), 1);
        assert_eq!(
            history.confirmed[0].txid,
            test_api.blocks[0].transactions()[0].hash()
        );
        assert_eq!(history.confirmed[0].height, 1);
        assert_eq!(history.unconfirmed, vec![tx.hash()]);

        let later = api
            .history_by_address(Network::Testnet, &address(1), 2)
            .unwrap();
        assert!(later.confirmed.is_empty());
    }

    #[tokio::test]
    async fn broadcast_tx() {
        let test_api = TestApi::new();
        let network = test_api.mock_network();
        let api = test_api.api(network.clone());

        let tx = test_api.spend_first_coinbase(4);
        let raw = hex::encode(codec::serialize(&tx));

        assert_eq!(
            api.broadcast_tx(Network::Testnet, &raw).await.unwrap(),
            tx.hash()
        );
        assert_eq!(*network.sent.lock(), vec![tx.hash()]);
        assert!(test_api.mempool.has(&tx.hash()));

        // Already pooled.
        assert!(matches!(
            api.broadcast_tx(Network::Testnet, &raw).await,
            Err(ApiError::Rejected(_))
        ));
        assert!(matches!(
            api.broadcast_tx(Network::Testnet, "zz").await,
            Err(ApiError::DecodeHex(_))
        ));
        assert!(matches!(
            api.broadcast_tx(Network::Testnet, "0100").await,
            Err(ApiError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_tx_without_network() {
        let test_api = TestApi::new();
        let api = test_api.api(Arc::new(NoNetwork));

        let raw = hex::encode(codec::serialize(&test_api.spend_first_coinbase(4)));
        assert!(matches!(
            api.broadcast_tx(Network::Testnet, &raw).await,
            Err(ApiError::NetworkUnavailable)
        ));
        assert!(test_api.mempool.is_empty());
    }
}
