//! Construction of the node components.

use crate::Error;
use crate::cli::params::CommonParams;
use bitnode_chain::Chain;
use bitnode_mempool::{CoinsView, MemPool};
use bitnode_storage::ChainStore;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Components shared by the node services.
pub struct NodeComponents {
    pub chain: Arc<Chain>,
    pub mempool: Arc<MemPool>,
}

/// Opens the chain state and creates the genesis block on the first start.
pub fn new_node(common_params: &CommonParams) -> Result<NodeComponents, Error> {
    let network = common_params.network;
    let chainstate_dir = common_params.chainstate_dir();

    std::fs::create_dir_all(&chainstate_dir)?;

    let store = ChainStore::new(&chainstate_dir, network);
    store.connect()?;

    let chain = Arc::new(Chain::new(Arc::new(store)));
    chain.create_genesis_block()?;

    let coins: Arc<dyn CoinsView> = chain.clone();
    let mempool = Arc::new(MemPool::new(coins, network));

    Ok(NodeComponents { chain, mempool })
}

/// Drops the transactions of every committed block from the mempool.
pub async fn remove_committed_transactions(chain: Arc<Chain>, mempool: Arc<MemPool>) {
    let mut notifications = chain.subscribe();

    loop {
        match notifications.recv().await {
            Ok(committed) => {
                mempool.remove(&committed.block);
                tracing::trace!(
                    "Mempool updated with block #{},{}, {} transactions pending",
                    committed.number,
                    committed.hash,
                    mempool.len()
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Mempool missed block notifications");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_primitives::{Network, OutPoint, TxOut};
    use bitnode_test_utils::{build_block, build_chain, coinbase, p2pkh_script, spend};
    use std::time::Duration;

    fn common_params(base_path: &std::path::Path) -> CommonParams {
        CommonParams {
            network: Network::Testnet,
            base_path: base_path.to_path_buf(),
            log: "info".to_string(),
        }
    }

    #[test]
    fn node_reopens_its_chain_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let params = common_params(temp_dir.path());

        let genesis_hash = {
            let NodeComponents { chain, .. } = new_node(&params).unwrap();
            assert_eq!(chain.best_number().unwrap(), 0);
            let genesis_hash = chain.get_hash(0).unwrap().unwrap();
            let blocks = build_chain(genesis_hash, 2, 1);
            for block in blocks {
                assert!(chain.add_block(block).unwrap().is_committed());
            }
            genesis_hash
        };

        assert!(params.chainstate_dir().exists());

        let NodeComponents { chain, .. } = new_node(&params).unwrap();
        assert_eq!(chain.best_number().unwrap(), 2);
        assert_eq!(chain.get_hash(0).unwrap(), Some(genesis_hash));
    }

    #[tokio::test]
    async fn committed_transactions_leave_the_mempool() {
        let temp_dir = tempfile::tempdir().unwrap();
        let NodeComponents { chain, mempool } = new_node(&common_params(temp_dir.path())).unwrap();

        let genesis_hash = chain.get_hash(0).unwrap().unwrap();
        let funding = build_chain(genesis_hash, 1, 1).remove(0);
        let funding_hash = funding.hash();
        chain.add_block(funding.clone()).unwrap();

        let tx = spend(
            &[OutPoint::new(funding.transactions()[0].hash(), 0)],
            vec![TxOut::new(1_000, p2pkh_script(9))],
        );
        mempool.add(tx.clone()).unwrap();
        assert!(mempool.has(&tx.hash()));

        tokio::spawn(remove_committed_transactions(
            chain.clone(),
            mempool.clone(),
        ));
        // Let the task subscribe before the commit.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let block = build_block(
            funding_hash,
            vec![coinbase(100, p2pkh_script(100)), tx.clone()],
            100,
        );
        let committed = chain.wait_for_block(block.hash()).unwrap();
        chain.add_block(block).unwrap();
        committed.await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while mempool.has(&tx.hash()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Transaction is still in the mempool");
        assert!(mempool.is_empty());
    }
}
