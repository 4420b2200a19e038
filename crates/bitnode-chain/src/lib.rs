//! Chain controller of bitnode.
//!
//! [`Chain`] is the single entry point for committing blocks to the [`ChainStore`]. It
//! checks the structural validity of incoming blocks, serializes the commits and notifies
//! the rest of the node about every new block.

mod checkpoint;

pub use self::checkpoint::{MAX_HEADERS_PER_MESSAGE, checkpoints, next_checkpoint};

use bitnode_primitives::{
    Block, BlockHeader, BlockNumber, Hash256, IndexedBlock, Network, OutPoint, Transaction, TxOut,
};
use bitnode_storage::{AddressTx, ChainStore, ChainTip, TxLocation};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

/// Capacity of the block notification channel.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Chain controller error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Merkle root mismatch in block {block_hash}: header has {in_header}, computed {computed}")]
    MerkleRootMismatch {
        block_hash: Hash256,
        in_header: Hash256,
        computed: Hash256,
    },
    #[error("Genesis block mismatch, expected {expected}, found {got} in the database")]
    GenesisMismatch { expected: Hash256, got: Hash256 },
    #[error("Block {0} has no transactions")]
    EmptyBlock(Hash256),
    #[error(transparent)]
    Storage(#[from] bitnode_storage::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of [`Chain::add_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddBlockOutcome {
    /// Block is now the chain tip.
    Committed(IndexedBlock),
    /// Block was already part of the chain at the given height.
    Duplicate(BlockNumber),
    /// Parent of the block is unknown, nothing was written.
    Orphan,
}

impl AddBlockOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Notification emitted once a block is committed.
#[derive(Debug, Clone)]
pub struct BlockCommitted {
    pub number: BlockNumber,
    pub hash: Hash256,
    pub block: Arc<Block>,
}

/// Block locator paired with the hash at which the peer should stop sending headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    pub locator_hashes: Vec<Hash256>,
    /// Next checkpoint above the tip, null to download up to the peer's best block.
    pub stop_hash: Hash256,
}

/// Validation gate in front of the chain store.
pub struct Chain {
    store: Arc<ChainStore>,
    network: Network,
    commit_gate: Mutex<()>,
    notification_sender: broadcast::Sender<BlockCommitted>,
    block_waiters: Mutex<HashMap<Hash256, Vec<oneshot::Sender<BlockCommitted>>>>,
}

impl Chain {
    /// Creates a controller over a connected `store`.
    pub fn new(store: Arc<ChainStore>) -> Self {
        let (notification_sender, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            network: store.network(),
            store,
            commit_gate: Mutex::new(()),
            notification_sender,
            block_waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    /// Validates `block` and commits it on top of its parent.
    ///
    /// Blocking, as the commit writes to the database.
    pub fn add_block(&self, block: Block) -> Result<AddBlockOutcome> {
        let block_hash = block.hash();

        if block.transactions().is_empty() {
            return Err(Error::EmptyBlock(block_hash));
        }

        let computed = block.compute_merkle_root();
        let in_header = block.header().merkle_root();
        if computed != in_header {
            return Err(Error::MerkleRootMismatch {
                block_hash,
                in_header,
                computed,
            });
        }

        let _gate = self.commit_gate.lock();

        // Under the gate, a block committed concurrently is seen here and notified once.
        if let Some(height) = self.store.get_height(&block_hash)? {
            tracing::trace!("Block #{height},{block_hash} is already in chain");
            return Ok(AddBlockOutcome::Duplicate(height as BlockNumber));
        }

        if !self.store.save_block(&block)? {
            tracing::debug!(
                "Block {block_hash} not committed, parent {} is unknown",
                block.header().prev_blockhash()
            );
            return Ok(AddBlockOutcome::Orphan);
        }

        let tip = self.store.get_local_tip()?;
        let committed = IndexedBlock {
            number: tip.height,
            hash: block_hash,
        };

        tracing::debug!("Imported block {committed}");

        self.notify(BlockCommitted {
            number: committed.number,
            hash: block_hash,
            block: Arc::new(block),
        });

        Ok(AddBlockOutcome::Committed(committed))
    }

    fn notify(&self, notification: BlockCommitted) {
        if let Some(waiters) = self.block_waiters.lock().remove(&notification.hash) {
            for waiter in waiters {
                let _ = waiter.send(notification.clone());
            }
        }

        // No receiver is fine.
        let _ = self.notification_sender.send(notification);
    }

    /// Stream of all committed blocks.
    pub fn subscribe(&self) -> broadcast::Receiver<BlockCommitted> {
        self.notification_sender.subscribe()
    }

    /// Resolves once the block `hash` is committed.
    ///
    /// The subscription is dropped after firing. A block already in the chain resolves
    /// immediately.
    pub fn wait_for_block(&self, hash: Hash256) -> Result<oneshot::Receiver<BlockCommitted>> {
        let (sender, receiver) = oneshot::channel();

        let mut waiters = self.block_waiters.lock();

        // Checked under the waiters lock, commits notify only after the store write.
        if let Some(height) = self.store.get_height(&hash)?.filter(|h| *h >= 0) {
            if let Some(block) = self.store.get_block(&hash)? {
                let _ = sender.send(BlockCommitted {
                    number: height as BlockNumber,
                    hash,
                    block: Arc::new(block),
                });
                return Ok(receiver);
            }
        }

        waiters.entry(hash).or_default().push(sender);

        Ok(receiver)
    }

    /// Commits the genesis block of the network if the chain is empty.
    pub fn create_genesis_block(&self) -> Result<IndexedBlock> {
        let genesis = self.network.genesis_block();
        let hash = genesis.hash();

        if let Some(existing) = self.store.get_hash(0)? {
            if existing != hash {
                return Err(Error::GenesisMismatch {
                    expected: hash,
                    got: existing,
                });
            }
            return Ok(IndexedBlock { number: 0, hash });
        }

        match self.add_block(genesis)? {
            AddBlockOutcome::Committed(block) => {
                tracing::info!("Created genesis block {hash}");
                Ok(block)
            }
            AddBlockOutcome::Duplicate(number) => Ok(IndexedBlock { number, hash }),
            AddBlockOutcome::Orphan => Err(Error::GenesisMismatch {
                expected: hash,
                got: Hash256::ZERO,
            }),
        }
    }

    /// Locator for a header request starting at `tip`.
    pub fn get_locators(&self, tip: BlockNumber) -> Result<BlockLocator> {
        let locator_hashes = self.store.get_locators(tip)?;
        let stop_hash = next_checkpoint(self.network, tip)
            .map(|checkpoint| checkpoint.hash)
            .unwrap_or(Hash256::ZERO);
        Ok(BlockLocator {
            locator_hashes,
            stop_hash,
        })
    }

    /// Headers following the first locator hash found on the chain, answering `getheaders`.
    ///
    /// The headers stop after `stop_hash` or at [`MAX_HEADERS_PER_MESSAGE`]. When no locator
    /// hash is on the chain the headers start right after genesis.
    pub fn locate_headers(
        &self,
        locator_hashes: &[Hash256],
        stop_hash: &Hash256,
    ) -> Result<Vec<BlockHeader>> {
        let mut start = 1;
        for locator_hash in locator_hashes {
            // The null hash is indexed below genesis.
            if let Some(height) = self.store.get_height(locator_hash)?.filter(|h| *h >= 0) {
                start = height as BlockNumber + 1;
                break;
            }
        }

        let best_number = self.best_number()?;

        let mut headers = Vec::new();
        for number in start..=best_number {
            if headers.len() == MAX_HEADERS_PER_MESSAGE as usize {
                break;
            }
            let Some(block_hash) = self.store.get_hash(number)? else {
                break;
            };
            let Some(block) = self.store.get_block(&block_hash)? else {
                break;
            };
            headers.push(block.header().clone());
            if block_hash == *stop_hash {
                break;
            }
        }

        Ok(headers)
    }

    pub fn local_tip(&self) -> Result<ChainTip> {
        Ok(self.store.get_local_tip()?)
    }

    pub fn best_number(&self) -> Result<BlockNumber> {
        Ok(self.local_tip()?.height)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        Ok(self.store.get_block(hash)?)
    }

    pub fn get_height(&self, hash: &Hash256) -> Result<Option<i64>> {
        Ok(self.store.get_height(hash)?)
    }

    pub fn get_hash(&self, height: BlockNumber) -> Result<Option<Hash256>> {
        Ok(self.store.get_hash(height)?)
    }

    /// Whether `hash` is a committed block.
    pub fn contains(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.store.contains_block(hash)?)
    }

    pub fn get_unspent_coins(&self, txid: &Hash256) -> Result<Vec<(OutPoint, TxOut)>> {
        Ok(self.store.get_unspent_coins(txid)?)
    }

    pub fn get_output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>> {
        Ok(self.store.get_output(outpoint)?)
    }

    pub fn get_transaction(&self, txid: &Hash256) -> Result<Option<(Transaction, TxLocation)>> {
        Ok(self.store.get_transaction(txid)?)
    }

    pub fn get_address_history(
        &self,
        address: &str,
        from_height: BlockNumber,
    ) -> Result<Vec<AddressTx>> {
        Ok(self.store.get_address_history(address, from_height)?)
    }
}
