use crate::cache::StoreCache;
use crate::keys::{self, UNDO_CF};
use crate::undo::BlockUndo;
use crate::{AddressTx, ChainTip, Error, NULL_HEIGHT, Result, TxLocation};
use bitnode_primitives::codec::{deserialize, serialize};
use bitnode_primitives::{
    Block, BlockNumber, Hash256, Network, OutPoint, Transaction, TxOut, extract_addresses,
};
use parking_lot::{Mutex, RwLock};
use rocksdb::{ColumnFamilyDescriptor, DB, Options, WriteBatch};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum number of hashes in a block locator.
const MAX_LOCATOR_HASHES: usize = 30;

/// Number of consecutive hashes at the head of a locator before the step starts doubling.
const DENSE_LOCATOR_HASHES: usize = 10;

/// Chain state store over RocksDB.
///
/// Blocks are committed through [`ChainStore::save_block`], which writes the block, its
/// indexes and its undo record in one atomic batch. Commits and rollbacks are serialized
/// internally, lookups can be performed concurrently.
pub struct ChainStore {
    path: PathBuf,
    network: Network,
    db: RwLock<Option<Arc<DB>>>,
    cache: Mutex<StoreCache>,
    write_lock: Mutex<()>,
}

impl ChainStore {
    /// Constructs a store located at `path`, call [`Self::connect`] before use.
    pub fn new(path: impl AsRef<Path>, network: Network) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            network,
            db: RwLock::new(None),
            cache: Mutex::new(StoreCache::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Opens the database, creating it if missing. No-op if already connected.
    pub fn connect(&self) -> Result<()> {
        let mut guard = self.db.write();
        if guard.is_some() {
            return Ok(());
        }

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        db_opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(UNDO_CF, Options::default())];

        let db = DB::open_cf_descriptors(&db_opts, &self.path, cf_descriptors)?;

        let tip = db
            .get(keys::CURRENT_TIP)?
            .map(|bytes| bincode::deserialize::<ChainTip>(&bytes))
            .transpose()?;

        match &tip {
            Some(tip) => tracing::info!(
                "Opened chain store at {}, best block #{},{}",
                self.path.display(),
                tip.height,
                tip.hash
            ),
            None => tracing::info!("Opened empty chain store at {}", self.path.display()),
        }

        {
            let mut cache = self.cache.lock();
            cache.clear();
            cache.tip = tip;
        }

        *guard = Some(Arc::new(db));

        Ok(())
    }

    /// Closes the database. No-op if not connected.
    pub fn disconnect(&self) {
        if self.db.write().take().is_some() {
            self.cache.lock().clear();
            tracing::info!("Closed chain store at {}", self.path.display());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.db.read().is_some()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn db(&self) -> Result<Arc<DB>> {
        self.db.read().clone().ok_or(Error::NotConnected)
    }

    /// Returns the best committed block, or a zero-height null-hash tip for an empty store.
    pub fn get_local_tip(&self) -> Result<ChainTip> {
        Ok(self.current_tip()?.unwrap_or_default())
    }

    fn current_tip(&self) -> Result<Option<ChainTip>> {
        // The cache is loaded on connect and kept in sync by commits and rollbacks.
        self.db()?;
        Ok(self.cache.lock().tip)
    }

    /// Returns the height of `hash`, [`NULL_HEIGHT`] for the null hash.
    pub fn get_height(&self, hash: &Hash256) -> Result<Option<i64>> {
        if hash.is_null() {
            return Ok(Some(NULL_HEIGHT));
        }
        if let Some(height) = self.cache.lock().heights.get(hash) {
            return Ok(Some(i64::from(height)));
        }
        let db = self.db()?;
        db.get(keys::height_key(hash))?
            .map(|value| {
                keys::decode_height(&value)
                    .map(i64::from)
                    .ok_or(Error::Corrupted("height"))
            })
            .transpose()
    }

    pub fn get_hash(&self, height: BlockNumber) -> Result<Option<Hash256>> {
        if let Some(hash) = self.cache.lock().hashes.get(&height) {
            return Ok(Some(hash));
        }
        let db = self.db()?;
        db.get(keys::hash_key(height))?
            .map(|value| Hash256::from_slice(&value).map_err(|_| Error::Corrupted("hash")))
            .transpose()
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        let db = self.db()?;
        read_block(&db, hash)
    }

    /// Chain tip snapshot recorded at `height`.
    pub fn get_tip_at(&self, height: BlockNumber) -> Result<Option<ChainTip>> {
        let db = self.db()?;
        read_tip(&db, height)
    }

    /// Whether `hash` is part of the committed chain.
    pub fn contains_block(&self, hash: &Hash256) -> Result<bool> {
        Ok(!hash.is_null() && self.get_height(hash)?.is_some())
    }

    /// Returns up to 30 block hashes walking back from `height`, for header requests.
    ///
    /// The first ten hashes are consecutive, after which the step doubles each time. The
    /// genesis hash always comes last. Returns the null hash alone if `height` is below 1.
    pub fn get_locators(&self, height: BlockNumber) -> Result<Vec<Hash256>> {
        if height < 1 {
            return Ok(vec![Hash256::ZERO]);
        }

        let mut locators = Vec::with_capacity(MAX_LOCATOR_HASHES);
        let mut step = 1u32;
        let mut current = height;
        let mut visited = 0;

        while current > 0 && locators.len() < MAX_LOCATOR_HASHES - 1 {
            if let Some(hash) = self.get_hash(current)? {
                locators.push(hash);
            }
            visited += 1;
            if visited >= DENSE_LOCATOR_HASHES {
                step = step.saturating_mul(2);
            }
            current = current.saturating_sub(step);
        }

        if let Some(genesis) = self.get_hash(0)? {
            locators.push(genesis);
        }

        Ok(locators)
    }

    /// Commits `block` on top of its parent.
    ///
    /// Returns `Ok(false)` without touching the store if the parent is unknown. A block
    /// whose parent is not the current tip replaces the blocks above the parent first.
    /// Saving a block already in the chain is a no-op returning `Ok(true)`.
    pub fn save_block(&self, block: &Block) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let db = self.db()?;

        let hash = block.hash();
        if self.contains_block(&hash)? {
            tracing::trace!("Block {hash} is already committed");
            return Ok(true);
        }

        let prev_blockhash = block.header().prev_blockhash();
        let Some(parent_height) = self.get_height(&prev_blockhash)? else {
            tracing::debug!("Orphan block {hash}, parent {prev_blockhash} is unknown");
            return Ok(false);
        };
        let height = (parent_height + 1) as BlockNumber;

        if let Some(tip) = self.current_tip()? {
            if tip.hash != prev_blockhash {
                tracing::info!(
                    "Reorganizing from #{},{} to #{height},{hash}",
                    tip.height,
                    tip.hash
                );
                self.rollback_to(&db, height, &hash)?;
            }
        }

        let parent_tx_count = self.current_tip()?.map_or(0, |tip| tip.tx_count);
        let cf_undo = db.cf_handle(UNDO_CF).ok_or(Error::NotConnected)?;

        let mut batch = WriteBatch::default();
        let mut undo = BlockUndo::default();
        let created_outputs = self.index_transactions(&db, block, &mut batch, &mut undo)?;

        let tip = ChainTip {
            hash,
            height,
            tx_count: parent_tx_count + block.transactions().len() as u64,
            time: block.header().time(),
        };
        let tip_bytes = bincode::serialize(&tip)?;

        batch.put(keys::block_key(&hash), serialize(block));
        batch.put(keys::height_key(&hash), height.to_be_bytes());
        batch.put(keys::hash_key(height), hash.as_bytes());
        batch.put(keys::tip_key(height), &tip_bytes);
        batch.put(keys::CURRENT_TIP, &tip_bytes);
        batch.put_cf(cf_undo, hash.as_bytes(), undo.encode()?);

        if let Err(err) = db.write(batch) {
            tracing::error!(?err, "Failed to commit block #{height},{hash}");
            return Err(err.into());
        }

        {
            let mut cache = self.cache.lock();
            cache.tip = Some(tip);
            cache.heights.insert(hash, height);
            cache.hashes.insert(height, hash);
            for (outpoint, output) in created_outputs {
                cache.outputs.insert(outpoint, output);
            }
        }

        tracing::debug!(
            "Committed block #{height},{hash}: {} txs, +{} -{} coins",
            block.transactions().len(),
            undo.created_outpoints.len(),
            undo.spent_coins.len(),
        );

        Ok(true)
    }

    /// Writes the coin, transaction and address entries of `block` into `batch`.
    ///
    /// Returns the outputs created by the block.
    fn index_transactions(
        &self,
        db: &DB,
        block: &Block,
        batch: &mut WriteBatch,
        undo: &mut BlockUndo,
    ) -> Result<Vec<(OutPoint, TxOut)>> {
        let block_hash = block.hash();

        // Outputs created by earlier transactions of this block, not in the database yet.
        let mut in_block_outputs: HashMap<OutPoint, TxOut> = HashMap::new();
        let mut created = Vec::new();
        let mut loaded_blocks = HashMap::new();

        for (tx_index, tx) in block.transactions().iter().enumerate() {
            let tx_index = tx_index as u32;
            let txid = tx.hash();
            let mut addresses = BTreeSet::new();

            batch.put(keys::tx_key(&txid), keys::tx_location_value(&block_hash, tx_index));

            if !tx.is_coinbase() {
                for input in tx.inputs() {
                    let outpoint = input.previous_output;

                    let spent_output = if let Some(output) = in_block_outputs.remove(&outpoint) {
                        Some(output)
                    } else {
                        let Some(value) = db.get(keys::coin_key(&outpoint))? else {
                            tracing::warn!("Input {outpoint} of tx {txid} is not in the unspent set");
                            continue;
                        };
                        let containing_block =
                            Hash256::from_slice(&value).map_err(|_| Error::Corrupted("coin"))?;
                        undo.record_spend(outpoint, containing_block);
                        self.resolve_output(db, &containing_block, &outpoint, &mut loaded_blocks)?
                    };

                    batch.delete(keys::coin_key(&outpoint));

                    if let Some(output) = spent_output {
                        addresses.extend(extract_addresses(&output.script_pubkey, self.network));
                    }
                }
            }

            for (index, output) in tx.outputs().iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                batch.put(keys::coin_key(&outpoint), block_hash.as_bytes());
                undo.record_create(outpoint);
                addresses.extend(extract_addresses(&output.script_pubkey, self.network));
                in_block_outputs.insert(outpoint, output.clone());
                created.push((outpoint, output.clone()));
            }

            for address in addresses {
                let key = keys::address_key(&address, &txid);
                batch.put(&key, keys::tx_location_value(&block_hash, tx_index));
                undo.address_keys.push(key);
            }
        }

        Ok(created)
    }

    /// Finds the output referenced by `outpoint` inside `block_hash`.
    fn resolve_output(
        &self,
        db: &DB,
        block_hash: &Hash256,
        outpoint: &OutPoint,
        loaded_blocks: &mut HashMap<Hash256, Block>,
    ) -> Result<Option<TxOut>> {
        if let Some(output) = self.cache.lock().outputs.get(outpoint) {
            return Ok(Some(output));
        }

        if !loaded_blocks.contains_key(block_hash) {
            let Some(block) = read_block(db, block_hash)? else {
                return Ok(None);
            };
            loaded_blocks.insert(*block_hash, block);
        }

        Ok(loaded_blocks
            .get(block_hash)
            .and_then(|block| find_output(block, outpoint)))
    }

    /// Rolls back the chain until its tip is below `new_height` or equals `(new_height, hash)`.
    pub fn reorg(&self, new_height: BlockNumber, hash: &Hash256) -> Result<()> {
        let _guard = self.write_lock.lock();
        let db = self.db()?;
        self.rollback_to(&db, new_height, hash)
    }

    fn rollback_to(&self, db: &DB, new_height: BlockNumber, hash: &Hash256) -> Result<()> {
        while let Some(tip) = self.current_tip()? {
            if tip.height < new_height || (tip.height == new_height && tip.hash == *hash) {
                break;
            }
            self.undo_tip(db, tip)?;
        }
        Ok(())
    }

    /// Reverts the tip block in one atomic batch.
    fn undo_tip(&self, db: &DB, tip: ChainTip) -> Result<()> {
        let ChainTip { hash, height, .. } = tip;
        let cf_undo = db.cf_handle(UNDO_CF).ok_or(Error::NotConnected)?;

        let Some(undo_bytes) = db.get_cf(cf_undo, hash.as_bytes())? else {
            tracing::error!("Undo data of block #{height},{hash} is missing, rollback aborted");
            return Err(Error::UndoNotFound(hash));
        };
        let undo = BlockUndo::decode(&undo_bytes)?;
        let block = read_block(db, &hash)?.ok_or(Error::BlockNotFound(hash))?;

        let mut batch = WriteBatch::default();

        for outpoint in &undo.created_outpoints {
            batch.delete(keys::coin_key(outpoint));
        }
        for spent in &undo.spent_coins {
            batch.put(keys::coin_key(&spent.outpoint), spent.block_hash.as_bytes());
        }
        for tx in block.transactions() {
            batch.delete(keys::tx_key(&tx.hash()));
        }
        for key in &undo.address_keys {
            batch.delete(key);
        }

        batch.delete(keys::block_key(&hash));
        batch.delete(keys::height_key(&hash));
        batch.delete(keys::hash_key(height));
        batch.delete(keys::tip_key(height));

        let previous_tip = match height.checked_sub(1) {
            Some(prev_height) => Some(read_tip(db, prev_height)?.ok_or(Error::Corrupted("tip"))?),
            None => None,
        };
        match &previous_tip {
            Some(previous_tip) => batch.put(keys::CURRENT_TIP, bincode::serialize(previous_tip)?),
            None => batch.delete(keys::CURRENT_TIP),
        }

        batch.delete_cf(cf_undo, hash.as_bytes());

        db.write(batch)?;

        {
            let mut cache = self.cache.lock();
            cache.tip = previous_tip;
            cache.heights.remove(&hash);
            cache.hashes.remove(&height);
            for outpoint in &undo.created_outpoints {
                cache.outputs.remove(outpoint);
            }
        }

        tracing::info!(
            "Rolled back block #{height},{hash}: -{} +{} coins",
            undo.created_outpoints.len(),
            undo.spent_coins.len()
        );

        Ok(())
    }

    /// Returns the unspent outputs of transaction `txid`.
    pub fn get_unspent_coins(&self, txid: &Hash256) -> Result<Vec<(OutPoint, TxOut)>> {
        let db = self.db()?;
        let prefix = keys::coin_prefix(txid);

        let mut coins = Vec::new();
        let mut block: Option<Block> = None;
        let mut iter = db.raw_iterator();
        iter.seek(prefix);

        while iter.valid() {
            let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                break;
            };
            if !key.starts_with(&prefix) {
                break;
            }

            let index = keys::coin_index(key).ok_or(Error::Corrupted("coin"))?;
            let block_hash = Hash256::from_slice(value).map_err(|_| Error::Corrupted("coin"))?;

            // All outputs of a transaction live in the same block.
            if block.as_ref().is_none_or(|b| b.hash() != block_hash) {
                block = read_block(&db, &block_hash)?;
            }

            let outpoint = OutPoint::new(*txid, index);
            if let Some(output) = block.as_ref().and_then(|b| find_output(b, &outpoint)) {
                coins.push((outpoint, output));
            }

            iter.next();
        }

        iter.status()?;

        Ok(coins)
    }

    /// Whether `outpoint` refers to an unspent committed output.
    pub fn is_unspent(&self, outpoint: &OutPoint) -> Result<bool> {
        let db = self.db()?;
        Ok(db.get_pinned(keys::coin_key(outpoint))?.is_some())
    }

    /// Returns the output referenced by `outpoint` if it is unspent.
    pub fn get_output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>> {
        let db = self.db()?;
        let Some(value) = db.get(keys::coin_key(outpoint))? else {
            return Ok(None);
        };

        if let Some(output) = self.cache.lock().outputs.get(outpoint) {
            return Ok(Some(output));
        }

        let block_hash = Hash256::from_slice(&value).map_err(|_| Error::Corrupted("coin"))?;
        Ok(read_block(&db, &block_hash)?.and_then(|block| find_output(&block, outpoint)))
    }

    /// Looks up a committed transaction by id.
    pub fn get_transaction(&self, txid: &Hash256) -> Result<Option<(Transaction, TxLocation)>> {
        let db = self.db()?;
        let Some(value) = db.get(keys::tx_key(txid))? else {
            return Ok(None);
        };
        let (block_hash, tx_index) =
            keys::decode_tx_location(&value).ok_or(Error::Corrupted("tx index"))?;

        let Some(height) = self.get_height(&block_hash)? else {
            return Ok(None);
        };
        let Some(block) = read_block(&db, &block_hash)? else {
            return Ok(None);
        };

        let tx = block
            .transactions()
            .get(tx_index as usize)
            .filter(|tx| tx.hash() == *txid)
            .cloned();

        Ok(tx.map(|tx| {
            (
                tx,
                TxLocation {
                    block_hash,
                    height: height as BlockNumber,
                    tx_index,
                },
            )
        }))
    }

    /// Returns the committed transactions involving `address` at or above `from_height`,
    /// in chain order.
    pub fn get_address_history(
        &self,
        address: &str,
        from_height: BlockNumber,
    ) -> Result<Vec<AddressTx>> {
        let db = self.db()?;
        let prefix = keys::address_prefix(address);

        let mut entries = Vec::new();
        let mut iter = db.raw_iterator();
        iter.seek(&prefix);

        while iter.valid() {
            let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                break;
            };
            if !key.starts_with(&prefix) {
                break;
            }

            let txid = keys::address_key_txid(key).ok_or(Error::Corrupted("address"))?;
            let (block_hash, tx_index) =
                keys::decode_tx_location(value).ok_or(Error::Corrupted("address"))?;

            if let Some(height) = self.get_height(&block_hash)? {
                let height = height as BlockNumber;
                if height >= from_height {
                    entries.push(AddressTx {
                        txid,
                        block_hash,
                        height,
                        tx_index,
                    });
                }
            }

            iter.next();
        }

        iter.status()?;

        entries.sort_by_key(|entry| (entry.height, entry.tx_index));

        Ok(entries)
    }
}

fn read_block(db: &DB, hash: &Hash256) -> Result<Option<Block>> {
    db.get(keys::block_key(hash))?
        .map(|bytes| deserialize::<Block>(&bytes).map_err(Error::from))
        .transpose()
}

fn read_tip(db: &DB, height: BlockNumber) -> Result<Option<ChainTip>> {
    db.get(keys::tip_key(height))?
        .map(|bytes| bincode::deserialize::<ChainTip>(&bytes).map_err(Error::from))
        .transpose()
}

fn find_output(block: &Block, outpoint: &OutPoint) -> Option<TxOut> {
    block
        .transactions()
        .iter()
        .find(|tx| tx.hash() == outpoint.txid)
        .and_then(|tx| tx.outputs().get(outpoint.index as usize))
        .cloned()
}
