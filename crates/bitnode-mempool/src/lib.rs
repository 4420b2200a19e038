//! # Mempool
//!
//! Pool of unconfirmed transactions.
//!
//! 1. Input resolution.
//!     - Each input is resolved against the outputs of the pooled transactions first, then
//!       against the committed unspent outputs.
//!     - Transactions with resolved inputs are indexed by the addresses they involve.
//! 2. Orphans.
//!     - A transaction with unresolved inputs is parked, keyed by every missing parent.
//!     - Once a parent arrives, through the pool or a committed block, the orphans waiting
//!       only on it are replayed, recursively.
//!     - Orphans are evicted after [`ORPHAN_TTL`] or when more than [`MAX_ORPHANS`] are held.
//!
//! No script, fee or conflict policy is applied.

mod coins_view;
mod error;
mod inner;

pub use self::coins_view::CoinsView;
pub use self::error::MempoolError;

use self::inner::MemPoolInner;
use bitnode_primitives::{Block, Hash256, Network, Transaction, extract_addresses};
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time after which an orphan still missing a parent is dropped.
pub const ORPHAN_TTL: Duration = Duration::from_secs(20 * 60);

/// Maximum number of orphans kept in the pool.
pub const MAX_ORPHANS: usize = 100;

/// Result of [`MemPool::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Transaction is in the pool, together with the orphans it resolved.
    Added { resolved_orphans: Vec<Hash256> },
    /// Transaction is parked until the listed parents arrive.
    Orphan { missing: Vec<Hash256> },
}

enum Resolution {
    Resolved { addresses: Vec<String> },
    Missing(HashSet<Hash256>),
}

/// Thread-safe transaction pool.
pub struct MemPool {
    inner: RwLock<MemPoolInner>,
    coins: Arc<dyn CoinsView>,
    network: Network,
}

impl MemPool {
    pub fn new(coins: Arc<dyn CoinsView>, network: Network) -> Self {
        Self {
            inner: RwLock::new(MemPoolInner::default()),
            coins,
            network,
        }
    }

    /// Adds a transaction to the pool.
    pub fn add(&self, tx: Transaction) -> Result<AddOutcome, MempoolError> {
        self.add_at(tx, Instant::now())
    }

    fn add_at(&self, tx: Transaction, now: Instant) -> Result<AddOutcome, MempoolError> {
        let txid = tx.hash();

        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase(txid));
        }
        if tx.inputs().is_empty() || tx.outputs().is_empty() {
            return Err(MempoolError::Empty(txid));
        }

        let mut inner = self.inner.write();

        if inner.contains(&txid) {
            return Err(MempoolError::AlreadyInMempool(txid));
        }

        self.expire_orphans(&mut inner, now);

        let tx = Arc::new(tx);

        match self.resolve_inputs(&inner, &tx)? {
            Resolution::Resolved { addresses } => {
                inner.insert_resolved(tx, addresses);
                let resolved_orphans = self.resolve_orphans(&mut inner, txid);
                tracing::debug!(
                    "Added transaction {txid} to mempool, {} orphans resolved",
                    resolved_orphans.len()
                );
                Ok(AddOutcome::Added { resolved_orphans })
            }
            Resolution::Missing(missing) => {
                let mut missing_parents = missing.iter().copied().collect::<Vec<_>>();
                missing_parents.sort();
                tracing::debug!("Transaction {txid} is an orphan, missing {missing_parents:?}");
                inner.insert_orphan(tx, missing, now);
                self.limit_orphans(&mut inner);
                Ok(AddOutcome::Orphan {
                    missing: missing_parents,
                })
            }
        }
    }

    /// Looks up every spent output, collecting the addresses involved.
    fn resolve_inputs(
        &self,
        inner: &MemPoolInner,
        tx: &Transaction,
    ) -> Result<Resolution, MempoolError> {
        let mut missing = HashSet::new();
        let mut addresses = Vec::new();

        for input in tx.inputs() {
            let outpoint = &input.previous_output;
            let spent = match inner.output(outpoint) {
                Some(output) => Some(output),
                None => self.coins.get_output(outpoint)?,
            };
            match spent {
                Some(output) => {
                    addresses.extend(extract_addresses(&output.script_pubkey, self.network))
                }
                None => {
                    missing.insert(outpoint.txid);
                }
            }
        }

        if !missing.is_empty() {
            return Ok(Resolution::Missing(missing));
        }

        for output in tx.outputs() {
            addresses.extend(extract_addresses(&output.script_pubkey, self.network));
        }
        addresses.sort();
        addresses.dedup();

        Ok(Resolution::Resolved { addresses })
    }

    /// Replays the orphans waiting only on `txid`, and the ones waiting on them in turn.
    ///
    /// Returns the orphans moved into the pool.
    fn resolve_orphans(&self, inner: &mut MemPoolInner, txid: Hash256) -> Vec<Hash256> {
        let mut resolved = Vec::new();
        let mut queue = VecDeque::from([txid]);

        while let Some(parent) = queue.pop_front() {
            let Some(children) = inner.waiting_on.remove(&parent) else {
                continue;
            };

            for child in children {
                let still_missing = match inner.orphans.get_mut(&child) {
                    Some(orphan) => {
                        orphan.missing.remove(&parent);
                        !orphan.missing.is_empty()
                    }
                    None => continue,
                };

                if still_missing {
                    continue;
                }

                let Some(orphan) = inner.remove_orphan(&child) else {
                    continue;
                };

                match self.resolve_inputs(inner, &orphan.tx) {
                    Ok(Resolution::Resolved { addresses }) => {
                        tracing::trace!("Orphan {child} resolved by {parent}");
                        inner.insert_resolved(orphan.tx, addresses);
                        resolved.push(child);
                        queue.push_back(child);
                    }
                    Ok(Resolution::Missing(missing)) => {
                        inner.insert_orphan(orphan.tx, missing, orphan.time);
                    }
                    Err(err) => {
                        tracing::warn!(?err, "Dropping orphan {child}");
                    }
                }
            }
        }

        resolved
    }

    fn expire_orphans(&self, inner: &mut MemPoolInner, now: Instant) {
        let expired = inner
            .orphans
            .iter()
            .filter(|(_, orphan)| now.saturating_duration_since(orphan.time) >= ORPHAN_TTL)
            .map(|(txid, _)| *txid)
            .collect::<Vec<_>>();

        for txid in expired {
            tracing::trace!("Orphan {txid} expired");
            inner.remove_orphan(&txid);
        }
    }

    fn limit_orphans(&self, inner: &mut MemPoolInner) {
        while inner.orphans.len() > MAX_ORPHANS {
            let Some(oldest) = inner.orphans.keys().next().copied() else {
                break;
            };
            tracing::trace!("Evicting orphan {oldest}");
            inner.remove_orphan(&oldest);
        }
    }

    /// Removes the transactions of a committed block.
    ///
    /// Orphans waiting on a transaction of the block are replayed against the chain.
    pub fn remove(&self, block: &Block) {
        let mut inner = self.inner.write();

        let mut removed = 0usize;
        for tx in block.transactions() {
            let txid = tx.hash();
            if inner.remove_resolved(&txid) || inner.remove_orphan(&txid).is_some() {
                removed += 1;
            }
        }

        let resolved = block
            .transactions()
            .iter()
            .map(|tx| self.resolve_orphans(&mut inner, tx.hash()).len())
            .sum::<usize>();

        if removed > 0 || resolved > 0 {
            tracing::debug!(
                "Block {} removed {removed} transactions from mempool, {resolved} orphans resolved",
                block.hash()
            );
        }
    }

    pub fn has(&self, txid: &Hash256) -> bool {
        self.inner.read().contains(txid)
    }

    /// Returns a pooled transaction, orphan or not.
    pub fn get(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        let inner = self.inner.read();
        inner
            .transactions
            .get(txid)
            .map(|entry| entry.tx.clone())
            .or_else(|| inner.orphans.get(txid).map(|orphan| orphan.tx.clone()))
    }

    pub fn is_orphan(&self, txid: &Hash256) -> bool {
        self.inner.read().orphans.contains_key(txid)
    }

    /// Resolved transactions involving `address`, ordered by txid.
    pub fn history(&self, address: &str) -> Vec<Hash256> {
        self.inner.read().history(address)
    }

    /// Number of resolved transactions.
    pub fn len(&self) -> usize {
        self.inner.read().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn orphan_count(&self) -> usize {
        self.inner.read().orphans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_chain::Chain;
    use bitnode_primitives::{OutPoint, TxOut};
    use bitnode_storage::ChainStore;
    use bitnode_test_utils::{SUBSIDY, build_block, coinbase, p2pkh_script, spend};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockCoins(Mutex<HashMap<OutPoint, TxOut>>);

    impl MockCoins {
        fn add(&self, tx: &Transaction) {
            let mut coins = self.0.lock();
            for (index, output) in tx.outputs().iter().enumerate() {
                coins.insert(OutPoint::new(tx.hash(), index as u32), output.clone());
            }
        }
    }

    impl CoinsView for MockCoins {
        fn get_output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, MempoolError> {
            Ok(self.0.lock().get(outpoint).cloned())
        }
    }

    fn address(seed: u8) -> String {
        extract_addresses(&p2pkh_script(seed), Network::Mainnet).remove(0)
    }

    fn new_pool() -> (Arc<MockCoins>, MemPool) {
        let coins = Arc::new(MockCoins::default());
        let pool = MemPool::new(coins.clone(), Network::Mainnet);
        (coins, pool)
    }

    #[test]
    fn resolved_transaction_is_indexed() {
        let (coins, pool) = new_pool();
        let funding = coinbase(0, p2pkh_script(1));
        coins.add(&funding);

        let tx = spend(
            &[OutPoint::new(funding.hash(), 0)],
            vec![TxOut::new(SUBSIDY, p2pkh_script(2))],
        );
        assert_eq!(
            pool.add(tx.clone()).unwrap(),
            AddOutcome::Added {
                resolved_orphans: vec![]
            }
        );

        assert!(pool.has(&tx.hash()));
        assert_eq!(pool.get(&tx.hash()).as_deref(), Some(&tx));
        assert_eq!(pool.history(&address(1)), vec![tx.hash()]);
        assert_eq!(pool.history(&address(2)), vec![tx.hash()]);
        assert!(pool.history(&address(3)).is_empty());

        assert!(matches!(
            pool.add(tx),
            Err(MempoolError::AlreadyInMempool(_))
        ));
        assert!(matches!(
            pool.add(funding),
            Err(MempoolError::Coinbase(_))
        ));
    }

    #[test]
    fn orphan_is_resolved_by_its_parent() {
        let (coins, pool) = new_pool();
        let funding = coinbase(0, p2pkh_script(1));
        coins.add(&funding);

        let parent = spend(
            &[OutPoint::new(funding.hash(), 0)],
            vec![TxOut::new(SUBSIDY, p2pkh_script(2))],
        );
        let child = spend(
            &[OutPoint::new(parent.hash(), 0)],
            vec![TxOut::new(SUBSIDY, p2pkh_script(3))],
        );
        let grandchild = spend(
            &[OutPoint::new(child.hash(), 0)],
            vec![TxOut::new(SUBSIDY, p2pkh_script(4))],
        );

        assert_eq!(
            pool.add(grandchild.clone()).unwrap(),
            AddOutcome::Orphan {
                missing: vec![child.hash()]
            }
        );
        assert_eq!(
            pool.add(child.clone()).unwrap(),
            AddOutcome::Orphan {
                missing: vec![parent.hash()]
            }
        );

        assert!(pool.has(&child.hash()));
        assert!(pool.is_orphan(&child.hash()));
        assert!(pool.history(&address(3)).is_empty());
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.orphan_count(), 2);

        assert_eq!(
            pool.add(parent.clone()).unwrap(),
            AddOutcome::Added {
                resolved_orphans: vec![child.hash(), grandchild.hash()]
            }
        );

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.orphan_count(), 0);
        assert_eq!(pool.history(&address(3)), {
            let mut txids = vec![child.hash(), grandchild.hash()];
            txids.sort();
            txids
        });
        assert_eq!(pool.history(&address(4)), vec![grandchild.hash()]);
    }

    #[test]
    fn orphan_waits_for_all_parents() {
        let (_coins, pool) = new_pool();
        let a = spend(
            &[OutPoint::new(Hash256::double_sha256(b"x"), 0)],
            vec![TxOut::new(1, p2pkh_script(1))],
        );
        let b = spend(
            &[OutPoint::new(Hash256::double_sha256(b"y"), 0)],
            vec![TxOut::new(1, p2pkh_script(2))],
        );
        let child = spend(
            &[OutPoint::new(a.hash(), 0), OutPoint::new(b.hash(), 0)],
            vec![TxOut::new(2, p2pkh_script(3))],
        );

        assert!(matches!(
            pool.add(child.clone()).unwrap(),
            AddOutcome::Orphan { missing } if missing.len() == 2
        ));

        // `a` is an orphan itself, nothing resolves.
        pool.add(a).unwrap();
        assert!(pool.is_orphan(&child.hash()));
        assert_eq!(pool.orphan_count(), 2);
    }

    #[test]
    fn orphans_expire_and_are_capped() {
        let (_coins, pool) = new_pool();
        let start = Instant::now();

        let orphan = |seed: u32| {
            spend(
                &[OutPoint::new(Hash256::double_sha256(&seed.to_le_bytes()), 0)],
                vec![TxOut::new(1, p2pkh_script(1))],
            )
        };

        let first = orphan(0);
        pool.add_at(first.clone(), start).unwrap();
        pool.add_at(orphan(1), start + ORPHAN_TTL / 2).unwrap();
        assert_eq!(pool.orphan_count(), 2);

        pool.add_at(orphan(2), start + ORPHAN_TTL).unwrap();
        assert_eq!(pool.orphan_count(), 2);
        assert!(!pool.has(&first.hash()));

        let now = start + ORPHAN_TTL;
        for seed in 3..(MAX_ORPHANS as u32 + 10) {
            pool.add_at(orphan(seed), now).unwrap();
        }
        assert_eq!(pool.orphan_count(), MAX_ORPHANS);
        assert!(pool.inner.read().waiting_on.len() <= MAX_ORPHANS);
    }

    #[test]
    fn committed_block_clears_pool_and_resolves_orphans() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(temp_dir.path(), Network::Mainnet);
        store.connect().unwrap();
        let chain = Arc::new(Chain::new(Arc::new(store)));
        let pool = MemPool::new(chain.clone(), Network::Mainnet);

        let funding = coinbase(0, p2pkh_script(1));
        let block0 = build_block(Hash256::ZERO, vec![funding.clone()], 0);
        chain.add_block(block0.clone()).unwrap();

        let pooled = spend(
            &[OutPoint::new(funding.hash(), 0)],
            vec![TxOut::new(SUBSIDY - 1, p2pkh_script(2))],
        );
        assert!(matches!(pool.add(pooled.clone()).unwrap(), AddOutcome::Added { .. }));

        // Spends an output of a transaction only known once the next block commits.
        let confirmed = coinbase(1, p2pkh_script(5));
        let waiting = spend(
            &[OutPoint::new(confirmed.hash(), 0)],
            vec![TxOut::new(SUBSIDY, p2pkh_script(6))],
        );
        assert!(matches!(pool.add(waiting.clone()).unwrap(), AddOutcome::Orphan { .. }));

        let block1 = build_block(block0.hash(), vec![confirmed, pooled.clone()], 1);
        chain.add_block(block1.clone()).unwrap();
        pool.remove(&block1);

        assert!(!pool.has(&pooled.hash()));
        assert!(pool.history(&address(2)).is_empty());
        assert!(pool.has(&waiting.hash()));
        assert!(!pool.is_orphan(&waiting.hash()));
        assert_eq!(pool.history(&address(6)), vec![waiting.hash()]);
        assert_eq!(pool.len(), 1);
    }
}
