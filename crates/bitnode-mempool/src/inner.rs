//! Inner mempool state protected by the RwLock in [`crate::MemPool`].

use bitnode_primitives::{Hash256, OutPoint, Transaction, TxOut};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Transaction whose inputs are all resolved.
pub(crate) struct MemPoolEntry {
    pub(crate) tx: Arc<Transaction>,
    pub(crate) addresses: Vec<String>,
}

/// Transaction parked until the transactions it depends on arrive.
pub(crate) struct OrphanEntry {
    pub(crate) tx: Arc<Transaction>,
    /// Ids of the transactions still missing.
    pub(crate) missing: HashSet<Hash256>,
    pub(crate) time: Instant,
}

#[derive(Default)]
pub(crate) struct MemPoolInner {
    pub(crate) transactions: HashMap<Hash256, MemPoolEntry>,
    /// Orphans in arrival order.
    pub(crate) orphans: IndexMap<Hash256, OrphanEntry>,
    /// Missing dependency txid => orphans waiting on it.
    pub(crate) waiting_on: HashMap<Hash256, HashSet<Hash256>>,
    /// `(address, txid)` of every resolved transaction.
    pub(crate) addresses: BTreeSet<(String, Hash256)>,
}

impl MemPoolInner {
    pub(crate) fn contains(&self, txid: &Hash256) -> bool {
        self.transactions.contains_key(txid) || self.orphans.contains_key(txid)
    }

    /// Output created by a resolved mempool transaction.
    pub(crate) fn output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.transactions
            .get(&outpoint.txid)
            .and_then(|entry| entry.tx.outputs().get(outpoint.index as usize))
            .cloned()
    }

    pub(crate) fn insert_resolved(&mut self, tx: Arc<Transaction>, addresses: Vec<String>) {
        let txid = tx.hash();
        for address in &addresses {
            self.addresses.insert((address.clone(), txid));
        }
        self.transactions.insert(txid, MemPoolEntry { tx, addresses });
    }

    pub(crate) fn remove_resolved(&mut self, txid: &Hash256) -> bool {
        let Some(entry) = self.transactions.remove(txid) else {
            return false;
        };
        for address in entry.addresses {
            self.addresses.remove(&(address, *txid));
        }
        true
    }

    pub(crate) fn insert_orphan(
        &mut self,
        tx: Arc<Transaction>,
        missing: HashSet<Hash256>,
        time: Instant,
    ) {
        let txid = tx.hash();
        for dependency in &missing {
            self.waiting_on.entry(*dependency).or_default().insert(txid);
        }
        self.orphans.insert(txid, OrphanEntry { tx, missing, time });
    }

    pub(crate) fn remove_orphan(&mut self, txid: &Hash256) -> Option<OrphanEntry> {
        let orphan = self.orphans.shift_remove(txid)?;
        for dependency in &orphan.missing {
            if let Some(waiting) = self.waiting_on.get_mut(dependency) {
                waiting.remove(txid);
                if waiting.is_empty() {
                    self.waiting_on.remove(dependency);
                }
            }
        }
        Some(orphan)
    }

    /// Resolved transactions involving `address`.
    pub(crate) fn history(&self, address: &str) -> Vec<Hash256> {
        self.addresses
            .range((address.to_string(), Hash256::ZERO)..)
            .take_while(|(entry_address, _)| entry_address == address)
            .map(|(_, txid)| *txid)
            .collect()
    }
}
