use crate::PeerId;
use bitnode_primitives::{Hash256, Transaction};
use indexmap::IndexMap;
use indexmap::map::Entry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TRANSACTION_TIMEOUT_DURATION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct TransactionInfo {
    /// The actual transaction to be sent to the network.
    transaction: Arc<Transaction>,
    /// Set of peers to which we advertised this transaction.
    ///
    /// Having a peer in this set doesn't guarantee the peer actually received the transaction.
    advertised: HashSet<PeerId>,
    /// Time after which the transaction is no longer announced.
    expires_at: Instant,
}

impl TransactionInfo {
    fn new(transaction: Arc<Transaction>, now: Instant) -> Self {
        Self {
            transaction,
            advertised: HashSet::new(),
            expires_at: now + TRANSACTION_TIMEOUT_DURATION,
        }
    }
}

/// Local transactions announced to the connected peers.
#[derive(Debug, Default)]
pub(crate) struct TransactionManager {
    /// Transactions tracked by this manager, in the FIFO order.
    transactions: IndexMap<Hash256, TransactionInfo>,
}

impl TransactionManager {
    /// Maximum number of transactions the manager holds.
    const MAX_TRANSACTIONS: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transaction ids each connected peer has not been told about yet.
    pub fn on_tick<'a>(
        &mut self,
        connected_peers: impl Iterator<Item = &'a PeerId>,
    ) -> Vec<(PeerId, Vec<Hash256>)> {
        self.on_tick_at(connected_peers, Instant::now())
    }

    fn on_tick_at<'a>(
        &mut self,
        connected_peers: impl Iterator<Item = &'a PeerId>,
        now: Instant,
    ) -> Vec<(PeerId, Vec<Hash256>)> {
        self.transactions.retain(|txid, info| {
            if info.expires_at <= now {
                tracing::debug!("Removing timeout transaction {txid}");
                false
            } else {
                true
            }
        });

        connected_peers
            .filter_map(|address| {
                let mut to_advertise = vec![];

                for (txid, info) in self.transactions.iter_mut() {
                    if info.advertised.insert(*address) {
                        to_advertise.push(*txid);
                    }
                }

                if to_advertise.is_empty() {
                    None
                } else {
                    Some((*address, to_advertise))
                }
            })
            .collect()
    }

    pub fn get_transaction(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        self.transactions
            .get(txid)
            .map(|tx_info| tx_info.transaction.clone())
    }

    /// Starts announcing `transaction`, returns its id.
    pub fn add_transaction(&mut self, transaction: Arc<Transaction>) -> Hash256 {
        self.add_transaction_at(transaction, Instant::now())
    }

    fn add_transaction_at(&mut self, transaction: Arc<Transaction>, now: Instant) -> Hash256 {
        let txid = transaction.hash();

        match self.transactions.entry(txid) {
            Entry::Occupied(_) => {
                tracing::debug!("Tx {txid} already exists");
            }
            Entry::Vacant(entry) => {
                entry.insert(TransactionInfo::new(transaction, now));
                tracing::debug!("Added new tx {txid}");
            }
        }

        if self.transactions.len() > Self::MAX_TRANSACTIONS {
            self.transactions.shift_remove_index(0);
        }

        txid
    }
}
