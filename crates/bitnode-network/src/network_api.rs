//! This module provides the interfaces for external interaction with the bitnode network.

use crate::sync::{PeerSync, SyncShared, SyncState};
use bitnode_primitives::{Hash256, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, watch};

/// Represents the status of network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// The number of peers currently connected to the node.
    pub num_connected_peers: usize,
    /// The total number of bytes received from the network.
    pub total_bytes_inbound: u64,
    /// The total number of bytes sent to the network.
    pub total_bytes_outbound: u64,
    /// Current sync state of the node.
    pub sync_state: SyncState,
    /// Best block number agreed by the peers.
    pub best_number: u32,
}

/// Represents the result of submitting a transaction to the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SendTransactionResult {
    /// Transaction was accepted in the mempool and will be announced to the peers.
    Success(Hash256),
    /// An error occurred during the transaction submission.
    Failure(String),
}

/// Represents the different messages that can be sent to the network processor.
#[derive(Debug)]
pub(crate) enum NetworkProcessorMessage {
    /// Request the current network status.
    RequestNetworkStatus(oneshot::Sender<NetworkStatus>),
    /// Request the number of inbound connected peers.
    RequestInboundPeersCount(oneshot::Sender<usize>),
    /// Request a transaction being announced by this node.
    RequestTransaction(Hash256, oneshot::Sender<Option<Arc<Transaction>>>),
    /// Submit a local transaction.
    SendTransaction((Transaction, oneshot::Sender<SendTransactionResult>)),
}

/// A handle for interacting with the network processor.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub(crate) processor_msg_sender: UnboundedSender<NetworkProcessorMessage>,
    pub(crate) sync_shared: Arc<SyncShared>,
}

impl NetworkHandle {
    /// Provides high-level status information about network.
    ///
    /// Returns None if the `NetworkProcessor` is no longer running.
    pub async fn status(&self) -> Option<NetworkStatus> {
        let (sender, receiver) = oneshot::channel();

        self.processor_msg_sender
            .send(NetworkProcessorMessage::RequestNetworkStatus(sender))
            .ok()?;

        receiver.await.ok()
    }

    /// Returns the ready peers.
    pub fn sync_peers(&self) -> Vec<PeerSync> {
        self.sync_shared.sync_peers()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_shared.state()
    }

    /// Subscribes to the sync state changes.
    pub fn subscribe_sync_state(&self) -> watch::Receiver<SyncState> {
        self.sync_shared.subscribe_state()
    }

    /// Waits until at least one peer completed the handshake.
    ///
    /// Returns `false` if the network stopped before.
    pub async fn wait_connected(&self) -> bool {
        let mut receiver = self.sync_shared.subscribe_state();
        receiver
            .wait_for(|state| state.is_connected())
            .await
            .is_ok()
    }

    /// Best block number agreed by the majority of the peers.
    pub fn best_number(&self) -> u32 {
        self.sync_shared.best_number()
    }

    /// Retrieves a transaction announced by this node.
    pub async fn get_transaction(&self, txid: Hash256) -> Option<Arc<Transaction>> {
        let (sender, receiver) = oneshot::channel();

        if self
            .processor_msg_sender
            .send(NetworkProcessorMessage::RequestTransaction(txid, sender))
            .is_err()
        {
            return None;
        }

        receiver.await.ok().flatten()
    }

    /// Adds a transaction to the mempool and announces it to the network.
    pub async fn send_transaction(&self, transaction: Transaction) -> SendTransactionResult {
        let (sender, receiver) = oneshot::channel();

        let txid = transaction.hash();

        if self
            .processor_msg_sender
            .send(NetworkProcessorMessage::SendTransaction((transaction, sender)))
            .is_err()
        {
            return SendTransactionResult::Failure(format!(
                "Failed to send transaction ({txid}) to net processor"
            ));
        }

        receiver
            .await
            .unwrap_or(SendTransactionResult::Failure("Internal error".to_string()))
    }
}

/// bitnode network service interface.
#[async_trait::async_trait]
pub trait NetworkApi: Send + Sync {
    /// Whether the network instance is running.
    fn enabled(&self) -> bool;

    /// Provides high-level status information about network.
    ///
    /// Returns None if the `NetworkProcessor` is no longer running.
    async fn status(&self) -> Option<NetworkStatus>;

    /// Returns the ready peers.
    fn sync_peers(&self) -> Vec<PeerSync>;

    fn sync_state(&self) -> SyncState;

    /// Best block number agreed by the peers.
    fn best_number(&self) -> u32;

    /// Adds a transaction to the mempool and announces it to the network.
    async fn send_transaction(&self, transaction: Transaction) -> SendTransactionResult;
}

#[async_trait::async_trait]
impl NetworkApi for NetworkHandle {
    fn enabled(&self) -> bool {
        true
    }

    async fn status(&self) -> Option<NetworkStatus> {
        Self::status(self).await
    }

    fn sync_peers(&self) -> Vec<PeerSync> {
        Self::sync_peers(self)
    }

    fn sync_state(&self) -> SyncState {
        Self::sync_state(self)
    }

    fn best_number(&self) -> u32 {
        Self::best_number(self)
    }

    async fn send_transaction(&self, transaction: Transaction) -> SendTransactionResult {
        Self::send_transaction(self, transaction).await
    }
}

/// bitnode network disabled.
pub struct NoNetwork;

#[async_trait::async_trait]
impl NetworkApi for NoNetwork {
    fn enabled(&self) -> bool {
        false
    }

    async fn status(&self) -> Option<NetworkStatus> {
        None
    }

    fn sync_peers(&self) -> Vec<PeerSync> {
        Vec::new()
    }

    fn sync_state(&self) -> SyncState {
        SyncState::Disconnected
    }

    fn best_number(&self) -> u32 {
        0
    }

    async fn send_transaction(&self, _transaction: Transaction) -> SendTransactionResult {
        SendTransactionResult::Failure("Network service unavailable".to_string())
    }
}
