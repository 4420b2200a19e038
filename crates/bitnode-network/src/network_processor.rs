use crate::message::{
    GetHeadersMessage, Inventory, MAX_ADDR_SIZE, MAX_INV_SIZE, NetworkMessage, from_bitcoin,
    to_bitcoin,
};
use crate::network_api::{NetworkProcessorMessage, NetworkStatus, SendTransactionResult};
use crate::peer_connection::{Connector, Direction, NewConnection};
use crate::peer_manager::{PEER_LATENCY_THRESHOLD, PROTOCOL_VERSION, PeerManager};
use crate::sync::{
    ImportedBlocks, LocatorRequest, SyncAction, SyncManager, SyncRequest, SyncShared,
    import_blocks,
};
use crate::transaction_manager::TransactionManager;
use crate::{Bandwidth, Error, PeerId};
use bitnode_chain::Chain;
use bitnode_mempool::{AddOutcome, MemPool};
use bitnode_primitives::{Block, BlockHeader, Hash256, Transaction};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::MissedTickBehavior;

/// Interval at which we perform time based maintenance
const TICK_TIMEOUT: Duration = Duration::from_millis(1100);

/// Network event.
#[derive(Debug)]
pub enum Event {
    /// A new TCP stream was opened.
    NewConnection(NewConnection),
    /// Failed to make a connection to the given outbound peer.
    OutboundConnectionFailure { peer_addr: PeerId, reason: Error },
    /// TCP connection was closed, either properly or abruptly.
    DisconnectPeer { peer_addr: PeerId, reason: Error },
    /// New Bitcoin p2p network message received from the peer.
    PeerMessage {
        from: PeerId,
        direction: Direction,
        payload: NetworkMessage,
    },
    /// Addresses of the seednodes and DNS seeds.
    SeedAddresses(Vec<PeerId>),
    /// A batch of blocks went through the chain.
    BlocksImported(ImportedBlocks),
}

impl Event {
    /// Constructs a [`Event::DisconnectPeer`] variant.
    pub fn disconnect(peer_addr: PeerId, reason: Error) -> Self {
        Self::DisconnectPeer { peer_addr, reason }
    }
}

/// Parameters for creating a [`NetworkProcessor`].
pub struct Params {
    pub chain: Arc<Chain>,
    pub mempool: Arc<MemPool>,
    pub network_event_receiver: UnboundedReceiver<Event>,
    pub network_event_sender: UnboundedSender<Event>,
    pub connector: Connector,
    pub sync_shared: Arc<SyncShared>,
    pub max_outbound_peers: usize,
    pub max_inflight_windows: usize,
    pub ipv4_only: bool,
}

/// [`NetworkProcessor`] is responsible for processing the network events.
pub struct NetworkProcessor {
    chain: Arc<Chain>,
    mempool: Arc<MemPool>,
    sync_manager: SyncManager,
    peer_manager: PeerManager,
    transaction_manager: TransactionManager,
    network_event_receiver: UnboundedReceiver<Event>,
}

impl NetworkProcessor {
    /// Constructs a new instance of [`NetworkProcessor`].
    ///
    /// Spawns the block import task, must be called within a tokio runtime.
    pub fn new(params: Params) -> Self {
        let Params {
            chain,
            mempool,
            network_event_receiver,
            network_event_sender,
            connector,
            sync_shared,
            max_outbound_peers,
            max_inflight_windows,
            ipv4_only,
        } = params;

        let (import_sender, import_receiver) = unbounded_channel();

        tokio::spawn(import_blocks(
            chain.clone(),
            import_receiver,
            network_event_sender,
        ));

        let peer_manager =
            PeerManager::new(chain.clone(), connector, max_outbound_peers, ipv4_only);

        let sync_manager = SyncManager::new(
            chain.clone(),
            sync_shared,
            max_inflight_windows,
            import_sender,
        );

        Self {
            chain,
            mempool,
            sync_manager,
            peer_manager,
            transaction_manager: TransactionManager::new(),
            network_event_receiver,
        }
    }

    /// The main loop for processing network events.
    ///
    /// Runs until the network event stream is closed.
    pub(crate) async fn run(
        mut self,
        mut processor_msg_receiver: UnboundedReceiver<NetworkProcessorMessage>,
        bandwidth: Bandwidth,
    ) {
        let mut tick_timeout = {
            let mut interval = tokio::time::interval(TICK_TIMEOUT);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        };

        loop {
            tokio::select! {
                maybe_event = self.network_event_receiver.recv() => {
                    let Some(event) = maybe_event else {
                        return;
                    };
                    self.handle_event(event);
                }
                Some(processor_msg) = processor_msg_receiver.recv() => {
                    self.handle_processor_message(processor_msg, &bandwidth);
                }
                _ = tick_timeout.tick() => {
                    self.execute_periodic_tasks();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::NewConnection(new_connection) => {
                self.peer_manager.on_new_connection(new_connection);
            }
            Event::OutboundConnectionFailure { peer_addr, reason } => {
                self.peer_manager
                    .on_outbound_connection_failure(peer_addr, reason);
            }
            Event::DisconnectPeer { peer_addr, reason } => {
                self.disconnect(peer_addr, reason);
            }
            Event::PeerMessage {
                from,
                direction,
                payload,
            } => self.process_peer_message(from, direction, payload),
            Event::SeedAddresses(addresses) => {
                self.peer_manager.add_seeds(addresses);
            }
            Event::BlocksImported(imported_blocks) => {
                let result = self.sync_manager.on_blocks_imported(imported_blocks);
                self.handle_sync_result(result);
            }
        }
    }

    fn process_peer_message(&mut self, from: PeerId, direction: Direction, payload: NetworkMessage) {
        let msg_cmd = payload.cmd().to_string();

        tracing::trace!(?from, "Recv {msg_cmd}");

        match self.process_network_message(from, direction, payload) {
            Ok(action) => self.do_sync_action(action),
            Err(err) => {
                tracing::error!(?from, ?err, "Failed to process peer message: {msg_cmd}");
            }
        }
    }

    fn execute_periodic_tasks(&mut self) {
        if self.peer_manager.has_connection_activity() {
            self.sync_manager.set_connecting();
        }

        let result = self.sync_manager.on_tick();
        self.handle_sync_result(result);

        for (peer_id, reason) in self.peer_manager.on_tick() {
            self.disconnect(peer_id, reason);
        }

        let connected_peers = self.peer_manager.connected_peers();

        for (peer, txids) in self.transaction_manager.on_tick(connected_peers) {
            tracing::debug!("Broadcasting transaction IDs {txids:?} to {peer:?}");
            let msg = NetworkMessage::Inv(
                txids
                    .into_iter()
                    .map(|txid| Inventory::Transaction(txid.into()))
                    .collect(),
            );
            if let Err(err) = self.send(peer, msg) {
                self.disconnect(peer, err);
            }
        }
    }

    fn handle_processor_message(
        &mut self,
        processor_msg: NetworkProcessorMessage,
        bandwidth: &Bandwidth,
    ) {
        match processor_msg {
            NetworkProcessorMessage::RequestNetworkStatus(result_sender) => {
                let net_status = NetworkStatus {
                    num_connected_peers: self.peer_manager.connected_peers_count(),
                    total_bytes_inbound: bandwidth.total_bytes_inbound.load(Ordering::Relaxed),
                    total_bytes_outbound: bandwidth.total_bytes_outbound.load(Ordering::Relaxed),
                    sync_state: self.sync_manager.state(),
                    best_number: self.sync_manager.best_number(),
                };
                let _ = result_sender.send(net_status);
            }
            NetworkProcessorMessage::RequestInboundPeersCount(result_sender) => {
                let _ = result_sender.send(self.peer_manager.inbound_peers_count());
            }
            NetworkProcessorMessage::RequestTransaction(txid, result_sender) => {
                let _ = result_sender.send(self.transaction_manager.get_transaction(&txid));
            }
            NetworkProcessorMessage::SendTransaction((transaction, result_sender)) => {
                let send_transaction_result = self.submit_transaction(transaction);
                let _ = result_sender.send(send_transaction_result);
            }
        }
    }

    /// Adds a local transaction to the mempool, it's announced on the next tick.
    fn submit_transaction(&mut self, transaction: Transaction) -> SendTransactionResult {
        let txid = transaction.hash();

        match self.mempool.add(transaction.clone()) {
            Ok(AddOutcome::Added { resolved_orphans }) => {
                self.transaction_manager
                    .add_transaction(Arc::new(transaction));
                for orphan in resolved_orphans {
                    if let Some(orphan) = self.mempool.get(&orphan) {
                        self.transaction_manager.add_transaction(orphan);
                    }
                }
                SendTransactionResult::Success(txid)
            }
            Ok(AddOutcome::Orphan { missing }) => SendTransactionResult::Failure(format!(
                "Transaction {txid} spends unknown transactions: {missing:?}"
            )),
            Err(err) => SendTransactionResult::Failure(err.to_string()),
        }
    }

    // Ref https://github.com/bitcoin/bitcoin/blob/ac19235818e220108cf44932194af12ef6e1be8b/src/net_processing.cpp#L3382
    fn process_network_message(
        &mut self,
        from: PeerId,
        direction: Direction,
        message: NetworkMessage,
    ) -> Result<SyncAction, Error> {
        // Only the handshake is accepted from a peer that is not ready.
        if !matches!(message, NetworkMessage::Version(_) | NetworkMessage::Verack)
            && !self.peer_manager.is_connected(from)
        {
            tracing::debug!(?from, "Ignored {} before handshake", message.cmd());
            return Ok(SyncAction::None);
        }

        match message {
            NetworkMessage::Version(version_message) => {
                if let Err(err) = self
                    .peer_manager
                    .on_version(from, direction, version_message)
                {
                    self.disconnect(from, err);
                }
                Ok(SyncAction::None)
            }
            NetworkMessage::Verack => {
                if self.peer_manager.is_connected(from) {
                    tracing::debug!(?from, "Ignoring redundant verack");
                    return Ok(SyncAction::None);
                }
                match self.peer_manager.on_verack(from, direction) {
                    Ok(new_peer) => self.sync_manager.add_new_peer(new_peer),
                    Err(err) => {
                        self.disconnect(from, err);
                        Ok(SyncAction::None)
                    }
                }
            }
            NetworkMessage::Addr(addresses) => {
                if addresses.len() > MAX_ADDR_SIZE {
                    return Ok(SyncAction::Disconnect(from, Error::TooManyInventoryItems));
                }
                self.peer_manager.on_addr(from, addresses);
                Ok(SyncAction::None)
            }
            NetworkMessage::GetAddr => {
                self.send(from, NetworkMessage::Addr(Vec::new()))?;
                Ok(SyncAction::None)
            }
            NetworkMessage::Tx(tx) => match from_bitcoin::<Transaction>(&tx) {
                Ok(tx) => {
                    self.process_transaction(from, tx);
                    Ok(SyncAction::None)
                }
                Err(err) => Ok(SyncAction::Disconnect(from, err)),
            },
            NetworkMessage::GetData(inv) => {
                self.process_get_data(from, inv)?;
                Ok(SyncAction::None)
            }
            NetworkMessage::GetHeaders(get_headers) => {
                self.process_get_headers(from, get_headers)?;
                Ok(SyncAction::None)
            }
            NetworkMessage::Ping(nonce) => {
                self.send(from, NetworkMessage::Pong(nonce))?;
                Ok(SyncAction::None)
            }
            NetworkMessage::Pong(nonce) => {
                self.process_pong(from, nonce);
                Ok(SyncAction::None)
            }
            NetworkMessage::Inv(inv) => self.process_inv(from, inv),
            NetworkMessage::Block(block) => match from_bitcoin::<Block>(&block) {
                Ok(block) => self.sync_manager.on_block(block, from),
                Err(err) => Ok(SyncAction::Disconnect(from, err)),
            },
            NetworkMessage::Headers(headers) => {
                let headers = headers
                    .iter()
                    .map(from_bitcoin::<BlockHeader>)
                    .collect::<Result<Vec<_>, _>>();
                match headers {
                    Ok(headers) => self.sync_manager.on_headers(headers, from),
                    Err(err) => Ok(SyncAction::Disconnect(from, err)),
                }
            }
            NetworkMessage::NotFound(inv) => {
                tracing::debug!(?from, "Peer does not have {inv:?}");
                Ok(SyncAction::None)
            }
            NetworkMessage::Unknown { command, .. } => {
                tracing::trace!(?from, "Skipped unknown message {command}");
                Ok(SyncAction::None)
            }
            other => {
                tracing::trace!(?from, "Ignored {}", other.cmd());
                Ok(SyncAction::None)
            }
        }
    }

    fn process_pong(&mut self, from: PeerId, nonce: u64) {
        match self.peer_manager.on_pong(from, nonce) {
            Ok(avg_latency) => {
                // Disconnect the peer directly if the latency is higher than the threshold.
                if avg_latency > PEER_LATENCY_THRESHOLD {
                    self.disconnect(from, Error::PingLatencyTooHigh(avg_latency));
                } else {
                    self.sync_manager.update_peer_latency(from, avg_latency);
                }
            }
            Err(err) => {
                self.disconnect(from, err);
            }
        }
    }

    fn process_transaction(&mut self, from: PeerId, tx: Transaction) {
        let txid = tx.hash();

        match self.mempool.add(tx) {
            Ok(AddOutcome::Added { resolved_orphans }) => {
                tracing::debug!(
                    ?from,
                    "Added transaction {txid} to mempool, resolving {} orphans",
                    resolved_orphans.len()
                );
            }
            Ok(AddOutcome::Orphan { missing }) => {
                tracing::debug!(?from, "Transaction {txid} is an orphan, missing {missing:?}");
            }
            Err(err) => {
                tracing::debug!(?from, ?err, "Failed to add transaction {txid}");
            }
        }
    }

    fn process_inv(&mut self, from: PeerId, inv: Vec<Inventory>) -> Result<SyncAction, Error> {
        if inv.len() > MAX_INV_SIZE {
            return Ok(SyncAction::Disconnect(from, Error::TooManyInventoryItems));
        }

        let mut block_hashes = Vec::new();
        let mut wanted_transactions = Vec::new();

        for item in inv {
            match item {
                Inventory::Block(block_hash) | Inventory::WitnessBlock(block_hash) => {
                    block_hashes.push(Hash256::from(block_hash));
                }
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    if !self.mempool.has(&Hash256::from(txid)) {
                        wanted_transactions.push(Inventory::Transaction(txid));
                    }
                }
                _ => {}
            }
        }

        let block_request = if block_hashes.is_empty() {
            SyncAction::None
        } else {
            self.sync_manager.on_block_inv(block_hashes, from)?
        };

        if wanted_transactions.is_empty() {
            return Ok(block_request);
        }

        Ok(SyncAction::Multiple(vec![
            block_request,
            SyncAction::Request(SyncRequest::Data(wanted_transactions, from)),
        ]))
    }

    fn process_get_data(&self, from: PeerId, get_data_requests: Vec<Inventory>) -> Result<(), Error> {
        let mut not_found = Vec::new();

        for inv in get_data_requests {
            match inv {
                Inventory::Block(block_hash) | Inventory::WitnessBlock(block_hash) => {
                    match self.chain.get_block(&block_hash.into())? {
                        Some(block) => self.send(from, NetworkMessage::Block(to_bitcoin(&block)?))?,
                        None => not_found.push(inv),
                    }
                }
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    tracing::debug!("Recv transaction request: {txid:?} from {from:?}");
                    let txid = Hash256::from(txid);
                    let transaction = self
                        .mempool
                        .get(&txid)
                        .or_else(|| self.transaction_manager.get_transaction(&txid));
                    match transaction {
                        Some(transaction) => {
                            self.send(from, NetworkMessage::Tx(to_bitcoin(&*transaction)?))?
                        }
                        None => not_found.push(inv),
                    }
                }
                _ => {}
            }
        }

        if !not_found.is_empty() {
            self.send(from, NetworkMessage::NotFound(not_found))?;
        }

        Ok(())
    }

    fn process_get_headers(
        &self,
        from: PeerId,
        get_headers: GetHeadersMessage,
    ) -> Result<(), Error> {
        let locator_hashes = get_headers
            .locator_hashes
            .into_iter()
            .map(Hash256::from)
            .collect::<Vec<_>>();

        let headers = self
            .chain
            .locate_headers(&locator_hashes, &get_headers.stop_hash.into())?
            .iter()
            .map(to_bitcoin)
            .collect::<Result<Vec<_>, _>>()?;

        self.send(from, NetworkMessage::Headers(headers))
    }

    fn handle_sync_result(&mut self, result: Result<SyncAction, Error>) {
        match result {
            Ok(action) => self.do_sync_action(action),
            Err(err) => tracing::error!(?err, "Sync error"),
        }
    }

    fn do_sync_action(&mut self, sync_action: SyncAction) {
        match sync_action {
            SyncAction::Request(sync_request) => match sync_request {
                SyncRequest::Headers(request) => {
                    let LocatorRequest {
                        locator_hashes,
                        stop_hash,
                        to,
                    } = request;

                    if !locator_hashes.is_empty() {
                        let msg = GetHeadersMessage {
                            version: PROTOCOL_VERSION,
                            locator_hashes: locator_hashes.into_iter().map(Into::into).collect(),
                            stop_hash: stop_hash.into(),
                        };
                        if let Err(err) = self.send(to, NetworkMessage::GetHeaders(msg)) {
                            self.disconnect(to, err);
                        }
                    }
                }
                SyncRequest::Data(invs, to) => {
                    if !invs.is_empty() {
                        if let Err(err) = self.send(to, NetworkMessage::GetData(invs)) {
                            self.disconnect(to, err);
                        }
                    }
                }
            },
            SyncAction::Disconnect(peer_id, reason) => {
                self.disconnect(peer_id, reason);
            }
            SyncAction::Multiple(actions) => {
                for action in actions {
                    self.do_sync_action(action);
                }
            }
            SyncAction::None => {}
        }
    }

    fn disconnect(&mut self, peer_id: PeerId, reason: Error) {
        self.peer_manager.disconnect(peer_id, reason);
        let action = self.sync_manager.disconnect(peer_id);
        self.do_sync_action(action);
    }

    /// Send a network message to given peer.
    #[inline]
    fn send(&self, peer_id: PeerId, network_message: NetworkMessage) -> Result<(), Error> {
        self.peer_manager.send(peer_id, network_message)
    }
}
