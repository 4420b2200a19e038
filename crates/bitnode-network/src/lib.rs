//! # Bitcoin Network
//!
//! This crate connects bitnode to the Bitcoin P2P network. It handles the connections, the
//! message transmission and the peer-to-peer protocol, and drives the block download.
//!
//! ## Sync
//!
//! The download is headers-first. Headers are requested from one peer at a time using
//! block locators, and the hashes they carry are queued. The queue is drained in fixed-size
//! windows, each window downloaded from a single peer. Several windows are in flight at
//! once, and the blocks are handed to the chain strictly in the order of the headers.
//!
//! Once the local tip reaches the height agreed by the majority of the peers, the node
//! follows the network through the blocks announced with `inv` messages.

mod address_book;
mod message;
mod network_api;
mod network_processor;
mod peer_connection;
mod peer_manager;
mod sync;
#[cfg(test)]
mod tests;
mod transaction_manager;

use crate::message::{Magic, ServiceFlags};
use crate::network_api::NetworkProcessorMessage;
use crate::network_processor::{Event, NetworkProcessor};
use crate::peer_connection::Connector;
use crate::sync::SyncShared;
use bitnode_chain::Chain;
use bitnode_mempool::MemPool;
use bitnode_primitives::{DecodeError, Hash256, Network};
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

pub use crate::network_api::{
    NetworkApi, NetworkHandle, NetworkStatus, NoNetwork, SendTransactionResult,
};
pub use crate::sync::{PeerSync, SyncState};

/// Identifies a peer.
pub type PeerId = SocketAddr;

/// Peer latency in milliseconds.
pub type Latency = u128;

/// Number of blocks requested from a peer at once.
pub const BLOCK_WINDOW_SIZE: usize = 16;

/// Network error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid seednode address: {0}")]
    InvalidSeednode(String),
    #[error("Received 0 bytes, peer performed an orderly shutdown")]
    PeerShutdown,
    #[error("Cannot communicate with the network event stream")]
    NetworkEventStreamError,
    #[error("Peer {0:?} not found")]
    PeerNotFound(PeerId),
    #[error("Connection of peer {0:?} not found")]
    ConnectionNotFound(PeerId),
    #[error("Connection of peer {0:?} is closed")]
    ConnectionClosed(PeerId),
    #[error("Connecting to the stream timed out")]
    ConnectionTimeout,
    #[error("Unexpected handshake state: {0:?}")]
    UnexpectedHandshakeState(Box<peer_manager::HandshakeState>),
    #[error("Handshake timeout")]
    HandshakeTimeout,
    #[error("Only IPv4 peers are supported")]
    Ipv4Only,
    #[error("Peer is not a full node")]
    NotFullNode,
    #[error("Peer's protocol version is too low")]
    ProtocolVersionTooLow,
    #[error("Connected to self")]
    SelfConnection,
    #[error("Peer's best block #{peer_best} is behind our best block #{our_best}")]
    PeerBehind { peer_best: u32, our_best: u32 },
    #[error("Network magic mismatch, expected {expected}, got {got}")]
    UnexpectedMagic { expected: Magic, got: Magic },
    #[error("Undecoded data of {0} bytes exceeds the maximum message size")]
    MessageTooLarge(usize),
    #[error("Too many entries (> 2000) in headers message")]
    TooManyHeaders,
    #[error("Header {0} does not connect to the previous header")]
    HeadersNotConnected(Hash256),
    #[error("Too many inventory items")]
    TooManyInventoryItems,
    #[error("Headers request timed out")]
    HeadersTimeout,
    #[error("Block download timed out")]
    BlockWindowTimeout,
    #[error("Block {0} does not extend the local chain")]
    UnconnectedBlock(Hash256),
    #[error("Ping timeout")]
    PingTimeout,
    #[error("Ping latency ({0}) exceeds the threshold")]
    PingLatencyTooHigh(Latency),
    #[error("Unexpected pong message")]
    UnexpectedPong,
    #[error("Bad nonce in pong, expected: {expected}, got: {got}")]
    BadPong { expected: u64, got: u64 },
    #[error("Block import failed: {0}")]
    BlockImport(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    InvalidAddress(#[from] AddrParseError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    BitcoinEncoding(#[from] bitcoin::consensus::encode::Error),
    #[error(transparent)]
    Chain(#[from] bitnode_chain::Error),
}

// Only full nodes can serve the blocks we download.
fn validate_outbound_services(services: ServiceFlags) -> Result<(), Error> {
    if !services.has(ServiceFlags::NETWORK) {
        return Err(Error::NotFullNode);
    }

    Ok(())
}

#[derive(Debug, Clone, Default)]
struct Bandwidth {
    total_bytes_inbound: Arc<AtomicU64>,
    total_bytes_outbound: Arc<AtomicU64>,
}

/// Network configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bitcoin network type.
    pub network: Network,
    /// Specify the local listen address.
    pub listen_on: PeerId,
    /// List of seednodes, `host:port`.
    pub seednodes: Vec<String>,
    /// Whether to connect to the seednodes only, skipping the DNS seeds.
    pub seednode_only: bool,
    /// Whether to accept the peer in ipv4 only.
    pub ipv4_only: bool,
    /// Maximum number of outbound peer connections.
    pub max_outbound_peers: usize,
    /// Maximum number of inbound peer connections.
    pub max_inbound_peers: usize,
    /// Maximum number of block windows downloaded concurrently.
    pub max_inflight_windows: usize,
}

impl Config {
    /// Default configuration for `network`.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            listen_on: SocketAddr::from(([0, 0, 0, 0], network.default_port())),
            seednodes: Vec::new(),
            seednode_only: false,
            ipv4_only: true,
            max_outbound_peers: 8,
            max_inbound_peers: 8,
            max_inflight_windows: 4,
        }
    }
}

async fn listen_for_inbound_connections(
    listener: TcpListener,
    max_inbound_peers: usize,
    connector: Connector,
    processor_msg_sender: UnboundedSender<NetworkProcessorMessage>,
) {
    match listener.local_addr() {
        Ok(local_addr) => tracing::info!("🔊 Listening on {local_addr:?}"),
        Err(err) => tracing::warn!(?err, "Local listen address unavailable"),
    }

    while let Ok((socket, peer_addr)) = listener.accept().await {
        let (sender, receiver) = oneshot::channel();

        if processor_msg_sender
            .send(NetworkProcessorMessage::RequestInboundPeersCount(sender))
            .is_err()
        {
            return;
        }

        let Ok(inbound_peers_count) = receiver.await else {
            return;
        };

        if inbound_peers_count < max_inbound_peers {
            tracing::debug!(?peer_addr, "New peer accepted");

            if let Err(err) = connector.accept(socket) {
                tracing::debug!(?err, ?peer_addr, "Failed to initiate inbound connection");
            }
        }
    }
}

async fn initialize_outbound_connections(
    network: Network,
    seednodes: Vec<String>,
    seednode_only: bool,
    network_event_sender: UnboundedSender<Event>,
) {
    let mut bootnodes = seednodes;

    if !seednode_only {
        bootnodes.extend(network.dns_seeds().iter().map(|s| s.to_string()));
    }

    let lookup_futures = bootnodes.into_iter().map(|bootnode| async move {
        tokio::net::lookup_host(&bootnode)
            .await
            .map(|addrs| (bootnode, addrs.collect::<Vec<_>>()))
    });

    let lookup_results = futures::future::join_all(lookup_futures).await;

    for result in lookup_results {
        match result {
            Ok((bootnode, addrs)) => {
                if addrs.is_empty() {
                    tracing::error!("{}", Error::InvalidSeednode(bootnode));
                    continue;
                }
                // A DNS seed resolves to many nodes, the ones not dialed now are kept for later.
                if network_event_sender.send(Event::SeedAddresses(addrs)).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!("Failed to perform seednode DNS lookup: {e}");
            }
        }
    }
}

/// Starts the bitnode network, returning a handle to it.
///
/// Must be called within a tokio runtime. The network runs until the runtime shuts down.
pub async fn build_network(
    chain: Arc<Chain>,
    mempool: Arc<MemPool>,
    config: Config,
) -> Result<NetworkHandle, Error> {
    let (processor_msg_sender, processor_msg_receiver) = tokio::sync::mpsc::unbounded_channel();

    let mut listen_on = config.listen_on;
    let listener = match TcpListener::bind(&listen_on).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::warn!("{listen_on} is occupied, trying any available port.");
            listen_on.set_port(0);
            TcpListener::bind(listen_on).await?
        }
        Err(err) => return Err(err.into()),
    };

    let (network_event_sender, network_event_receiver) = tokio::sync::mpsc::unbounded_channel();

    let bandwidth = Bandwidth::default();

    let connector = Connector::new(
        config.network,
        network_event_sender.clone(),
        bandwidth.clone(),
        config.ipv4_only,
    );

    let sync_shared = Arc::new(SyncShared::new());

    let Config {
        seednode_only,
        seednodes,
        network,
        max_inbound_peers,
        max_outbound_peers,
        max_inflight_windows,
        ipv4_only,
        ..
    } = config;

    let network_handle = NetworkHandle {
        processor_msg_sender: processor_msg_sender.clone(),
        sync_shared: sync_shared.clone(),
    };

    let processor = NetworkProcessor::new(network_processor::Params {
        chain,
        mempool,
        network_event_receiver,
        network_event_sender: network_event_sender.clone(),
        connector: connector.clone(),
        sync_shared,
        max_outbound_peers,
        max_inflight_windows,
        ipv4_only,
    });

    tokio::spawn(processor.run(processor_msg_receiver, bandwidth));

    tokio::spawn(listen_for_inbound_connections(
        listener,
        max_inbound_peers,
        connector,
        processor_msg_sender,
    ));

    tokio::spawn(initialize_outbound_connections(
        network,
        seednodes,
        seednode_only,
        network_event_sender,
    ));

    Ok(network_handle)
}
