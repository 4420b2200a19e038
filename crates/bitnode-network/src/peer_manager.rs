use crate::address_book::AddressBook;
use crate::message::{Address, NetworkMessage, ServiceFlags, VersionMessage};
use crate::peer_connection::{
    ConnectionCloser, ConnectionWriter, Connector, Direction, NewConnection,
};
use crate::{Error, Latency, PeerId, validate_outbound_services};
use bitnode_chain::Chain;
use chrono::prelude::Local;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum number of available addresses in the address book.
const MAX_AVAILABLE_ADDRESSES: usize = 2000;

/// Peer-to-peer protocol version.
pub const PROTOCOL_VERSION: u32 = 70016;

/// Oldest protocol version we talk to, the first one with `sendheaders`.
pub const MIN_PROTOCOL_VERSION: u32 = 70012;

/// Average ping latency in milliseconds above which a peer is dropped.
pub const PEER_LATENCY_THRESHOLD: Latency = 2000;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(120);
const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Services we offer.
const LOCAL_SERVICES: ServiceFlags = ServiceFlags::NONE;

fn user_agent() -> String {
    format!("/bitnode:{}/", env!("CARGO_PKG_VERSION"))
}

struct Connection {
    local_addr: PeerId,
    direction: Direction,
    writer: ConnectionWriter,
    closer: ConnectionCloser,
}

/// A peer that completed the handshake.
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub peer_id: PeerId,
    pub best_number: u32,
    pub direction: Direction,
}

/// Where a connection is in the version handshake.
///
/// We speak first on outbound connections: our `version`, their `version`, their
/// `verack`, then our `verack`. On inbound connections the peer speaks first and we
/// answer its `version` with ours and a `verack` right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingVersion,
    VersionSent,
    AwaitingVerack(Box<VersionMessage>),
}

#[derive(Debug)]
struct Handshake {
    state: HandshakeState,
    started_at: Instant,
    /// Nonce of the `version` we sent on this connection.
    local_nonce: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum PingState {
    Idle { since: Instant },
    AwaitingPong { nonce: u64, sent_at: Instant },
}

#[derive(Debug)]
struct PeerInfo {
    direction: Direction,
    ping: PingState,
    pongs: u64,
    total_latency: Latency,
}

impl PeerInfo {
    fn record_latency(&mut self, latency: Latency) -> Latency {
        self.pongs = self.pongs.saturating_add(1);
        self.total_latency = self.total_latency.saturating_add(latency);
        self.total_latency / self.pongs as u128
    }
}

/// Connections, handshakes and liveness of the peers.
pub struct PeerManager {
    chain: Arc<Chain>,
    address_book: AddressBook,
    connections: HashMap<PeerId, Connection>,
    handshakes: HashMap<PeerId, Handshake>,
    connected_peers: HashMap<PeerId, PeerInfo>,
    /// Outbound connections being opened.
    pending_dials: HashSet<PeerId>,
    max_outbound_peers: usize,
    connector: Connector,
    rng: fastrand::Rng,
}

impl PeerManager {
    pub(crate) fn new(
        chain: Arc<Chain>,
        connector: Connector,
        max_outbound_peers: usize,
        ipv4_only: bool,
    ) -> Self {
        Self {
            chain,
            address_book: AddressBook::new(ipv4_only, MAX_AVAILABLE_ADDRESSES),
            connections: HashMap::new(),
            handshakes: HashMap::new(),
            connected_peers: HashMap::new(),
            pending_dials: HashSet::new(),
            max_outbound_peers,
            connector,
            rng: fastrand::Rng::new(),
        }
    }

    /// Sends the due pings and refills the outbound pool.
    ///
    /// Returns the peers that must be disconnected.
    pub(crate) fn on_tick(&mut self) -> Vec<(PeerId, Error)> {
        let mut to_disconnect = vec![];
        let mut due_pings = vec![];

        for (peer_id, peer) in &self.connected_peers {
            match peer.ping {
                PingState::AwaitingPong { sent_at, .. } if sent_at.elapsed() >= PING_TIMEOUT => {
                    to_disconnect.push((*peer_id, Error::PingTimeout));
                }
                PingState::Idle { since } if since.elapsed() >= PING_INTERVAL => {
                    due_pings.push(*peer_id);
                }
                _ => {}
            }
        }

        to_disconnect.extend(
            self.handshakes
                .iter()
                .filter(|(_, handshake)| handshake.started_at.elapsed() > HANDSHAKE_TIMEOUT)
                .map(|(peer_id, _)| (*peer_id, Error::HandshakeTimeout)),
        );

        for peer_id in due_pings {
            self.ping(peer_id);
        }

        self.manage_outbound_connections();

        to_disconnect
    }

    /// Dials new addresses until the outbound pool is full.
    pub(crate) fn manage_outbound_connections(&mut self) {
        let outbound = self
            .connections
            .values()
            .filter(|connection| connection.direction.is_outbound())
            .count()
            + self.pending_dials.len();

        for _ in outbound..self.max_outbound_peers {
            let Some(addr) = self.address_book.pop() else {
                break;
            };
            if self.connections.contains_key(&addr) || !self.pending_dials.insert(addr) {
                continue;
            }
            tracing::trace!("Dialing {addr:?}");
            self.connector.dial(addr);
        }
    }

    /// Whether a connection is open or being opened.
    pub(crate) fn has_connection_activity(&self) -> bool {
        !self.connections.is_empty() || !self.pending_dials.is_empty()
    }

    fn ping(&mut self, peer_id: PeerId) {
        let nonce = self.rng.u64(..);
        if let Some(peer) = self.connected_peers.get_mut(&peer_id) {
            peer.ping = PingState::AwaitingPong {
                nonce,
                sent_at: Instant::now(),
            };
            let _ = self.send(peer_id, NetworkMessage::Ping(nonce));
        }
    }

    pub(crate) fn send(&self, peer_id: PeerId, network_message: NetworkMessage) -> Result<(), Error> {
        self.connections
            .get(&peer_id)
            .ok_or(Error::ConnectionNotFound(peer_id))?
            .writer
            .send(network_message)
            .map_err(|_| Error::ConnectionClosed(peer_id))
    }

    pub(crate) fn add_seeds(&mut self, seeds: Vec<PeerId>) {
        let added = self.address_book.add_seeds(seeds);
        tracing::debug!("Added {added} seed addresses");
        self.manage_outbound_connections();
    }

    pub(crate) fn on_outbound_connection_failure(&mut self, addr: PeerId, err: Error) {
        tracing::debug!(?err, "Failed to connect to {addr:?}");
        self.pending_dials.remove(&addr);
        self.address_book.note_failed_address(addr);
    }

    /// Closes the connection and forgets everything about the peer.
    ///
    /// The sync state must be notified of the disconnection separately.
    pub(crate) fn disconnect(&mut self, peer_id: PeerId, reason: Error) {
        if let Some(connection) = self.connections.remove(&peer_id) {
            tracing::debug!(?reason, "💔 Disconnecting peer {peer_id:?}");
            connection.closer.terminate();
        }

        self.address_book.mark_disconnected(&peer_id);
        self.pending_dials.remove(&peer_id);
        self.handshakes.remove(&peer_id);
        self.connected_peers.remove(&peer_id);
    }

    /// Whether the peer completed the handshake.
    pub(crate) fn is_connected(&self, peer_id: PeerId) -> bool {
        self.connected_peers.contains_key(&peer_id)
    }

    pub(crate) fn connected_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.connected_peers.keys()
    }

    pub(crate) fn connected_peers_count(&self) -> usize {
        self.connected_peers.len()
    }

    pub(crate) fn inbound_peers_count(&self) -> usize {
        self.connected_peers
            .values()
            .filter(|peer| peer.direction.is_inbound())
            .count()
    }

    fn is_local_nonce(&self, nonce: u64) -> bool {
        self.handshakes
            .values()
            .any(|handshake| handshake.local_nonce == Some(nonce))
    }

    fn version_message(&self, peer_addr: PeerId, local_addr: PeerId, nonce: u64) -> VersionMessage {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: LOCAL_SERVICES,
            timestamp: Local::now().timestamp(),
            receiver: Address::new(&peer_addr, ServiceFlags::NONE),
            sender: Address::new(&local_addr, LOCAL_SERVICES),
            nonce,
            user_agent: user_agent(),
            start_height: self.chain.best_number().unwrap_or_default() as i32,
            relay: true,
        }
    }

    /// Registers a new connection, opening the handshake on the outbound ones.
    pub(crate) fn on_new_connection(&mut self, new_connection: NewConnection) {
        let NewConnection {
            peer_addr,
            local_addr,
            direction,
            writer,
            closer,
        } = new_connection;

        self.pending_dials.remove(&peer_addr);

        let mut handshake = Handshake {
            state: HandshakeState::AwaitingVersion,
            started_at: Instant::now(),
            local_nonce: None,
        };

        if direction.is_outbound() {
            let nonce = self.rng.u64(..);
            let version = self.version_message(peer_addr, local_addr, nonce);
            if writer.send(NetworkMessage::Version(version)).is_err() {
                tracing::debug!(?peer_addr, "Connection closed before the handshake");
                closer.terminate();
                return;
            }
            handshake.state = HandshakeState::VersionSent;
            handshake.local_nonce.replace(nonce);
        }

        self.connections.insert(
            peer_addr,
            Connection {
                local_addr,
                direction,
                writer,
                closer,
            },
        );
        self.handshakes.insert(peer_addr, handshake);
    }

    pub(crate) fn on_version(
        &mut self,
        peer_id: PeerId,
        direction: Direction,
        version: VersionMessage,
    ) -> Result<(), Error> {
        tracing::debug!(
            version = version.version,
            user_agent = version.user_agent,
            start_height = version.start_height,
            "Received version from {peer_id:?}"
        );

        if version.version < MIN_PROTOCOL_VERSION {
            return Err(Error::ProtocolVersionTooLow);
        }

        if self.is_local_nonce(version.nonce) {
            return Err(Error::SelfConnection);
        }

        if direction.is_outbound() {
            validate_outbound_services(version.services)?;
        }

        let local_addr = self
            .connections
            .get(&peer_id)
            .ok_or(Error::ConnectionNotFound(peer_id))?
            .local_addr;

        let expected = match direction {
            Direction::Inbound => HandshakeState::AwaitingVersion,
            Direction::Outbound => HandshakeState::VersionSent,
        };

        let handshake = self
            .handshakes
            .get_mut(&peer_id)
            .ok_or(Error::PeerNotFound(peer_id))?;

        if handshake.state != expected {
            return Err(Error::UnexpectedHandshakeState(Box::new(
                handshake.state.clone(),
            )));
        }

        handshake.state = HandshakeState::AwaitingVerack(Box::new(version));

        if direction.is_inbound() {
            let nonce = self.rng.u64(..);
            handshake.local_nonce.replace(nonce);
            let our_version = self.version_message(peer_id, local_addr, nonce);
            self.send(peer_id, NetworkMessage::Version(our_version))?;
            self.send(peer_id, NetworkMessage::Verack)?;
        }

        Ok(())
    }

    /// Completes the handshake.
    pub(crate) fn on_verack(
        &mut self,
        peer_id: PeerId,
        direction: Direction,
    ) -> Result<NewPeer, Error> {
        let handshake = self
            .handshakes
            .remove(&peer_id)
            .ok_or(Error::PeerNotFound(peer_id))?;

        let version = match handshake.state {
            HandshakeState::AwaitingVerack(version) => version,
            state => return Err(Error::UnexpectedHandshakeState(Box::new(state))),
        };

        let best_number = version.start_height.max(0) as u32;

        self.connected_peers.insert(
            peer_id,
            PeerInfo {
                direction,
                ping: PingState::Idle {
                    since: Instant::now(),
                },
                pongs: 0,
                total_latency: 0,
            },
        );

        if direction.is_outbound() {
            self.send(peer_id, NetworkMessage::Verack)?;
        }

        tracing::debug!(
            ?direction,
            best_number,
            user_agent = version.user_agent,
            "🤝 New peer {peer_id:?}"
        );

        if !self.address_book.has_max_addresses() {
            self.send(peer_id, NetworkMessage::GetAddr)?;
        }

        // First latency sample right away.
        self.ping(peer_id);

        Ok(NewPeer {
            peer_id,
            best_number,
            direction,
        })
    }

    pub(crate) fn on_addr(&mut self, peer_id: PeerId, addresses: Vec<(u32, Address)>) {
        let added = self.address_book.add_many(peer_id, addresses);
        if added > 0 {
            tracing::trace!(
                "Added {added} addresses from {peer_id:?}, {} available",
                self.address_book.available_addresses_count()
            );
        }
    }

    /// Returns the average latency of the peer.
    pub(crate) fn on_pong(&mut self, peer_id: PeerId, nonce: u64) -> Result<Latency, Error> {
        let peer = self
            .connected_peers
            .get_mut(&peer_id)
            .ok_or(Error::PeerNotFound(peer_id))?;

        let PingState::AwaitingPong {
            nonce: expected,
            sent_at,
        } = peer.ping
        else {
            return Err(Error::UnexpectedPong);
        };

        if nonce != expected {
            return Err(Error::BadPong {
                expected,
                got: nonce,
            });
        }

        let elapsed = sent_at.elapsed();
        if elapsed >= PING_TIMEOUT {
            return Err(Error::PingTimeout);
        }

        let avg_latency = peer.record_latency(elapsed.as_millis());
        peer.ping = PingState::Idle {
            since: Instant::now(),
        };

        tracing::trace!("Received pong from {peer_id} (Avg. Latency: {avg_latency}ms)");

        Ok(avg_latency)
    }
}
