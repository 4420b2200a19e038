use crate::message::{Magic, MAX_MSG_SIZE, NetworkMessage, RawNetworkMessage};
use crate::network_processor::Event;
use crate::{Bandwidth, Error, PeerId};
use bitcoin::consensus::encode;
use bitnode_primitives::Network;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::watch;

/// Size of the socket read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Timeout for opening an outbound stream.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel for sending messages to the peer.
pub type ConnectionWriter = UnboundedSender<NetworkMessage>;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Inbound)
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Outbound)
    }
}

/// Stops the connection task when terminated or dropped.
#[derive(Debug)]
pub struct ConnectionCloser(watch::Sender<()>);

impl ConnectionCloser {
    pub(crate) fn new() -> (Self, watch::Receiver<()>) {
        let (sender, receiver) = watch::channel(());
        (Self(sender), receiver)
    }

    pub fn terminate(self) {
        let _ = self.0.send(());
    }
}

/// A freshly opened peer connection.
#[derive(Debug)]
pub struct NewConnection {
    pub peer_addr: PeerId,
    /// Our side of the connection.
    pub local_addr: PeerId,
    pub direction: Direction,
    pub writer: ConnectionWriter,
    pub closer: ConnectionCloser,
}

/// Splits the byte stream of a connection into messages.
#[derive(Debug)]
struct MessageDecoder {
    magic: Magic,
    unparsed: Vec<u8>,
}

impl MessageDecoder {
    fn new(magic: Magic) -> Self {
        Self {
            magic,
            unparsed: Vec::with_capacity(READ_BUFFER_SIZE * 2),
        }
    }

    fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Returns [`None`] until a complete frame has been received.
    fn decode_next(&mut self) -> Result<Option<NetworkMessage>, Error> {
        match encode::deserialize_partial::<RawNetworkMessage>(&self.unparsed) {
            Ok((msg, consumed)) => {
                self.unparsed.drain(..consumed);
                if *msg.magic() != self.magic {
                    return Err(Error::UnexpectedMagic {
                        expected: self.magic,
                        got: *msg.magic(),
                    });
                }
                Ok(Some(msg.into_payload()))
            }
            Err(encode::Error::Io(err)) if err.kind() == bitcoin::io::ErrorKind::UnexpectedEof => {
                if self.unparsed.len() > MAX_MSG_SIZE {
                    return Err(Error::MessageTooLarge(self.unparsed.len()));
                }
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Opens the connections with the other nodes.
#[derive(Clone)]
pub struct Connector {
    magic: Magic,
    network_event_sender: UnboundedSender<Event>,
    bandwidth: Bandwidth,
    ipv4_only: bool,
}

impl Connector {
    pub fn new(
        network: Network,
        network_event_sender: UnboundedSender<Event>,
        bandwidth: Bandwidth,
        ipv4_only: bool,
    ) -> Self {
        Self {
            magic: network.to_bitcoin().magic(),
            network_event_sender,
            bandwidth,
            ipv4_only,
        }
    }

    /// Dials `addr` in the background, a failure is reported as a network event.
    pub fn dial(&self, addr: PeerId) {
        let connector = self.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr));
            let result = match connect.await {
                Ok(Ok(stream)) => connector.open(Direction::Outbound, stream, started.elapsed()),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Err(Error::ConnectionTimeout),
            };

            if let Err(reason) = result {
                let _ = connector
                    .network_event_sender
                    .send(Event::OutboundConnectionFailure {
                        peer_addr: addr,
                        reason,
                    });
            }
        });
    }

    /// Takes over a stream accepted by the listener.
    pub fn accept(&self, stream: TcpStream) -> Result<(), Error> {
        self.open(Direction::Inbound, stream, Duration::ZERO)
    }

    fn open(
        &self,
        direction: Direction,
        stream: TcpStream,
        connect_time: Duration,
    ) -> Result<(), Error> {
        let peer_addr = stream.peer_addr()?;

        if self.ipv4_only && peer_addr.is_ipv6() {
            return Err(Error::Ipv4Only);
        }

        let local_addr = stream.local_addr()?;

        tracing::debug!(
            ?peer_addr,
            ?direction,
            connect_ms = connect_time.as_millis(),
            "New connection"
        );

        let (writer, outbox) = unbounded_channel();
        let (closer, closed) = ConnectionCloser::new();

        self.network_event_sender
            .send(Event::NewConnection(NewConnection {
                peer_addr,
                local_addr,
                direction,
                writer,
                closer,
            }))
            .map_err(|_| Error::NetworkEventStreamError)?;

        let connector = self.clone();

        tokio::spawn(async move {
            if let Err(err) = connector
                .run(peer_addr, direction, stream, outbox, closed)
                .await
            {
                let _ = connector
                    .network_event_sender
                    .send(Event::disconnect(peer_addr, err));
            }
        });

        Ok(())
    }

    /// Moves the messages between the socket and the network processor until the
    /// connection is closed by either side.
    async fn run(
        &self,
        peer: PeerId,
        direction: Direction,
        stream: TcpStream,
        mut outbox: UnboundedReceiver<NetworkMessage>,
        mut closed: watch::Receiver<()>,
    ) -> Result<(), Error> {
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = MessageDecoder::new(self.magic);
        let mut read_buffer = vec![0; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = closed.changed() => {
                    tracing::trace!(?peer, "Closing connection");
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
                read = reader.read(&mut read_buffer) => {
                    let n = read?;
                    if n == 0 {
                        return Err(Error::PeerShutdown);
                    }

                    self.bandwidth
                        .total_bytes_inbound
                        .fetch_add(n as u64, Ordering::Relaxed);

                    decoder.input(&read_buffer[..n]);

                    while let Some(payload) = decoder.decode_next()? {
                        self.network_event_sender
                            .send(Event::PeerMessage {
                                from: peer,
                                direction,
                                payload,
                            })
                            .map_err(|_| Error::NetworkEventStreamError)?;
                    }
                }
                Some(msg) = outbox.recv() => {
                    let cmd = msg.cmd();
                    let bytes = encode::serialize(&RawNetworkMessage::new(self.magic, msg));
                    writer.write_all(&bytes).await?;

                    tracing::trace!(to = ?peer, "=> sent {cmd} ({} bytes)", bytes.len());

                    self.bandwidth
                        .total_bytes_outbound
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
            }
        }
    }
}
