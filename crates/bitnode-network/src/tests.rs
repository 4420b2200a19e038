use crate::message::{
    Address, GetHeadersMessage, Inventory, NetworkMessage, RawNetworkMessage, ServiceFlags,
    VersionMessage, to_bitcoin,
};
use crate::{Config, NetworkHandle, PeerId, SendTransactionResult, SyncState};
use bitcoin::BlockHash;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash as _;
use bitnode_chain::Chain;
use bitnode_mempool::{CoinsView, MemPool};
use bitnode_primitives::{Block, Hash256, Network, OutPoint, TxOut};
use bitnode_storage::ChainStore;
use bitnode_test_utils::{block_data, p2pkh_script, spend};
use chrono::Local;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct MockBitcoind {
    hash2number: HashMap<Hash256, u32>,
    blocks: Vec<Block>,
    /// Height advertised in the version message.
    best_number: u32,
    local_addr: PeerId,
    connections: Arc<RwLock<HashMap<PeerId, UnboundedSender<NetworkMessage>>>>,
    announced_transactions: Arc<Mutex<Vec<Hash256>>>,
    /// Data served by the node upon our requests.
    served: UnboundedSender<NetworkMessage>,
    served_receiver: Arc<tokio::sync::Mutex<UnboundedReceiver<NetworkMessage>>>,
}

impl MockBitcoind {
    fn new(local_addr: PeerId, best_number: u32) -> Self {
        let blocks = block_data();
        let hash2number = blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.hash(), index as u32))
            .collect();
        let (served, served_receiver) = unbounded_channel();
        Self {
            hash2number,
            blocks,
            best_number,
            local_addr,
            connections: Arc::new(RwLock::new(HashMap::new())),
            announced_transactions: Arc::new(Mutex::new(Vec::new())),
            served,
            served_receiver: Arc::new(tokio::sync::Mutex::new(served_receiver)),
        }
    }

    fn block_hash(&self, number: usize) -> BlockHash {
        self.blocks[number].hash().into()
    }

    // MockBitcoind only supports the inbound connection.
    fn handle_message(&self, msg: NetworkMessage, from: PeerId) {
        match msg {
            NetworkMessage::Version(_v) => {
                let services = ServiceFlags::NETWORK | ServiceFlags::WITNESS;

                // Send our version.
                let our_version = VersionMessage {
                    version: 70016,
                    services,
                    timestamp: Local::now().timestamp(),
                    receiver: Address::new(&from, ServiceFlags::NONE),
                    sender: Address::new(&self.local_addr, services),
                    nonce: 666,
                    user_agent: "/MockBitcoind:0.0.1/".to_string(),
                    start_height: self.best_number as i32,
                    relay: false,
                };
                self.send(from, NetworkMessage::Version(our_version));
                self.send(from, NetworkMessage::Verack);
            }
            NetworkMessage::GetAddr => {
                self.send(from, NetworkMessage::Addr(Vec::new()));
            }
            NetworkMessage::GetHeaders(GetHeadersMessage {
                locator_hashes,
                stop_hash,
                ..
            }) => {
                let start = locator_hashes
                    .iter()
                    .find_map(|hash| self.hash2number.get(&Hash256::from(*hash)))
                    .map_or(1, |number| number + 1);
                let mut headers = Vec::new();
                for block in &self.blocks[start as usize..=self.best_number as usize] {
                    headers.push(to_bitcoin(block.header()).unwrap());
                    if BlockHash::from(block.hash()) == stop_hash {
                        break;
                    }
                }
                self.send(from, NetworkMessage::Headers(headers));
            }
            NetworkMessage::GetData(invs) => {
                for inv in invs {
                    match inv {
                        Inventory::Block(block_hash) => {
                            let block = self
                                .hash2number
                                .get(&Hash256::from(block_hash))
                                .and_then(|number| self.blocks.get(*number as usize))
                                .expect("Block not found");
                            self.send(from, NetworkMessage::Block(to_bitcoin(block).unwrap()));
                        }
                        unsupported_inv => panic!("Unsupported inventory {unsupported_inv:?}"),
                    }
                }
            }
            NetworkMessage::Inv(invs) => {
                let mut announced_transactions = self.announced_transactions.lock();
                for inv in invs {
                    if let Inventory::Transaction(txid) = inv {
                        announced_transactions.push(txid.into());
                    }
                }
            }
            NetworkMessage::Ping(nonce) => {
                self.send(from, NetworkMessage::Pong(nonce));
            }
            msg @ (NetworkMessage::Headers(_)
            | NetworkMessage::Block(_)
            | NetworkMessage::NotFound(_)) => {
                let _ = self.served.send(msg);
            }
            NetworkMessage::Verack | NetworkMessage::Pong(_) => {}
            msg => tracing::debug!("Mock bitcoind ignored {}", msg.cmd()),
        }
    }

    fn send(&self, peer: PeerId, msg: NetworkMessage) {
        self.connections
            .read()
            .get(&peer)
            .expect("Peer not found")
            .send(msg)
            .expect("Failed to send peer message");
    }

    fn first_connection(&self) -> Option<PeerId> {
        self.connections.read().keys().next().copied()
    }

    /// Sends `request` to the node and waits for the data it serves.
    async fn request(&self, request: NetworkMessage) -> NetworkMessage {
        let bitnode = self
            .first_connection()
            .expect("Connection has been established");
        self.send(bitnode, request);
        tokio::time::timeout(TIMEOUT, self.served_receiver.lock().await.recv())
            .await
            .expect("Request timed out")
            .expect("Mock bitcoind is running")
    }

    async fn get_headers(
        &self,
        locator_hashes: Vec<BlockHash>,
        stop_hash: BlockHash,
    ) -> Vec<BlockHash> {
        let request = NetworkMessage::GetHeaders(GetHeadersMessage {
            version: 70016,
            locator_hashes,
            stop_hash,
        });
        match self.request(request).await {
            NetworkMessage::Headers(headers) => {
                headers.iter().map(|header| header.block_hash()).collect()
            }
            other => panic!("Expected headers, got {other:?}"),
        }
    }
}

async fn bitcoind_main_loop(bitcoind: MockBitcoind, listener: TcpListener, network: Network) {
    let magic = network.to_bitcoin().magic();

    loop {
        let (socket, peer_addr) = listener
            .accept()
            .await
            .unwrap_or_else(|err| panic!("Failed to accept inbound connection: {err:?}"));

        tracing::debug!("Accepted inbound connection from {peer_addr:?}");

        let (mut reader, mut writer) = socket.into_split();

        let (sender, mut receiver) = unbounded_channel::<NetworkMessage>();
        bitcoind.connections.write().insert(peer_addr, sender);

        tokio::spawn({
            let bitcoind = bitcoind.clone();

            async move {
                let mut unparsed = vec![];
                let mut buf = vec![0; 1024];
                loop {
                    let bytes_read = match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    unparsed.extend_from_slice(&buf[..bytes_read]);

                    loop {
                        match encode::deserialize_partial::<RawNetworkMessage>(&unparsed) {
                            Ok((raw, consumed)) => {
                                unparsed.drain(..consumed);
                                bitcoind.handle_message(raw.into_payload(), peer_addr);
                            }
                            Err(encode::Error::Io(err))
                                if err.kind() == bitcoin::io::ErrorKind::UnexpectedEof =>
                            {
                                break;
                            }
                            Err(err) => panic!("Error occurred in parsing network message: {err:?}"),
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(network_message) = receiver.recv().await {
                let msg = encode::serialize(&RawNetworkMessage::new(magic, network_message));
                if writer.write_all(&msg).await.is_err() {
                    return;
                }
            }
        });
    }
}

async fn new_mock_bitcoind(best_number: u32) -> MockBitcoind {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let addr = listener.local_addr().unwrap();

    tracing::debug!("Mock bitcoind listens on {addr:?}");

    let bitcoind = MockBitcoind::new(addr, best_number);

    tokio::spawn(bitcoind_main_loop(
        bitcoind.clone(),
        listener,
        Network::Mainnet,
    ));

    bitcoind
}

struct TestNode {
    _temp_dir: TempDir,
    chain: Arc<Chain>,
    mempool: Arc<MemPool>,
}

impl TestNode {
    fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = ChainStore::new(temp_dir.path(), Network::Mainnet);
        store.connect().expect("Failed to open chain store");
        let chain = Arc::new(Chain::new(Arc::new(store)));
        chain
            .create_genesis_block()
            .expect("Failed to create genesis block");
        let coins: Arc<dyn CoinsView> = chain.clone();
        let mempool = Arc::new(MemPool::new(coins, Network::Mainnet));
        Self {
            _temp_dir: temp_dir,
            chain,
            mempool,
        }
    }

    /// Node already holding the test blocks up to `best_number`.
    fn with_blocks(best_number: usize) -> Self {
        let test_node = Self::new();
        for block in block_data().into_iter().take(best_number + 1).skip(1) {
            assert!(test_node.chain.add_block(block).unwrap().is_committed());
        }
        test_node
    }

    async fn start_network(&self, seednodes: Vec<String>) -> NetworkHandle {
        crate::build_network(
            self.chain.clone(),
            self.mempool.clone(),
            Config {
                network: Network::Mainnet,
                listen_on: "127.0.0.1:0".parse().unwrap(),
                seednodes,
                seednode_only: true,
                ipv4_only: true,
                max_outbound_peers: 2,
                max_inbound_peers: 2,
                max_inflight_windows: 4,
            },
        )
        .await
        .unwrap()
    }
}

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_synchronized(network_handle: &NetworkHandle) {
    let mut sync_state = network_handle.subscribe_sync_state();
    tokio::time::timeout(
        TIMEOUT,
        sync_state.wait_for(|state| *state == SyncState::Synchronized),
    )
    .await
    .expect("Sync timed out")
    .expect("Network stopped");
}

#[tokio::test]
async fn node_syncs_to_the_peer_best_block() {
    init_logger();

    let bitcoind = new_mock_bitcoind(3).await;
    let test_node = TestNode::new();
    let network_handle = test_node
        .start_network(vec![bitcoind.local_addr.to_string()])
        .await;

    assert!(
        tokio::time::timeout(TIMEOUT, network_handle.wait_connected())
            .await
            .expect("Connection timed out")
    );

    wait_synchronized(&network_handle).await;

    assert_eq!(test_node.chain.best_number().unwrap(), 3);
    assert_eq!(
        test_node.chain.local_tip().unwrap().hash,
        bitcoind.blocks[3].hash()
    );
    assert_eq!(network_handle.best_number(), 3);

    let status = network_handle.status().await.expect("Network is running");
    assert_eq!(status.num_connected_peers, 1);
    assert_eq!(status.sync_state, SyncState::Synchronized);
    assert!(status.total_bytes_inbound > 0);
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["syncState"], "synchronized");

    let sync_peers = network_handle.sync_peers();
    assert_eq!(sync_peers.len(), 1);
    assert_eq!(sync_peers[0].best_number, 3);
    assert!(!sync_peers[0].busy);
}

#[tokio::test]
async fn announced_block_is_downloaded_after_sync() {
    init_logger();

    let bitcoind = new_mock_bitcoind(2).await;
    let test_node = TestNode::new();
    let network_handle = test_node
        .start_network(vec![bitcoind.local_addr.to_string()])
        .await;

    wait_synchronized(&network_handle).await;
    assert_eq!(test_node.chain.best_number().unwrap(), 2);

    let new_block_hash = bitcoind.blocks[3].hash();
    let block_committed = test_node.chain.wait_for_block(new_block_hash).unwrap();

    let bitnode = bitcoind
        .first_connection()
        .expect("Connection has been established");
    bitcoind.send(
        bitnode,
        NetworkMessage::Inv(vec![Inventory::Block(new_block_hash.into())]),
    );

    let committed = tokio::time::timeout(TIMEOUT, block_committed)
        .await
        .expect("Block announcement timed out")
        .unwrap();
    assert_eq!(committed.number, 3);
    assert_eq!(network_handle.best_number(), 3);
}

#[tokio::test]
async fn local_transaction_is_announced() {
    init_logger();

    let bitcoind = new_mock_bitcoind(1).await;
    let test_node = TestNode::new();
    let network_handle = test_node
        .start_network(vec![bitcoind.local_addr.to_string()])
        .await;

    wait_synchronized(&network_handle).await;

    let coinbase = bitcoind.blocks[1].transactions()[0].hash();
    let tx = spend(
        &[OutPoint::new(coinbase, 0)],
        vec![TxOut::new(1_000, p2pkh_script(1))],
    );
    let txid = tx.hash();

    assert_eq!(
        network_handle.send_transaction(tx).await,
        SendTransactionResult::Success(txid)
    );
    assert!(test_node.mempool.has(&txid));
    assert!(network_handle.get_transaction(txid).await.is_some());

    let missing_parent = spend(
        &[OutPoint::new(Hash256::from_bytes([5; 32]), 0)],
        vec![TxOut::new(1_000, p2pkh_script(2))],
    );
    assert!(matches!(
        network_handle.send_transaction(missing_parent).await,
        SendTransactionResult::Failure(_)
    ));

    tokio::time::timeout(TIMEOUT, async {
        while !bitcoind.announced_transactions.lock().contains(&txid) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("Transaction was not announced");
}

#[tokio::test]
async fn null_locator_at_genesis_gets_no_headers() {
    init_logger();

    let bitcoind = new_mock_bitcoind(0).await;
    let test_node = TestNode::new();
    let network_handle = test_node
        .start_network(vec![bitcoind.local_addr.to_string()])
        .await;

    wait_synchronized(&network_handle).await;

    let headers = bitcoind
        .get_headers(vec![BlockHash::all_zeros()], BlockHash::all_zeros())
        .await;
    assert!(headers.is_empty());
}

#[tokio::test]
async fn headers_are_served_after_the_locator() {
    init_logger();

    let bitcoind = new_mock_bitcoind(3).await;
    let test_node = TestNode::with_blocks(3);
    let network_handle = test_node
        .start_network(vec![bitcoind.local_addr.to_string()])
        .await;

    wait_synchronized(&network_handle).await;

    let hash = |number| bitcoind.block_hash(number);
    let null = BlockHash::all_zeros();

    // Null locator, from right after genesis.
    assert_eq!(
        bitcoind.get_headers(vec![null], null).await,
        vec![hash(1), hash(2), hash(3)]
    );

    // Mid-chain locator.
    assert_eq!(
        bitcoind.get_headers(vec![hash(1), hash(0)], null).await,
        vec![hash(2), hash(3)]
    );

    // Locator at our tip.
    assert!(bitcoind.get_headers(vec![hash(3)], null).await.is_empty());

    // No known locator hash, from right after genesis.
    let unknown = BlockHash::from_byte_array([7; 32]);
    assert_eq!(
        bitcoind.get_headers(vec![unknown], null).await,
        vec![hash(1), hash(2), hash(3)]
    );
    assert_eq!(
        bitcoind.get_headers(vec![unknown, hash(2)], null).await,
        vec![hash(3)]
    );

    // Stop hash inside the range.
    assert_eq!(
        bitcoind.get_headers(vec![hash(0)], hash(2)).await,
        vec![hash(1), hash(2)]
    );
}

#[tokio::test]
async fn blocks_are_served_on_request() {
    init_logger();

    let bitcoind = new_mock_bitcoind(3).await;
    let test_node = TestNode::with_blocks(3);
    let network_handle = test_node
        .start_network(vec![bitcoind.local_addr.to_string()])
        .await;

    wait_synchronized(&network_handle).await;

    let served = bitcoind
        .request(NetworkMessage::GetData(vec![Inventory::Block(
            bitcoind.block_hash(2),
        )]))
        .await;
    let block = match served {
        NetworkMessage::Block(block) => block,
        other => panic!("Expected a block, got {other:?}"),
    };
    assert_eq!(block.block_hash(), bitcoind.block_hash(2));
    assert_eq!(block.txdata.len(), bitcoind.blocks[2].transactions().len());

    let unknown = Inventory::Block(BlockHash::from_byte_array([7; 32]));
    assert_eq!(
        bitcoind
            .request(NetworkMessage::GetData(vec![unknown]))
            .await,
        NetworkMessage::NotFound(vec![unknown])
    );
}
