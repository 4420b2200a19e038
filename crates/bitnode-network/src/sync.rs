use crate::message::Inventory;
use crate::network_processor::Event;
use crate::peer_manager::NewPeer;
use crate::{BLOCK_WINDOW_SIZE, Error, Latency, PeerId};
use bitnode_chain::{AddBlockOutcome, Chain, MAX_HEADERS_PER_MESSAGE};
use bitnode_primitives::{Block, BlockHeader, BlockNumber, Hash256, IndexedBlock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

/// Time given to a peer to answer a `getheaders`.
const HEADERS_TIMEOUT: Duration = Duration::from_secs(30);

/// Time given to a peer to deliver every block of a window.
const BLOCK_WINDOW_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of the most recently received header hashes used as the next locator.
const MAX_LOCATOR_HASHES: usize = 30;

/// Sync state of the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// No peer is connected.
    #[default]
    Disconnected,
    /// The last peer is going away.
    Disconnecting,
    /// Dialing peers.
    Connecting,
    /// At least one peer completed the handshake.
    Connected,
    /// Downloading headers and blocks.
    Sync,
    /// The local tip reached the best height agreed by the peers.
    Synchronized,
}

impl SyncState {
    /// Whether at least one peer is ready.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Sync | Self::Synchronized)
    }
}

/// Contains the data about a peer we sync with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSync {
    /// Peer id of this peer.
    pub peer_id: PeerId,
    /// The number of the best block that we've seen for this peer.
    pub best_number: u32,
    /// Whether a headers or blocks request to this peer is in flight.
    pub busy: bool,
    /// Latency of connection to this peer.
    pub latency: Latency,
}

/// Sync state shared between the network processor and the [`crate::NetworkHandle`].
///
/// Each mutex guards one concern and is never held across an await. When both are needed,
/// `peer_search` is locked before `peers`.
#[derive(Debug)]
pub(crate) struct SyncShared {
    /// Ready peers.
    pub(crate) peers: Mutex<HashMap<PeerId, PeerSync>>,
    /// Hashes of the headers whose block has not been requested yet.
    pub(crate) pending_blocks: Mutex<VecDeque<Hash256>>,
    /// Serializes the search of a free peer and its reservation.
    pub(crate) peer_search: Mutex<()>,
    best_number: AtomicU32,
    state: watch::Sender<SyncState>,
}

impl SyncShared {
    pub(crate) fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            pending_blocks: Mutex::new(VecDeque::new()),
            peer_search: Mutex::new(()),
            best_number: AtomicU32::new(0),
            state: watch::Sender::new(SyncState::default()),
        }
    }

    pub(crate) fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Best height agreed by the majority of the peers.
    pub(crate) fn best_number(&self) -> u32 {
        self.best_number.load(Ordering::Relaxed)
    }

    pub(crate) fn sync_peers(&self) -> Vec<PeerSync> {
        self.peers.lock().values().cloned().collect()
    }

    fn set_state(&self, new: SyncState) {
        self.state.send_if_modified(|state| {
            if *state == new {
                return false;
            }
            tracing::debug!("Sync state: {state:?} -> {new:?}");
            *state = new;
            true
        });
    }

    fn update_best_number(&self) {
        let best_number = majority_vote(self.peers.lock().values().map(|peer| peer.best_number));
        let old = self.best_number.swap(best_number, Ordering::Relaxed);
        if old != best_number {
            tracing::debug!("Best height of the network: #{best_number}");
        }
    }
}

/// Returns the height claimed by the most peers, ties broken toward the higher height.
fn majority_vote(heights: impl Iterator<Item = u32>) -> u32 {
    let mut votes = HashMap::<u32, usize>::new();
    for height in heights {
        *votes.entry(height).or_default() += 1;
    }
    votes
        .into_iter()
        .max_by(|(height_a, votes_a), (height_b, votes_b)| {
            votes_a.cmp(votes_b).then(height_a.cmp(height_b))
        })
        .map(|(height, _)| height)
        .unwrap_or_default()
}

/// Locator based sync request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct LocatorRequest {
    pub locator_hashes: Vec<Hash256>,
    pub stop_hash: Hash256,
    pub to: PeerId,
}

/// Represents different kinds of sync requests.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SyncRequest {
    /// Request headers via `getheaders`.
    Headers(LocatorRequest),
    /// Request data via `getdata`.
    Data(Vec<Inventory>, PeerId),
}

/// Represents actions that can be taken during the syncing.
#[derive(Debug)]
pub(crate) enum SyncAction {
    Request(SyncRequest),
    /// Disconnect from the peer for the given reason.
    Disconnect(PeerId, Error),
    Multiple(Vec<SyncAction>),
    None,
}

impl SyncAction {
    fn from_actions(mut actions: Vec<SyncAction>) -> Self {
        actions.retain(|action| !matches!(action, SyncAction::None));
        match actions.len() {
            0 => SyncAction::None,
            1 => actions.remove(0),
            _ => SyncAction::Multiple(actions),
        }
    }
}

/// Where the blocks sent to the import task come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOrigin {
    /// A block window of the initial download.
    Download { generation: u64, from: PeerId },
    /// A block announced after synchronization.
    Announcement { from: PeerId },
}

/// Blocks to be committed, in order.
#[derive(Debug)]
pub(crate) struct ImportBlocks {
    pub origin: BlockOrigin,
    pub blocks: Vec<Block>,
}

/// Result of an [`ImportBlocks`].
#[derive(Debug)]
pub(crate) struct ImportedBlocks {
    pub origin: BlockOrigin,
    /// The last committed block, if any.
    pub result: Result<Option<IndexedBlock>, Error>,
}

/// Commits the blocks sent by the sync manager one batch at a time, reporting the results
/// to the network processor.
pub(crate) async fn import_blocks(
    chain: Arc<Chain>,
    mut import_receiver: UnboundedReceiver<ImportBlocks>,
    network_event_sender: UnboundedSender<Event>,
) {
    while let Some(ImportBlocks { origin, blocks }) = import_receiver.recv().await {
        let chain = chain.clone();
        let result = tokio::task::spawn_blocking(move || commit_blocks(&chain, blocks))
            .await
            .map_err(|err| Error::BlockImport(err.to_string()))
            .and_then(|result| result);

        if network_event_sender
            .send(Event::BlocksImported(ImportedBlocks { origin, result }))
            .is_err()
        {
            return;
        }
    }
}

fn commit_blocks(chain: &Chain, blocks: Vec<Block>) -> Result<Option<IndexedBlock>, Error> {
    let mut last_committed = None;

    for block in blocks {
        let block_hash = block.hash();
        match chain.add_block(block)? {
            AddBlockOutcome::Committed(indexed_block) => {
                tracing::debug!("✨ Imported block #{},{block_hash}", indexed_block.number);
                last_committed.replace(indexed_block);
            }
            AddBlockOutcome::Duplicate(number) => {
                tracing::trace!("Block #{number},{block_hash} already imported");
            }
            AddBlockOutcome::Orphan => return Err(Error::UnconnectedBlock(block_hash)),
        }
    }

    Ok(last_committed)
}

#[derive(Debug)]
struct HeadersRequest {
    peer_id: PeerId,
    locator_hashes: Vec<Hash256>,
    stop_hash: Hash256,
    sent_at: Instant,
}

/// A run of consecutive blocks downloaded from one peer.
#[derive(Debug)]
struct BlockWindow {
    /// Position of this window in the header order.
    seq: u64,
    hashes: Vec<Hash256>,
    blocks: HashMap<Hash256, Block>,
    requested_at: Instant,
}

impl BlockWindow {
    fn new(seq: u64, hashes: Vec<Hash256>) -> Self {
        Self {
            seq,
            blocks: HashMap::with_capacity(hashes.len()),
            hashes,
            requested_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == self.hashes.len()
    }

    /// Returns the blocks in request order.
    fn into_blocks(mut self) -> Vec<Block> {
        self.hashes
            .iter()
            .filter_map(|hash| self.blocks.remove(hash))
            .collect()
    }
}

/// Drives the headers-first download and follows the chain once synchronized.
pub(crate) struct SyncManager {
    chain: Arc<Chain>,
    shared: Arc<SyncShared>,
    max_inflight_windows: usize,
    import_sender: UnboundedSender<ImportBlocks>,
    /// Bumped on every reset, import results of older generations are ignored.
    generation: u64,
    headers_request: Option<HeadersRequest>,
    /// Headers request waiting for a free peer.
    deferred_headers_request: Option<(Vec<Hash256>, Hash256)>,
    /// New headers queued since the start of the header round.
    round_new_headers: usize,
    /// Hash of the last queued header, the next headers must connect to it.
    last_queued: Option<Hash256>,
    /// Most recently received header hashes, oldest first.
    received_hashes: VecDeque<Hash256>,
    /// Hashes pending or being downloaded.
    queued: HashSet<Hash256>,
    next_window_seq: u64,
    inflight_windows: HashMap<PeerId, BlockWindow>,
    /// Windows taken back from the peers that failed them.
    requeued_windows: VecDeque<(u64, Vec<Hash256>)>,
    completed_windows: BTreeMap<u64, (PeerId, Vec<Block>)>,
    next_commit_seq: u64,
    /// Windows sent to the import task and not reported yet.
    importing_windows: usize,
    /// Announced blocks that were requested.
    announced_blocks: HashMap<Hash256, (PeerId, Instant)>,
    /// Announced blocks sent to the import task and not reported yet.
    importing_announced: usize,
}

impl SyncManager {
    pub(crate) fn new(
        chain: Arc<Chain>,
        shared: Arc<SyncShared>,
        max_inflight_windows: usize,
        import_sender: UnboundedSender<ImportBlocks>,
    ) -> Self {
        Self {
            chain,
            shared,
            max_inflight_windows: max_inflight_windows.max(1),
            import_sender,
            generation: 0,
            headers_request: None,
            deferred_headers_request: None,
            round_new_headers: 0,
            last_queued: None,
            received_hashes: VecDeque::with_capacity(MAX_LOCATOR_HASHES),
            queued: HashSet::new(),
            next_window_seq: 0,
            inflight_windows: HashMap::new(),
            requeued_windows: VecDeque::new(),
            completed_windows: BTreeMap::new(),
            next_commit_seq: 0,
            importing_windows: 0,
            announced_blocks: HashMap::new(),
            importing_announced: 0,
        }
    }

    pub(crate) fn state(&self) -> SyncState {
        self.shared.state()
    }

    pub(crate) fn best_number(&self) -> u32 {
        self.shared.best_number()
    }

    pub(crate) fn set_connecting(&self) {
        if matches!(self.state(), SyncState::Disconnected) {
            self.shared.set_state(SyncState::Connecting);
        }
    }

    fn our_best(&self) -> Result<BlockNumber, Error> {
        Ok(self.chain.best_number()?)
    }

    /// Whether a header round, a window or a commit of the download is in progress.
    fn is_downloading(&self) -> bool {
        self.headers_request.is_some()
            || self.deferred_headers_request.is_some()
            || !self.shared.pending_blocks.lock().is_empty()
            || !self.requeued_windows.is_empty()
            || !self.inflight_windows.is_empty()
            || !self.completed_windows.is_empty()
            || self.importing_windows > 0
    }

    /// Adds a ready peer, possibly starting the sync.
    pub(crate) fn add_new_peer(&mut self, new_peer: NewPeer) -> Result<SyncAction, Error> {
        let NewPeer {
            peer_id,
            best_number,
            ..
        } = new_peer;

        // Judged against the local tip, not the best height voted by the peers.
        let our_best = self.our_best()?;
        if best_number < our_best {
            return Ok(SyncAction::Disconnect(
                peer_id,
                Error::PeerBehind {
                    peer_best: best_number,
                    our_best,
                },
            ));
        }

        self.shared.peers.lock().insert(
            peer_id,
            PeerSync {
                peer_id,
                best_number,
                busy: false,
                latency: 0,
            },
        );
        self.shared.update_best_number();

        match self.state() {
            SyncState::Disconnected | SyncState::Disconnecting | SyncState::Connecting => {
                self.shared.set_state(SyncState::Connected);
                self.start()
            }
            SyncState::Connected | SyncState::Synchronized => self.start(),
            SyncState::Sync => Ok(self.schedule_requests()),
        }
    }

    pub(crate) fn update_peer_latency(&mut self, peer_id: PeerId, avg_latency: Latency) {
        self.shared.peers.lock().entry(peer_id).and_modify(|peer| {
            peer.latency = avg_latency;
        });
    }

    fn update_peer_best(&self, peer_id: PeerId, best_number: u32) {
        let mut updated = false;
        self.shared.peers.lock().entry(peer_id).and_modify(|peer| {
            if best_number > peer.best_number {
                peer.best_number = best_number;
                updated = true;
            }
        });
        if updated {
            self.shared.update_best_number();
        }
    }

    /// Removes a peer, handing its pending requests to the other peers.
    pub(crate) fn disconnect(&mut self, peer_id: PeerId) -> SyncAction {
        let removed = self.shared.peers.lock().remove(&peer_id).is_some();

        if !removed {
            return SyncAction::None;
        }

        self.shared.update_best_number();

        self.announced_blocks.retain(|_, (from, _)| *from != peer_id);

        if self
            .headers_request
            .as_ref()
            .is_some_and(|request| request.peer_id == peer_id)
        {
            if let Some(request) = self.headers_request.take() {
                self.deferred_headers_request
                    .replace((request.locator_hashes, request.stop_hash));
            }
        }

        if let Some(window) = self.inflight_windows.remove(&peer_id) {
            tracing::debug!(
                ?peer_id,
                seq = window.seq,
                "Requeueing the block window of a disconnected peer"
            );
            self.requeued_windows.push_back((window.seq, window.hashes));
        }

        if self.shared.peers.lock().is_empty() {
            self.shared.set_state(SyncState::Disconnecting);
            self.reset_download();
            self.shared.set_state(SyncState::Disconnected);
            return SyncAction::None;
        }

        self.schedule_requests()
    }

    /// Starts a header round if the network is ahead of us.
    pub(crate) fn start(&mut self) -> Result<SyncAction, Error> {
        if self.is_downloading() {
            return Ok(SyncAction::None);
        }

        let our_best = self.our_best()?;
        let best_number = self.shared.best_number();

        if best_number <= our_best {
            self.shared.set_state(SyncState::Synchronized);
            return Ok(SyncAction::None);
        }

        tracing::debug!("⏩ Starting sync from #{our_best} to #{best_number}");

        self.shared.set_state(SyncState::Sync);
        self.round_new_headers = 0;
        self.received_hashes.clear();

        let locator = self.chain.get_locators(our_best)?;
        self.deferred_headers_request
            .replace((locator.locator_hashes, locator.stop_hash));

        Ok(self.schedule_requests())
    }

    /// Reserves a free peer claiming a best block above our tip.
    fn reserve_free_peer(&self) -> Option<PeerId> {
        let our_best = self.chain.best_number().ok()?;

        let _search = self.shared.peer_search.lock();
        let mut peers = self.shared.peers.lock();

        let peer = peers
            .values_mut()
            .filter(|peer| !peer.busy && peer.best_number > our_best)
            .min_by_key(|peer| peer.latency)?;
        peer.busy = true;

        Some(peer.peer_id)
    }

    fn release_peer(&self, peer_id: PeerId) {
        self.shared.peers.lock().entry(peer_id).and_modify(|peer| {
            peer.busy = false;
        });
    }

    /// Sends the deferred headers request and fills the free window slots.
    fn schedule_requests(&mut self) -> SyncAction {
        let mut actions = vec![];

        if self.headers_request.is_none() {
            if let Some((locator_hashes, stop_hash)) = self.deferred_headers_request.take() {
                match self.reserve_free_peer() {
                    Some(peer_id) => {
                        actions.push(self.request_headers(peer_id, locator_hashes, stop_hash));
                    }
                    None => {
                        self.deferred_headers_request
                            .replace((locator_hashes, stop_hash));
                    }
                }
            }
        }

        while self.inflight_windows.len() < self.max_inflight_windows {
            if self.requeued_windows.is_empty() && self.shared.pending_blocks.lock().is_empty() {
                break;
            }

            let Some(peer_id) = self.reserve_free_peer() else {
                break;
            };

            let (seq, hashes) = match self.requeued_windows.pop_front() {
                Some(requeued) => requeued,
                None => {
                    let hashes = {
                        let mut pending_blocks = self.shared.pending_blocks.lock();
                        let len = pending_blocks.len().min(BLOCK_WINDOW_SIZE);
                        pending_blocks.drain(..len).collect::<Vec<_>>()
                    };
                    let seq = self.next_window_seq;
                    self.next_window_seq += 1;
                    (seq, hashes)
                }
            };

            tracing::debug!(
                ?peer_id,
                seq,
                "Requesting {} blocks starting from {:?}",
                hashes.len(),
                hashes.first()
            );

            let inv = hashes.iter().map(|hash| Inventory::Block((*hash).into())).collect();
            self.inflight_windows
                .insert(peer_id, BlockWindow::new(seq, hashes));
            actions.push(SyncAction::Request(SyncRequest::Data(inv, peer_id)));
        }

        SyncAction::from_actions(actions)
    }

    fn request_headers(
        &mut self,
        peer_id: PeerId,
        locator_hashes: Vec<Hash256>,
        stop_hash: Hash256,
    ) -> SyncAction {
        tracing::debug!(
            ?peer_id,
            "Requesting headers from {:?}, stop at {stop_hash}",
            locator_hashes.first()
        );

        self.headers_request.replace(HeadersRequest {
            peer_id,
            locator_hashes: locator_hashes.clone(),
            stop_hash,
            sent_at: Instant::now(),
        });

        SyncAction::Request(SyncRequest::Headers(LocatorRequest {
            locator_hashes,
            stop_hash,
            to: peer_id,
        }))
    }

    pub(crate) fn on_headers(
        &mut self,
        headers: Vec<BlockHeader>,
        from: PeerId,
    ) -> Result<SyncAction, Error> {
        if headers.len() > MAX_HEADERS_PER_MESSAGE as usize {
            return Ok(SyncAction::Disconnect(from, Error::TooManyHeaders));
        }

        let Some(request) = self
            .headers_request
            .take_if(|request| request.peer_id == from)
        else {
            tracing::debug!(?from, "Ignored {} unrequested headers", headers.len());
            return Ok(SyncAction::None);
        };

        self.release_peer(from);

        let mut prev_hash = None;
        let mut new_hashes = Vec::new();
        let mut reached_stop_hash = false;

        for header in &headers {
            let block_hash = header.hash();
            let parent = header.prev_blockhash();

            let connected = match prev_hash {
                Some(prev_hash) => parent == prev_hash,
                None => self.last_queued == Some(parent) || self.chain.contains(&parent)?,
            };

            if !connected {
                tracing::debug!(?from, "Header {block_hash} does not connect to {parent}");
                return Ok(SyncAction::Disconnect(
                    from,
                    Error::HeadersNotConnected(block_hash),
                ));
            }

            prev_hash.replace(block_hash);

            if block_hash == request.stop_hash {
                reached_stop_hash = true;
            }

            if self.received_hashes.len() == MAX_LOCATOR_HASHES {
                self.received_hashes.pop_front();
            }
            self.received_hashes.push_back(block_hash);

            if self.queued.contains(&block_hash) || self.chain.contains(&block_hash)? {
                continue;
            }

            new_hashes.push(block_hash);
        }

        if let Some(last) = new_hashes.last() {
            self.last_queued.replace(*last);
        }

        self.round_new_headers += new_hashes.len();
        self.queued.extend(new_hashes.iter().copied());
        self.shared.pending_blocks.lock().extend(new_hashes);

        let round_ended =
            reached_stop_hash || headers.len() < MAX_HEADERS_PER_MESSAGE as usize;

        if round_ended {
            tracing::debug!(
                ?from,
                "Header round ended with {} new headers",
                self.round_new_headers
            );

            if self.round_new_headers == 0 && !self.is_downloading() {
                self.shared.set_state(SyncState::Synchronized);
                return Ok(SyncAction::None);
            }
        } else {
            let locator_hashes = self.received_hashes.iter().rev().copied().collect();
            self.deferred_headers_request
                .replace((locator_hashes, request.stop_hash));
        }

        let action = self.schedule_requests();

        if round_ended && !self.is_downloading() {
            return Ok(SyncAction::from_actions(vec![
                action,
                self.on_download_complete()?,
            ]));
        }

        Ok(action)
    }

    /// Every block of the round is committed, the next round starts from the new tip.
    fn on_download_complete(&mut self) -> Result<SyncAction, Error> {
        self.queued.clear();
        self.last_queued.take();
        self.start()
    }

    /// Diffs the announced blocks against the known ones, returning the blocks to request.
    pub(crate) fn on_block_inv(
        &mut self,
        block_hashes: Vec<Hash256>,
        from: PeerId,
    ) -> Result<SyncAction, Error> {
        if self.state() != SyncState::Synchronized {
            return Ok(SyncAction::None);
        }

        let mut inv = Vec::new();

        for block_hash in block_hashes {
            if self.announced_blocks.contains_key(&block_hash)
                || self.queued.contains(&block_hash)
                || self.chain.contains(&block_hash)?
            {
                continue;
            }

            tracing::debug!("Requesting announced block {block_hash} from {from:?}");
            self.announced_blocks
                .insert(block_hash, (from, Instant::now()));
            inv.push(Inventory::Block(block_hash.into()));
        }

        if inv.is_empty() {
            return Ok(SyncAction::None);
        }

        Ok(SyncAction::Request(SyncRequest::Data(inv, from)))
    }

    pub(crate) fn on_block(&mut self, block: Block, from: PeerId) -> Result<SyncAction, Error> {
        let block_hash = block.hash();

        if let Some(window) = self.inflight_windows.get_mut(&from) {
            if window.hashes.contains(&block_hash) {
                window.blocks.entry(block_hash).or_insert(block);

                if window.is_complete() {
                    if let Some(window) = self.inflight_windows.remove(&from) {
                        self.release_peer(from);
                        self.completed_windows
                            .insert(window.seq, (from, window.into_blocks()));
                        self.flush_completed_windows();
                    }
                    return Ok(self.schedule_requests());
                }

                return Ok(SyncAction::None);
            }
        }

        let announced = self.announced_blocks.remove(&block_hash).is_some();

        if announced || self.state() == SyncState::Synchronized {
            return self.on_announced_block(block, from);
        }

        tracing::debug!(?from, "Ignored unrequested block {block_hash}");

        Ok(SyncAction::None)
    }

    fn on_announced_block(&mut self, block: Block, from: PeerId) -> Result<SyncAction, Error> {
        let block_hash = block.hash();
        let parent = block.header().prev_blockhash();

        let Some(parent_height) = self
            .chain
            .get_height(&parent)?
            .filter(|height| *height >= 0)
        else {
            tracing::debug!(?from, "Received block {block_hash} with unknown parent {parent}");
            return Ok(SyncAction::Disconnect(
                from,
                Error::UnconnectedBlock(block_hash),
            ));
        };

        self.update_peer_best(from, parent_height as u32 + 1);

        self.importing_announced += 1;
        self.send_import(ImportBlocks {
            origin: BlockOrigin::Announcement { from },
            blocks: vec![block],
        });

        Ok(SyncAction::None)
    }

    /// Sends the completed windows to the import task in header order.
    fn flush_completed_windows(&mut self) {
        while let Some((from, blocks)) = self.completed_windows.remove(&self.next_commit_seq) {
            self.next_commit_seq += 1;
            self.importing_windows += 1;
            self.send_import(ImportBlocks {
                origin: BlockOrigin::Download {
                    generation: self.generation,
                    from,
                },
                blocks,
            });
        }
    }

    fn send_import(&self, import_blocks: ImportBlocks) {
        if self.import_sender.send(import_blocks).is_err() {
            tracing::error!("Block import task is gone");
        }
    }

    pub(crate) fn on_blocks_imported(
        &mut self,
        imported_blocks: ImportedBlocks,
    ) -> Result<SyncAction, Error> {
        let ImportedBlocks { origin, result } = imported_blocks;

        match origin {
            BlockOrigin::Download { generation, from } => {
                if generation != self.generation {
                    return Ok(SyncAction::None);
                }

                self.importing_windows = self.importing_windows.saturating_sub(1);

                if let Err(err) = result {
                    tracing::warn!(?err, ?from, "Failed to import downloaded blocks");
                    self.reset_download();
                    let restart = self.start()?;
                    return Ok(SyncAction::from_actions(vec![
                        SyncAction::Disconnect(from, err),
                        restart,
                    ]));
                }

                if self.is_downloading() {
                    return Ok(SyncAction::None);
                }

                self.on_download_complete()
            }
            BlockOrigin::Announcement { from } => {
                self.importing_announced = self.importing_announced.saturating_sub(1);

                match result {
                    Ok(Some(block)) => {
                        tracing::info!("📦 New block #{},{}", block.number, block.hash);
                        Ok(SyncAction::None)
                    }
                    Ok(None) => Ok(SyncAction::None),
                    Err(Error::Chain(bitnode_chain::Error::Storage(err))) => {
                        tracing::error!(?err, "Failed to store announced block");
                        Ok(SyncAction::None)
                    }
                    Err(err) => Ok(SyncAction::Disconnect(from, err)),
                }
            }
        }
    }

    /// Clears the download state, the import results in flight become stale.
    fn reset_download(&mut self) {
        self.generation += 1;

        if let Some(request) = self.headers_request.take() {
            self.release_peer(request.peer_id);
        }
        self.deferred_headers_request.take();

        for peer_id in self.inflight_windows.keys() {
            self.release_peer(*peer_id);
        }
        self.inflight_windows.clear();

        self.shared.pending_blocks.lock().clear();
        self.requeued_windows.clear();
        self.completed_windows.clear();
        self.next_window_seq = 0;
        self.next_commit_seq = 0;
        self.importing_windows = 0;
        self.round_new_headers = 0;
        self.last_queued.take();
        self.received_hashes.clear();
        self.queued.clear();
    }

    pub(crate) fn on_tick(&mut self) -> Result<SyncAction, Error> {
        let mut actions = vec![];

        if let Some(request) = &self.headers_request {
            if request.sent_at.elapsed() > HEADERS_TIMEOUT {
                actions.push(SyncAction::Disconnect(
                    request.peer_id,
                    Error::HeadersTimeout,
                ));
            }
        }

        for (peer_id, window) in &self.inflight_windows {
            if window.requested_at.elapsed() > BLOCK_WINDOW_TIMEOUT {
                actions.push(SyncAction::Disconnect(*peer_id, Error::BlockWindowTimeout));
            }
        }

        self.announced_blocks
            .retain(|_, (_, requested_at)| requested_at.elapsed() <= BLOCK_WINDOW_TIMEOUT);

        match self.state() {
            SyncState::Sync => actions.push(self.schedule_requests()),
            SyncState::Synchronized
                if self.announced_blocks.is_empty() && self.importing_announced == 0 =>
            {
                if self.shared.best_number() > self.our_best()? {
                    actions.push(self.start()?);
                }
            }
            _ => {}
        }

        Ok(SyncAction::from_actions(actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_connection::Direction;
    use bitnode_primitives::Network;
    use bitnode_storage::ChainStore;
    use bitnode_test_utils::build_chain;
    use tempfile::TempDir;
    use tokio::sync::mpsc::unbounded_channel;

    struct TestSync {
        _temp_dir: TempDir,
        chain: Arc<Chain>,
        sync: SyncManager,
        import_receiver: UnboundedReceiver<ImportBlocks>,
    }

    fn new_test_sync(max_inflight_windows: usize) -> TestSync {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = ChainStore::new(temp_dir.path(), Network::Testnet);
        store.connect().expect("Failed to open chain store");
        let chain = Arc::new(Chain::new(Arc::new(store)));
        chain.create_genesis_block().unwrap();
        let (import_sender, import_receiver) = unbounded_channel();
        let sync = SyncManager::new(
            chain.clone(),
            Arc::new(SyncShared::new()),
            max_inflight_windows,
            import_sender,
        );
        TestSync {
            _temp_dir: temp_dir,
            chain,
            sync,
            import_receiver,
        }
    }

    fn peer(index: u8) -> PeerId {
        format!("10.0.0.{index}:18333").parse().unwrap()
    }

    fn new_peer(peer_id: PeerId, best_number: u32) -> NewPeer {
        NewPeer {
            peer_id,
            best_number,
            direction: Direction::Outbound,
        }
    }

    fn flatten(action: SyncAction) -> Vec<SyncAction> {
        match action {
            SyncAction::Multiple(actions) => actions.into_iter().flat_map(flatten).collect(),
            SyncAction::None => vec![],
            action => vec![action],
        }
    }

    fn headers_request(action: SyncAction) -> LocatorRequest {
        flatten(action)
            .into_iter()
            .find_map(|action| match action {
                SyncAction::Request(SyncRequest::Headers(request)) => Some(request),
                _ => None,
            })
            .expect("Headers must be requested")
    }

    fn data_requests(action: SyncAction) -> Vec<(PeerId, Vec<Hash256>)> {
        flatten(action)
            .into_iter()
            .filter_map(|action| match action {
                SyncAction::Request(SyncRequest::Data(inv, peer_id)) => Some((
                    peer_id,
                    inv.into_iter()
                        .filter_map(|inv| match inv {
                            Inventory::Block(hash) => Some(Hash256::from(hash)),
                            _ => None,
                        })
                        .collect(),
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn majority_vote_prefers_the_higher_height_on_ties() {
        assert_eq!(majority_vote([5, 5, 7, 7, 3].into_iter()), 7);
        assert_eq!(majority_vote([4, 4, 9].into_iter()), 4);
        assert_eq!(majority_vote([1, 2, 3].into_iter()), 3);
        assert_eq!(majority_vote(std::iter::empty()), 0);
    }

    #[test]
    fn first_peer_moves_to_connected_then_synchronized() {
        let mut test = new_test_sync(4);
        let mut state = test.sync.shared.subscribe_state();

        test.sync.set_connecting();
        assert_eq!(test.sync.state(), SyncState::Connecting);

        let action = test.sync.add_new_peer(new_peer(peer(1), 0)).unwrap();
        assert!(matches!(action, SyncAction::None));
        assert_eq!(test.sync.state(), SyncState::Synchronized);
        assert!(state.borrow_and_update().is_connected());

        test.sync.disconnect(peer(1));
        assert_eq!(test.sync.state(), SyncState::Disconnected);
    }

    #[test]
    fn peer_behind_our_tip_is_dropped() {
        let mut test = new_test_sync(4);
        let genesis = test.chain.get_hash(0).unwrap().unwrap();
        for block in build_chain(genesis, 2, 0) {
            test.chain.add_block(block).unwrap();
        }

        let action = test.sync.add_new_peer(new_peer(peer(1), 1)).unwrap();
        assert!(matches!(
            action,
            SyncAction::Disconnect(_, Error::PeerBehind { peer_best: 1, our_best: 2 })
        ));
        assert!(test.sync.shared.sync_peers().is_empty());
    }

    #[test]
    fn headers_must_connect() {
        let mut test = new_test_sync(4);
        let action = test.sync.add_new_peer(new_peer(peer(1), 10)).unwrap();
        let request = headers_request(action);
        assert_eq!(request.to, peer(1));
        assert_eq!(test.sync.state(), SyncState::Sync);

        let unknown_parent = Hash256::from_bytes([7; 32]);
        let headers = build_chain(unknown_parent, 3, 0)
            .iter()
            .map(|block| block.header().clone())
            .collect();

        let action = test.sync.on_headers(headers, peer(1)).unwrap();
        assert!(matches!(
            action,
            SyncAction::Disconnect(_, Error::HeadersNotConnected(_))
        ));
    }

    #[test]
    fn windows_are_committed_in_header_order() {
        let mut test = new_test_sync(4);
        let genesis = test.chain.get_hash(0).unwrap().unwrap();
        let blocks = build_chain(genesis, 40, 0);

        let mut request = None;
        for index in 1..=3 {
            let action = test.sync.add_new_peer(new_peer(peer(index), 40)).unwrap();
            if let SyncAction::Request(SyncRequest::Headers(locator_request)) = action {
                request.replace(locator_request);
            }
        }
        let request = request.expect("Headers must be requested");
        assert_eq!(request.locator_hashes, vec![Hash256::ZERO]);
        assert_eq!(test.sync.shared.best_number(), 40);

        let headers = blocks.iter().map(|block| block.header().clone()).collect();
        let action = test.sync.on_headers(headers, request.to).unwrap();

        let requests = data_requests(action);
        assert_eq!(requests.len(), 3);
        assert_eq!(
            requests.iter().map(|(_, hashes)| hashes.len()).sum::<usize>(),
            40
        );

        let by_hash = blocks
            .iter()
            .map(|block| (block.hash(), block.clone()))
            .collect::<HashMap<_, _>>();
        let window_of = |first: Hash256| {
            requests
                .iter()
                .find(|(_, hashes)| hashes[0] == first)
                .cloned()
                .expect("Window must be requested")
        };
        let (first_peer, first_window) = window_of(blocks[0].hash());
        let (second_peer, second_window) = window_of(blocks[16].hash());

        // Later window completes first, nothing is committed yet.
        for hash in second_window.iter().rev() {
            test.sync.on_block(by_hash[hash].clone(), second_peer).unwrap();
        }
        assert!(test.import_receiver.try_recv().is_err());

        for hash in &first_window {
            test.sync.on_block(by_hash[hash].clone(), first_peer).unwrap();
        }

        let first_import = test.import_receiver.try_recv().unwrap();
        let second_import = test.import_receiver.try_recv().unwrap();
        assert_eq!(
            first_import
                .blocks
                .iter()
                .map(Block::hash)
                .collect::<Vec<_>>(),
            first_window
        );
        assert_eq!(
            second_import
                .blocks
                .iter()
                .map(Block::hash)
                .collect::<Vec<_>>(),
            second_window
        );
    }

    #[test]
    fn window_of_disconnected_peer_is_requeued() {
        let mut test = new_test_sync(1);
        let genesis = test.chain.get_hash(0).unwrap().unwrap();
        let blocks = build_chain(genesis, 5, 0);

        let request = headers_request(test.sync.add_new_peer(new_peer(peer(1), 5)).unwrap());
        let headers = blocks.iter().map(|block| block.header().clone()).collect();
        let requests = data_requests(test.sync.on_headers(headers, request.to).unwrap());
        assert_eq!(requests, vec![(peer(1), blocks.iter().map(Block::hash).collect())]);

        test.sync.add_new_peer(new_peer(peer(2), 5)).unwrap();
        let requests = data_requests(test.sync.disconnect(peer(1)));
        assert_eq!(requests, vec![(peer(2), blocks.iter().map(Block::hash).collect())]);
        assert_eq!(test.sync.inflight_windows[&peer(2)].seq, 0);
    }

    #[test]
    fn headers_timeout_disconnects_the_peer() {
        let mut test = new_test_sync(4);
        headers_request(test.sync.add_new_peer(new_peer(peer(1), 10)).unwrap());

        if let Some(request) = test.sync.headers_request.as_mut() {
            request.sent_at = Instant::now()
                .checked_sub(HEADERS_TIMEOUT + Duration::from_secs(1))
                .unwrap();
        }

        let action = test.sync.on_tick().unwrap();
        assert!(matches!(
            action,
            SyncAction::Disconnect(peer_id, Error::HeadersTimeout) if peer_id == peer(1)
        ));
    }

    #[test]
    fn unconnected_block_after_sync_is_misbehaviour() {
        let mut test = new_test_sync(4);
        test.sync.add_new_peer(new_peer(peer(1), 0)).unwrap();
        assert_eq!(test.sync.state(), SyncState::Synchronized);

        let orphan = build_chain(Hash256::from_bytes([9; 32]), 1, 0).remove(0);
        let action = test.sync.on_block(orphan, peer(1)).unwrap();
        assert!(matches!(
            action,
            SyncAction::Disconnect(_, Error::UnconnectedBlock(_))
        ));

        let genesis = test.chain.get_hash(0).unwrap().unwrap();
        let child = build_chain(genesis, 1, 0).remove(0);
        let action = test.sync.on_block(child, peer(1)).unwrap();
        assert!(matches!(action, SyncAction::None));
        assert!(test.import_receiver.try_recv().is_ok());
        assert_eq!(test.sync.shared.best_number(), 1);
    }

    #[test]
    fn announced_blocks_are_requested_once() {
        let mut test = new_test_sync(4);
        test.sync.add_new_peer(new_peer(peer(1), 0)).unwrap();
        test.sync.add_new_peer(new_peer(peer(2), 0)).unwrap();

        let genesis = test.chain.get_hash(0).unwrap().unwrap();
        let new_block = Hash256::from_bytes([3; 32]);

        let requests = data_requests(
            test.sync
                .on_block_inv(vec![genesis, new_block], peer(1))
                .unwrap(),
        );
        assert_eq!(requests, vec![(peer(1), vec![new_block])]);

        let action = test.sync.on_block_inv(vec![new_block], peer(2)).unwrap();
        assert!(matches!(action, SyncAction::None));
    }
}
