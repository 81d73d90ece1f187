//! The SPV coordinator: a single-owner reactor over peer events and client
//! requests. It drives header sync, schedules merkle-block and transaction
//! downloads across peers, delivers blocks to the wallet strictly in chain
//! order, and recovers from stalls, disconnects and rescans. All state lives
//! in [`SpvState`] and is touched only from this task.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use finch_chain::{BlockAction, ChainAction, HeaderChain, HeaderNode};
use finch_consensus::Hash256;
use finch_primitives::block::BlockHeader;
use finch_primitives::bloom::BloomFilter;
use finch_primitives::hash256_to_hex;
use finch_primitives::transaction::Transaction;
use finch_storage::KeyValueStore;
use tokio::sync::mpsc;

use crate::p2p::{
    DecodedMerkleBlock, Inventory, Message, PeerEvent, VersionPayload, MSG_BLOCK,
    MSG_FILTERED_BLOCK, MSG_TX,
};
use crate::peers::{PeerId, PeerRegistry, PeerState};
use crate::wallet::WalletSink;

/// Largest merkle-block batch handed to a single peer.
const MERKLE_BATCH_LIMIT: usize = 500;
/// Inflight requests older than this are abandoned and re-scheduled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(120);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

/// Requests from the wallet/client side. Fire-and-forget; effects surface
/// through the [`WalletSink`].
#[derive(Debug)]
pub enum ClientRequest {
    UpdateBloom(BloomFilter),
    PublishTx(Transaction),
    Rescan(u32),
    Heartbeat,
}

#[derive(Clone, Debug)]
pub struct InflightBlock {
    pub height: u32,
    pub hash: Hash256,
    pub issued_at: Instant,
}

#[derive(Clone, Debug)]
pub struct InflightTx {
    pub txid: Hash256,
    pub issued_at: Instant,
}

#[derive(Default)]
pub struct SpvState {
    /// Peer currently driving header sync, if catching up.
    pub sync_peer: Option<PeerId>,
    /// Wallet-supplied filter; merkle downloads are gated on its presence.
    pub bloom: Option<BloomFilter>,
    /// Download queue, ascending height then insertion order.
    pub blocks_to_download: BTreeMap<u32, Vec<Hash256>>,
    /// Out-of-order arrivals waiting for their turn to import.
    pub received_merkle: BTreeMap<u32, Vec<DecodedMerkleBlock>>,
    /// Transactions seen outside a merkle block before sync completed.
    pub solo_txs: Vec<Transaction>,
    /// Client transactions waiting for a connected peer.
    pub pending_broadcast: Vec<Transaction>,
    /// A rescan waiting for inflight merkle blocks to drain.
    pub pending_rescan: Option<u32>,
    /// Blocks older than this timestamp are not downloaded.
    pub fast_catchup: u32,
    /// Blocks a peer announced that we have not linked yet.
    pub peer_broadcast_blocks: HashMap<PeerId, Vec<Hash256>>,
    pub inflight_merkles: HashMap<PeerId, Vec<InflightBlock>>,
    pub inflight_txs: HashMap<PeerId, Vec<InflightTx>>,
}

pub struct SpvCoordinator<S, W> {
    chain: HeaderChain<S>,
    peers: PeerRegistry,
    wallet: W,
    state: SpvState,
    pub stall_timeout: Duration,
}

impl<S: KeyValueStore, W: WalletSink> SpvCoordinator<S, W> {
    /// Initializes the chain (genesis, pointers) and seeds the download queue
    /// from what the store already holds above the catchup floor.
    pub fn new(chain: HeaderChain<S>, wallet: W, fast_catchup: u32) -> Result<Self, String> {
        chain.init(fast_catchup).map_err(|err| err.to_string())?;
        let mut state = SpvState {
            fast_catchup,
            ..SpvState::default()
        };
        for (height, hash) in chain
            .blocks_to_download(fast_catchup)
            .map_err(|err| err.to_string())?
        {
            state.blocks_to_download.entry(height).or_default().push(hash);
        }
        Ok(Self {
            chain,
            peers: PeerRegistry::default(),
            wallet,
            state,
            stall_timeout: STALL_TIMEOUT,
        })
    }

    pub fn chain(&self) -> &HeaderChain<S> {
        &self.chain
    }

    pub fn state(&self) -> &SpvState {
        &self.state
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn wallet(&self) -> &W {
        &self.wallet
    }

    /// Reactor loop; returns when both input channels close.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<PeerEvent>,
        mut requests: mpsc::Receiver<ClientRequest>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
            }
        }
        log_info!("spv coordinator stopped");
    }

    pub async fn handle_event(&mut self, event: PeerEvent) {
        let result = match event {
            PeerEvent::Handshake {
                peer,
                addr,
                version,
                sender,
            } => self.on_handshake(peer, addr, version, sender).await,
            PeerEvent::Disconnect(peer) => self.on_disconnect(peer).await,
            PeerEvent::Inbound(peer, message) => self.on_message(peer, message).await,
            PeerEvent::MerkleAssembled(peer, dmb) => self.on_merkle(peer, dmb).await,
        };
        if let Err(err) = result {
            log_error!("spv: event handling failed: {err}");
        }
    }

    pub async fn handle_request(&mut self, request: ClientRequest) {
        let result = match request {
            ClientRequest::UpdateBloom(filter) => self.on_update_bloom(filter).await,
            ClientRequest::PublishTx(tx) => self.on_publish(tx).await,
            ClientRequest::Rescan(timestamp) => self.on_rescan(timestamp).await,
            ClientRequest::Heartbeat => self.on_heartbeat().await,
        };
        if let Err(err) = result {
            log_error!("spv: request handling failed: {err}");
        }
    }

    async fn on_message(&mut self, peer: PeerId, message: Message) -> Result<(), String> {
        match message {
            Message::Headers(headers) => self.on_headers(peer, headers).await,
            Message::Inv(inventory) => self.on_inv(peer, inventory).await,
            Message::Tx(tx) => self.on_tx(peer, tx).await,
            Message::Reject {
                message,
                code,
                reason,
            } => {
                log_warn!("peer {peer}: reject {message} ({code:#x}): {reason}");
                Ok(())
            }
            other => {
                log_debug!("peer {peer}: ignoring {} message", other.command());
                Ok(())
            }
        }
    }

    async fn on_handshake(
        &mut self,
        peer: PeerId,
        addr: SocketAddr,
        version: VersionPayload,
        sender: mpsc::Sender<Message>,
    ) -> Result<(), String> {
        log_info!(
            "peer {peer} connected: {addr} height {} {}",
            version.start_height,
            version.user_agent
        );
        self.peers.insert(
            peer,
            PeerState {
                addr,
                handshake: true,
                version: version.version,
                user_agent: version.user_agent,
                start_height: version.start_height,
                sender,
            },
        );

        if let Some(filter) = self.state.bloom.clone() {
            self.send(peer, Message::FilterLoad(filter)).await;
        }
        let queued = std::mem::take(&mut self.state.pending_broadcast);
        for tx in queued {
            log_info!("peer {peer}: flushing queued tx {}", hash256_to_hex(&tx.txid()));
            self.send(peer, Message::Tx(tx)).await;
        }
        // Always solicit headers, so a better-connected peer can take over
        // the sync role.
        let locator = self.chain.block_locator().map_err(|err| err.to_string())?;
        self.send(peer, self.getheaders(locator, [0u8; 32])).await;
        self.download_blocks(peer).await?;
        self.log_sync_status()
    }

    async fn on_disconnect(&mut self, peer: PeerId) -> Result<(), String> {
        log_info!("peer {peer} disconnected");
        if let Some(inflight) = self.state.inflight_merkles.remove(&peer) {
            log_debug!("peer {peer}: re-queueing {} inflight block(s)", inflight.len());
            for entry in inflight {
                self.queue_block(entry.height, entry.hash);
            }
        }
        self.state.inflight_txs.remove(&peer);
        self.state.peer_broadcast_blocks.remove(&peer);
        self.peers.remove(peer);

        for other in self.peers.keys() {
            self.download_blocks(other).await?;
        }
        if self.state.sync_peer == Some(peer) {
            self.state.sync_peer = None;
            let locator = self.chain.block_locator().map_err(|err| err.to_string())?;
            for other in self.peers.keys() {
                self.send(other, self.getheaders(locator.clone(), [0u8; 32]))
                    .await;
            }
        }
        Ok(())
    }

    async fn on_headers(&mut self, peer: PeerId, headers: Vec<BlockHeader>) -> Result<(), String> {
        if headers.is_empty() {
            return Ok(());
        }
        let work_before = self.chain.best_tip().map_err(|err| err.to_string())?.chain_work;
        let now = unix_now();
        let mut accepted: Vec<HeaderNode> = Vec::new();
        for header in &headers {
            match self.chain.connect_header(header, now, true) {
                Ok(ChainAction::KnownChain(_)) => {
                    log_debug!("peer {peer}: known header {}", hash256_to_hex(&header.hash()));
                }
                Ok(action) => {
                    if let ChainAction::ChainReorg { split, old, new } = &action {
                        log_info!(
                            "chain reorg at height {}: {} -> {} block(s)",
                            split.height,
                            old.len(),
                            new.len()
                        );
                    }
                    accepted.extend(action.accepted().iter().cloned());
                }
                Err(err) => {
                    log_warn!("peer {peer}: header rejected: {err}");
                }
            }
        }
        log_debug!("peer {peer}: accepted {} of {} header(s)", accepted.len(), headers.len());

        for node in &accepted {
            if node.header.time >= self.state.fast_catchup && !self.is_queued_or_inflight(&node.hash)
            {
                self.queue_block(node.height, node.hash);
            }
        }

        // An accepted header may resolve an earlier block announcement.
        for node in &accepted {
            let mut resolved: Vec<PeerId> = Vec::new();
            for (owner, hashes) in self.state.peer_broadcast_blocks.iter_mut() {
                if let Some(position) = hashes.iter().position(|hash| *hash == node.hash) {
                    hashes.remove(position);
                    resolved.push(*owner);
                }
            }
            for owner in resolved {
                self.peers.update_height(owner, node.height as i32);
            }
        }
        self.state.peer_broadcast_blocks.retain(|_, hashes| !hashes.is_empty());

        let tip = self.chain.best_tip().map_err(|err| err.to_string())?;
        if tip.chain_work > work_before {
            self.peers.update_height(peer, tip.height as i32);
            self.state.sync_peer = if self.headers_synced()? {
                None
            } else {
                Some(peer)
            };
            self.send(peer, self.getheaders(vec![tip.hash], [0u8; 32]))
                .await;
            self.log_sync_status()?;
        }

        for other in self.peers.keys() {
            self.download_blocks(other).await?;
        }
        Ok(())
    }

    async fn on_inv(&mut self, peer: PeerId, inventory: Vec<Inventory>) -> Result<(), String> {
        let mut tx_hashes: Vec<Hash256> = Vec::new();
        let mut block_hashes: Vec<Hash256> = Vec::new();
        for item in inventory {
            match item.kind {
                MSG_TX => tx_hashes.push(item.hash),
                MSG_BLOCK | MSG_FILTERED_BLOCK => block_hashes.push(item.hash),
                _ => {}
            }
        }
        self.download_txs(peer, &tx_hashes).await?;
        if block_hashes.is_empty() {
            return Ok(());
        }

        let mut best_known: Option<u32> = None;
        let mut unknown: Vec<Hash256> = Vec::new();
        for hash in &block_hashes {
            match self.chain.get_node(hash).map_err(|err| err.to_string())? {
                Some(node) => {
                    best_known = Some(best_known.map_or(node.height, |best| best.max(node.height)));
                }
                None => unknown.push(*hash),
            }
        }
        if let Some(height) = best_known {
            self.peers.update_height(peer, height as i32);
        }
        if !unknown.is_empty() {
            let locator = self.chain.block_locator().map_err(|err| err.to_string())?;
            for hash in unknown {
                log_debug!("peer {peer}: chasing announced block {}", hash256_to_hex(&hash));
                let announced = self.state.peer_broadcast_blocks.entry(peer).or_default();
                if !announced.contains(&hash) {
                    announced.push(hash);
                }
                self.send(peer, self.getheaders(locator.clone(), hash)).await;
            }
        }
        Ok(())
    }

    async fn on_tx(&mut self, peer: PeerId, tx: Transaction) -> Result<(), String> {
        let txid = tx.txid();
        log_debug!("peer {peer}: tx {}", hash256_to_hex(&txid));
        if self.merkle_synced()? {
            self.wallet.import_txs(std::slice::from_ref(&tx))?;
        } else if !self.state.solo_txs.iter().any(|known| known.txid() == txid) {
            self.state.solo_txs.push(tx);
        }
        for entries in self.state.inflight_txs.values_mut() {
            entries.retain(|entry| entry.txid != txid);
        }
        self.import_received_merkles().await
    }

    /// Hands a batch of queued blocks to `peer` if it is eligible: not the
    /// header-sync peer, bloom filter loaded, handshake done, nothing already
    /// inflight there, and no rescan pending.
    async fn download_blocks(&mut self, peer: PeerId) -> Result<(), String> {
        if self.state.sync_peer == Some(peer)
            || self.state.bloom.is_none()
            || self.state.pending_rescan.is_some()
        {
            return Ok(());
        }
        let Some(peer_state) = self.peers.get(peer) else {
            return Ok(());
        };
        if !peer_state.handshake {
            return Ok(());
        }
        let peer_height = peer_state.start_height.max(0) as u32;
        if self
            .state
            .inflight_merkles
            .get(&peer)
            .is_some_and(|entries| !entries.is_empty())
        {
            return Ok(());
        }

        let mut batch: Vec<(u32, Hash256)> = Vec::new();
        'collect: for (height, hashes) in self.state.blocks_to_download.iter() {
            for hash in hashes {
                if batch.len() == MERKLE_BATCH_LIMIT {
                    break 'collect;
                }
                batch.push((*height, *hash));
            }
        }
        // Only the prefix this peer can serve; the rest stays queued.
        let keep = batch
            .iter()
            .take_while(|(height, _)| *height <= peer_height)
            .count();
        batch.truncate(keep);
        if batch.is_empty() {
            return Ok(());
        }

        for (height, hash) in &batch {
            if let Some(entry) = self.state.blocks_to_download.get_mut(height) {
                entry.retain(|queued| queued != hash);
                if entry.is_empty() {
                    self.state.blocks_to_download.remove(height);
                }
            }
        }
        let issued_at = Instant::now();
        let mut inventory = Vec::with_capacity(batch.len());
        {
            let inflight = self.state.inflight_merkles.entry(peer).or_default();
            for (height, hash) in &batch {
                inflight.push(InflightBlock {
                    height: *height,
                    hash: *hash,
                    issued_at,
                });
                inventory.push(Inventory {
                    kind: MSG_FILTERED_BLOCK,
                    hash: *hash,
                });
            }
        }
        log_debug!("peer {peer}: requesting {} merkle block(s)", inventory.len());
        self.send(peer, Message::GetData(inventory)).await;
        // The pong for this ping marks the tail of the batch on the wire.
        self.send(peer, Message::Ping(0)).await;
        Ok(())
    }

    async fn download_txs(&mut self, peer: PeerId, hashes: &[Hash256]) -> Result<(), String> {
        if hashes.is_empty() {
            return Ok(());
        }
        let issued_at = Instant::now();
        {
            let entries = self.state.inflight_txs.entry(peer).or_default();
            entries.retain(|entry| !hashes.contains(&entry.txid));
            for hash in hashes {
                entries.push(InflightTx {
                    txid: *hash,
                    issued_at,
                });
            }
        }
        let inventory = hashes
            .iter()
            .map(|hash| Inventory {
                kind: MSG_TX,
                hash: *hash,
            })
            .collect();
        self.send(peer, Message::GetData(inventory)).await;
        Ok(())
    }

    async fn on_merkle(&mut self, peer: PeerId, dmb: DecodedMerkleBlock) -> Result<(), String> {
        let hash = dmb.block_hash();
        let Some(node) = self.chain.get_node(&hash).map_err(|err| err.to_string())? else {
            log_debug!(
                "peer {peer}: dropping unsolicited merkle block {}",
                hash256_to_hex(&hash)
            );
            return Ok(());
        };

        if let Some(entries) = self.state.inflight_merkles.get_mut(&peer) {
            entries.retain(|entry| entry.hash != hash);
            if entries.is_empty() {
                self.state.inflight_merkles.remove(&peer);
            }
        }
        // Transactions folded into the assembly will never arrive solo; they
        // must not hold the import gate closed.
        for tx in &dmb.txs {
            let txid = tx.txid();
            for entries in self.state.inflight_txs.values_mut() {
                entries.retain(|entry| entry.txid != txid);
            }
        }

        let root_ok = dmb.root == node.header.merkle_root;
        if !root_ok {
            log_warn!(
                "peer {peer}: merkle root mismatch for block {} at height {}",
                hash256_to_hex(&hash),
                node.height
            );
        }

        match self.state.pending_rescan {
            None => {
                if root_ok {
                    self.state
                        .received_merkle
                        .entry(node.height)
                        .or_default()
                        .push(dmb);
                    self.import_received_merkles().await?;
                    self.download_blocks(peer).await?;
                }
            }
            Some(timestamp) => {
                if !self.any_inflight_merkles() {
                    self.do_rescan(timestamp).await?;
                }
            }
        }
        Ok(())
    }

    /// Imports buffered merkle blocks in ascending height order. Holds off
    /// entirely while any transaction is inflight, so a block can never
    /// overtake a tx it expects.
    async fn import_received_merkles(&mut self) -> Result<(), String> {
        if self.state.pending_rescan.is_some() {
            return Ok(());
        }
        if self.state.inflight_txs.values().any(|entries| !entries.is_empty()) {
            return Ok(());
        }
        loop {
            let mut progressed = false;
            let heights: Vec<u32> = self.state.received_merkle.keys().copied().collect();
            for height in heights {
                let candidates = self
                    .state
                    .received_merkle
                    .get(&height)
                    .cloned()
                    .unwrap_or_default();
                for dmb in candidates {
                    let hash = dmb.block_hash();
                    let Some(action) =
                        self.chain.connect_block(&hash).map_err(|err| err.to_string())?
                    else {
                        continue;
                    };
                    self.import_one(&action, &dmb)?;
                    if let Some(list) = self.state.received_merkle.get_mut(&height) {
                        list.retain(|entry| entry.block_hash() != hash);
                        if list.is_empty() {
                            self.state.received_merkle.remove(&height);
                        }
                    }
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        if self.merkle_synced()? && !self.state.solo_txs.is_empty() {
            let txs = std::mem::take(&mut self.state.solo_txs);
            log_debug!("flushing {} solo tx(s) to wallet", txs.len());
            self.wallet.import_txs(&txs)?;
        }
        Ok(())
    }

    /// Delivers one block: its transactions (wire-collected plus matching
    /// solo arrivals, deduplicated) first, then the merkle action.
    fn import_one(&mut self, action: &BlockAction, dmb: &DecodedMerkleBlock) -> Result<(), String> {
        let mut batch = dmb.txs.clone();
        let mut batch_ids: HashSet<Hash256> = batch.iter().map(|tx| tx.txid()).collect();
        let expected: HashSet<Hash256> = dmb.expected.iter().copied().collect();
        let mut remaining = Vec::with_capacity(self.state.solo_txs.len());
        for tx in std::mem::take(&mut self.state.solo_txs) {
            let txid = tx.txid();
            if expected.contains(&txid) {
                if batch_ids.insert(txid) {
                    batch.push(tx);
                }
            } else {
                remaining.push(tx);
            }
        }
        self.state.solo_txs = remaining;

        if !batch.is_empty() {
            self.wallet.import_txs(&batch)?;
        }
        self.wallet.import_merkle(action, &dmb.expected)?;
        match action {
            BlockAction::BestBlock(node) => {
                log_debug!("imported block at height {}", node.height);
            }
            BlockAction::ChainReorg { split, old, new } => {
                log_info!(
                    "block reorg at height {}: abandoned {}, imported {}",
                    split.height,
                    old.len(),
                    new.len()
                );
            }
            BlockAction::SideBlock(node) => {
                log_info!("imported side block at height {}", node.height);
            }
            BlockAction::OldBlock(node) => {
                log_debug!("re-imported old block at height {}", node.height);
            }
        }
        Ok(())
    }

    async fn on_update_bloom(&mut self, filter: BloomFilter) -> Result<(), String> {
        if filter.is_empty() {
            log_warn!("ignoring empty bloom filter; it would match nothing");
            return Ok(());
        }
        if self.state.bloom.as_ref() == Some(&filter) {
            return Ok(());
        }
        log_info!("bloom filter updated ({} bytes)", filter.data.len());
        self.state.bloom = Some(filter.clone());
        for peer in self.peers.keys() {
            self.send(peer, Message::FilterLoad(filter.clone())).await;
        }
        for peer in self.peers.keys() {
            self.download_blocks(peer).await?;
        }
        Ok(())
    }

    async fn on_publish(&mut self, tx: Transaction) -> Result<(), String> {
        let peers = self.peers.keys();
        if peers.is_empty() {
            log_info!(
                "no connected peers; holding tx {} for broadcast",
                hash256_to_hex(&tx.txid())
            );
            self.state.pending_broadcast.push(tx);
            return Ok(());
        }
        log_info!("broadcasting tx {} to {} peer(s)", hash256_to_hex(&tx.txid()), peers.len());
        for peer in peers {
            self.send(peer, Message::Tx(tx.clone())).await;
        }
        Ok(())
    }

    async fn on_rescan(&mut self, timestamp: u32) -> Result<(), String> {
        if self.any_inflight_merkles() {
            log_info!("rescan to {timestamp} deferred until inflight blocks drain");
            self.state.pending_rescan = Some(timestamp);
            return Ok(());
        }
        self.do_rescan(timestamp).await
    }

    async fn do_rescan(&mut self, timestamp: u32) -> Result<(), String> {
        self.state.blocks_to_download.clear();
        self.state.received_merkle.clear();
        self.state.fast_catchup = timestamp;
        let blocks = self.chain.rescan(timestamp).map_err(|err| err.to_string())?;
        log_info!("rescan from {timestamp}: {} block(s) to refetch", blocks.len());
        for (height, hash) in blocks {
            self.queue_block(height, hash);
        }
        self.state.pending_rescan = None;
        for peer in self.peers.keys() {
            self.download_blocks(peer).await?;
        }
        Ok(())
    }

    /// Returns timed-out requests to the queue and re-dispatches, serving
    /// well-behaved peers before the ones that stalled.
    async fn on_heartbeat(&mut self) -> Result<(), String> {
        let now = Instant::now();
        let timeout = self.stall_timeout;

        let mut stalled_blocks: Vec<(u32, Hash256)> = Vec::new();
        let mut stalled_peers: HashSet<PeerId> = HashSet::new();
        for (peer, entries) in self.state.inflight_merkles.iter_mut() {
            let before = entries.len();
            entries.retain(|entry| {
                if now.duration_since(entry.issued_at) > timeout {
                    stalled_blocks.push((entry.height, entry.hash));
                    false
                } else {
                    true
                }
            });
            if entries.len() < before {
                stalled_peers.insert(*peer);
            }
        }
        self.state.inflight_merkles.retain(|_, entries| !entries.is_empty());
        if !stalled_blocks.is_empty() {
            log_warn!("re-queueing {} stalled merkle block(s)", stalled_blocks.len());
            for (height, hash) in stalled_blocks {
                self.queue_block(height, hash);
            }
        }

        let mut order: Vec<PeerId> = self
            .peers
            .keys()
            .into_iter()
            .filter(|peer| !stalled_peers.contains(peer))
            .collect();
        order.extend(stalled_peers.iter().copied());
        for peer in order {
            self.download_blocks(peer).await?;
        }

        let mut reissue: Vec<(PeerId, Vec<Hash256>)> = Vec::new();
        for (peer, entries) in self.state.inflight_txs.iter() {
            let stalled: Vec<Hash256> = entries
                .iter()
                .filter(|entry| now.duration_since(entry.issued_at) > timeout)
                .map(|entry| entry.txid)
                .collect();
            if !stalled.is_empty() {
                reissue.push((*peer, stalled));
            }
        }
        for (peer, hashes) in reissue {
            log_warn!("peer {peer}: re-requesting {} stalled tx(s)", hashes.len());
            self.download_txs(peer, &hashes).await?;
        }
        Ok(())
    }

    fn getheaders(&self, locator: Vec<Hash256>, stop: Hash256) -> Message {
        Message::GetHeaders {
            version: self.chain.params().protocol_version as u32,
            locator,
            stop,
        }
    }

    async fn send(&self, peer: PeerId, message: Message) {
        let Some(state) = self.peers.get(peer) else {
            return;
        };
        let sender = state.sender.clone();
        if sender.send(message).await.is_err() {
            log_debug!("peer {peer}: outbound channel closed");
        }
    }

    fn queue_block(&mut self, height: u32, hash: Hash256) {
        let entry = self.state.blocks_to_download.entry(height).or_default();
        if !entry.contains(&hash) {
            entry.push(hash);
        }
    }

    fn is_queued_or_inflight(&self, hash: &Hash256) -> bool {
        self.state
            .blocks_to_download
            .values()
            .any(|hashes| hashes.contains(hash))
            || self
                .state
                .inflight_merkles
                .values()
                .any(|entries| entries.iter().any(|entry| entry.hash == *hash))
    }

    fn any_inflight_merkles(&self) -> bool {
        self.state
            .inflight_merkles
            .values()
            .any(|entries| !entries.is_empty())
    }

    fn headers_synced(&self) -> Result<bool, String> {
        let tip = self.chain.best_tip().map_err(|err| err.to_string())?;
        Ok(tip.height as i64 >= self.peers.best_height() as i64)
    }

    fn merkle_synced(&self) -> Result<bool, String> {
        self.headers_synced()
    }

    fn log_sync_status(&self) -> Result<(), String> {
        let tip = self.chain.best_tip().map_err(|err| err.to_string())?;
        log_info!(
            "sync: header height {} / network height {} ({} peer(s))",
            tip.height,
            self.peers.best_height(),
            self.peers.len()
        );
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
