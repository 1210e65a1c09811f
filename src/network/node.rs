//! P2P Node implementation
//!
//! The node owns the chain and the mempool behind async locks, relays
//! transactions by inventory and blocks either in full or as compact
//! blocks, and answers invalid objects with reject messages.

use crate::config::{ConfigError, NodeConfig};
use crate::core::compression::{BlockTxnRequest, BlockTxnResponse, CompactBlock, PartialBlock};
use crate::core::{Block, Blockchain, ChainError, RejectCode, Rejection, Transaction, TxCache};
use crate::crypto::{Hash256, KeyError, KeyPair};
use crate::mining::{AdmitResult, BroadcastError, Mempool, Miner, MinerError};
use crate::network::message::{Handshake, InvItem, InvType, Message, RejectMessage};
use crate::network::peer::{PeerError, PeerManager};
use crate::network::server::{connect_to_peer, handle_connection, Server};
use crate::network::sync::ChainSync;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Capacity of the node event channel
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Misbehavior added for relaying an invalid block or transaction
const INVALID_OBJECT_SCORE: u32 = 10;

/// Compact blocks kept waiting for `blocktxn` at once
const MAX_PENDING_COMPACT: usize = 8;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Invalid signing key: {0}")]
    Key(#[from] KeyError),
    #[error("Mining failed: {0}")]
    Mining(#[from] MinerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Node has no signing key")]
    NoSigningKey,
    #[error("Node already started")]
    AlreadyStarted,
}

/// Things that happened on the node, for observers and tests
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected(SocketAddr),
    BlockConnected { hash: Hash256, height: u32 },
    BlockRejected { hash: Hash256, rejection: Rejection },
    TxAccepted(Hash256),
    TxRejected { txid: Hash256, rejection: Rejection },
    /// A compact block was matched against local transactions; `missing`
    /// of them had to be requested
    CompactBlockReceived { hash: Hash256, missing: usize },
    /// Reconstruction failed and the full block was requested
    FullBlockRequested(Hash256),
    RejectReceived { from: SocketAddr, reject: RejectMessage },
}

/// A compact block waiting for its `blocktxn`
struct PendingCompact {
    from: SocketAddr,
    partial: PartialBlock,
    requested_at: Instant,
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    blockchain: Arc<RwLock<Blockchain>>,
    mempool: Arc<RwLock<Mempool>>,
    peer_manager: Arc<PeerManager>,
    chain_sync: Arc<ChainSync>,
    /// Recently seen transactions, including ones the mempool refused
    tx_cache: RwLock<TxCache>,
    pending_compact: RwLock<HashMap<Hash256, PendingCompact>>,
    miner: Option<Miner>,
    events: broadcast::Sender<NodeEvent>,
    message_tx: mpsc::Sender<(SocketAddr, Message)>,
    message_rx: Mutex<Option<mpsc::Receiver<(SocketAddr, Message)>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node with a fresh chain at genesis
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        config.validate()?;

        let chain = Blockchain::new(config.chain.clone(), config.script_check_threads)?;
        let mempool = Mempool::new(config.policy.clone(), &config.chain);
        let miner = match &config.signing_key {
            Some(secret) => Some(Miner::new(
                KeyPair::from_private_key_hex(secret)?,
                config.policy.block_max_size,
            )),
            None => None,
        };

        let blockchain = Arc::new(RwLock::new(chain));
        let peer_manager = Arc::new(PeerManager::new());
        let chain_sync = Arc::new(ChainSync::new(blockchain.clone(), peer_manager.clone()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (message_tx, message_rx) = mpsc::channel(1000);

        Ok(Arc::new(Self {
            config,
            blockchain,
            mempool: Arc::new(RwLock::new(mempool)),
            peer_manager,
            chain_sync,
            tx_cache: RwLock::new(TxCache::default()),
            pending_compact: RwLock::new(HashMap::new()),
            miner,
            events,
            message_tx,
            message_rx: Mutex::new(Some(message_rx)),
            local_addr: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn blockchain(&self) -> Arc<RwLock<Blockchain>> {
        self.blockchain.clone()
    }

    pub fn mempool(&self) -> Arc<RwLock<Mempool>> {
        self.mempool.clone()
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.peer_manager.clone()
    }

    /// Receive every event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Listening address once started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn height(&self) -> u32 {
        self.blockchain.read().await.height()
    }

    pub async fn tip_hash(&self) -> Hash256 {
        self.blockchain.read().await.tip().hash()
    }

    /// Bind the listener, start the accept and message loops, and dial the
    /// bootstrap peers. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        let message_rx = self
            .message_rx
            .lock()
            .await
            .take()
            .ok_or(NodeError::AlreadyStarted)?;

        let server = Server::bind(&self.config.listen_addr, self.config.port).await?;
        let local_addr = server.local_addr();
        *self.local_addr.write().await = Some(local_addr);
        info!("Node started on {}", local_addr);

        let node = self.clone();
        let accept_task = tokio::spawn(async move { node.accept_loop(server).await });
        let node = self.clone();
        let message_task = tokio::spawn(async move { node.message_loop(message_rx).await });
        self.tasks.lock().await.extend([accept_task, message_task]);

        for peer in &self.config.bootstrap_peers {
            if let Err(e) = self.connect_to(peer).await {
                warn!("Failed to connect to bootstrap peer {}: {}", peer, e);
            }
        }

        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, server: Server) {
        loop {
            match server.accept().await {
                Ok((stream, addr)) => {
                    info!("Incoming connection from {}", addr);
                    let handshake = self.handshake().await;
                    let pm = self.peer_manager.clone();
                    let tx = self.message_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr, pm, handshake, tx, false).await
                        {
                            warn!("Connection error with {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn message_loop(self: Arc<Self>, mut message_rx: mpsc::Receiver<(SocketAddr, Message)>) {
        while let Some((from, msg)) = message_rx.recv().await {
            self.handle_message(from, msg).await;
        }
    }

    async fn handshake(&self) -> Handshake {
        let (height, tip) = {
            let chain = self.blockchain.read().await;
            (chain.height(), chain.tip().hash())
        };
        let port = self
            .local_addr()
            .await
            .map(|addr| addr.port())
            .unwrap_or(self.config.port);
        Handshake::new(&self.config.chain.network, height, tip, port)
    }

    /// Connect to a peer
    pub async fn connect_to(&self, addr: &str) -> Result<SocketAddr, PeerError> {
        info!("Connecting to peer: {}", addr);

        let (stream, peer_addr) = connect_to_peer(addr).await?;
        let handshake = self.handshake().await;
        let pm = self.peer_manager.clone();
        let message_tx = self.message_tx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, peer_addr, pm, handshake, message_tx, true).await
            {
                warn!("Connection error with {}: {}", peer_addr, e);
            }
        });

        Ok(peer_addr)
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn send(&self, to: &SocketAddr, msg: Message) {
        let name = msg.type_name();
        if let Err(e) = self.peer_manager.send_to(to, msg).await {
            warn!("Failed to send {} to {}: {}", name, to, e);
        }
    }

    /// Handle incoming messages
    async fn handle_message(&self, from: SocketAddr, msg: Message) {
        debug!("Received {} from {}", msg.type_name(), from);

        match msg {
            Message::Handshake(handshake) => {
                if handshake.network != self.config.chain.network {
                    warn!(
                        "Peer {} is on network {}, expected {}",
                        from, handshake.network, self.config.chain.network
                    );
                    self.peer_manager.remove_peer(&from).await;
                    return;
                }
                self.peer_manager.update_peer(&from, &handshake).await;
                if self.config.request_compact {
                    self.send(&from, Message::SendCmpct { enable: true }).await;
                }
                self.emit(NodeEvent::PeerConnected(from));
                self.chain_sync.check_sync().await;
            }

            Message::Inv(items) => self.handle_inv(from, items).await,

            Message::GetData(items) => self.handle_get_data(from, items).await,

            Message::NotFound(items) => {
                debug!("{} objects not found at {}", items.len(), from);
            }

            Message::Tx(tx) => {
                self.peer_manager.mark_tx_known(&from, tx.txid()).await;
                let _ = self.accept_transaction(tx, Some(from), false).await;
            }

            Message::Block(block) => {
                self.peer_manager.mark_block_known(&from, block.hash()).await;
                let _ = self.accept_block(block, Some(from)).await;
            }

            Message::SendCmpct { enable } => {
                self.peer_manager.set_compact(&from, enable).await;
            }

            Message::CmpctBlock(compact) => self.handle_compact_block(from, compact).await,

            Message::GetBlockTxn(request) => {
                let response = {
                    let chain = self.blockchain.read().await;
                    chain
                        .get_block(&request.block_hash)
                        .map(|block| BlockTxnResponse::for_request(block, &request))
                };
                match response {
                    Some(Some(response)) => self.send(&from, Message::BlockTxn(response)).await,
                    Some(None) => {
                        self.peer_manager
                            .misbehaving(&from, 100, "getblocktxn index out of range")
                            .await;
                    }
                    None => {
                        let item = InvItem::block(request.block_hash);
                        self.send(&from, Message::NotFound(vec![item])).await;
                    }
                }
            }

            Message::BlockTxn(response) => self.handle_block_txn(from, response).await,

            Message::Reject(reject) => {
                warn!(
                    "Reject from {}: {} {} {}",
                    from,
                    reject.message,
                    reject.data,
                    reject.to_rejection()
                );
                self.peer_manager.record_reject(&from).await;
                self.emit(NodeEvent::RejectReceived { from, reject });
            }

            Message::GetBlocks {
                start_height,
                count,
            } => {
                let blocks = self.chain_sync.get_blocks(start_height, count).await;
                self.send(&from, Message::Blocks(blocks)).await;
            }

            Message::Blocks(blocks) => {
                let connected = self.chain_sync.handle_blocks(blocks, from).await;
                if connected.is_empty() {
                    return;
                }
                let chain = self.blockchain.read().await;
                let mut mempool = self.mempool.write().await;
                for block in &connected {
                    mempool.remove_for_block(block, &*chain);
                }
                let height = chain.height();
                drop(mempool);
                drop(chain);

                {
                    let mut pending = self.pending_compact.write().await;
                    for block in &connected {
                        pending.remove(&block.hash());
                    }
                }

                self.peer_manager.update_height(&from, height).await;
                let start = height + 1 - connected.len() as u32;
                for (offset, block) in connected.iter().enumerate() {
                    self.emit(NodeEvent::BlockConnected {
                        hash: block.hash(),
                        height: start + offset as u32,
                    });
                }
            }

            Message::Ping(nonce) => {
                self.send(&from, Message::Pong(nonce)).await;
            }

            Message::Pong(_) => {
                // Peer is alive, nothing to do
            }
        }
    }

    async fn handle_inv(&self, from: SocketAddr, items: Vec<InvItem>) {
        let mut wanted = Vec::new();
        for item in items {
            match item.kind {
                InvType::Tx => {
                    self.peer_manager.mark_tx_known(&from, item.hash).await;
                    if !self.mempool.read().await.contains(&item.hash) {
                        wanted.push(item);
                    }
                }
                InvType::Block | InvType::CompactBlock => {
                    self.peer_manager.mark_block_known(&from, item.hash).await;
                    if !self.blockchain.read().await.contains_block(&item.hash) {
                        let kind = if self.config.request_compact {
                            InvType::CompactBlock
                        } else {
                            InvType::Block
                        };
                        wanted.push(InvItem {
                            kind,
                            hash: item.hash,
                        });
                    }
                }
            }
        }
        if !wanted.is_empty() {
            self.send(&from, Message::GetData(wanted)).await;
        }
    }

    async fn handle_get_data(&self, from: SocketAddr, items: Vec<InvItem>) {
        let mut not_found = Vec::new();
        for item in items {
            let msg = match item.kind {
                InvType::Tx => {
                    let mempool = self.mempool.read().await;
                    mempool.get(&item.hash).map(|entry| Message::Tx(entry.tx.clone()))
                }
                InvType::Block => {
                    let chain = self.blockchain.read().await;
                    chain.get_block(&item.hash).cloned().map(Message::Block)
                }
                InvType::CompactBlock => {
                    let chain = self.blockchain.read().await;
                    chain
                        .get_block(&item.hash)
                        .map(|block| Message::CmpctBlock(CompactBlock::from_block(block, rand::random())))
                }
            };
            match msg {
                Some(msg) => {
                    if item.kind != InvType::Tx {
                        self.peer_manager.mark_block_known(&from, item.hash).await;
                    }
                    self.send(&from, msg).await;
                }
                None => not_found.push(item),
            }
        }
        if !not_found.is_empty() {
            self.send(&from, Message::NotFound(not_found)).await;
        }
    }

    async fn handle_compact_block(&self, from: SocketAddr, compact: CompactBlock) {
        let hash = compact.block_hash();
        self.peer_manager.mark_block_known(&from, hash).await;
        if self.blockchain.read().await.contains_block(&hash) {
            return;
        }

        let partial = {
            let cache = self.tx_cache.read().await;
            let mempool = self.mempool.read().await;
            PartialBlock::new(&compact, cache.iter().chain(mempool.transactions()))
        };
        let partial = match partial {
            Ok(partial) => partial,
            Err(e) => {
                self.request_full_block(from, hash, &e.to_string()).await;
                return;
            }
        };

        let missing = partial.missing_indexes();
        self.emit(NodeEvent::CompactBlockReceived {
            hash,
            missing: missing.len(),
        });

        if missing.is_empty() {
            match partial.fill(Vec::new()) {
                Ok(block) => {
                    let _ = self.accept_block(block, Some(from)).await;
                }
                Err(e) => self.request_full_block(from, hash, &e.to_string()).await,
            }
            return;
        }

        debug!(
            "Compact block {} from {} is missing {} of {} transactions",
            hash,
            from,
            missing.len(),
            compact.tx_count()
        );
        self.add_pending_compact(hash, from, partial).await;
        let request = BlockTxnRequest {
            block_hash: hash,
            indexes: missing,
        };
        self.send(&from, Message::GetBlockTxn(request)).await;
    }

    /// Park a compact block until its `blocktxn` arrives.
    ///
    /// Entries from peers that are gone are dropped first, then the oldest
    /// ones while the map is full.
    async fn add_pending_compact(&self, hash: Hash256, from: SocketAddr, partial: PartialBlock) {
        let connected: HashSet<SocketAddr> =
            self.peer_manager.get_peers().await.into_iter().collect();
        let mut pending = self.pending_compact.write().await;
        pending.retain(|_, entry| connected.contains(&entry.from));
        while pending.len() >= MAX_PENDING_COMPACT {
            let oldest = pending
                .iter()
                .min_by_key(|(_, entry)| entry.requested_at)
                .map(|(hash, _)| *hash);
            match oldest {
                Some(oldest) => {
                    debug!("Dropping stale compact block {}", oldest);
                    pending.remove(&oldest);
                }
                None => break,
            }
        }
        pending.insert(
            hash,
            PendingCompact {
                from,
                partial,
                requested_at: Instant::now(),
            },
        );
    }

    async fn handle_block_txn(&self, from: SocketAddr, response: BlockTxnResponse) {
        let hash = response.block_hash;
        let pending = self.pending_compact.write().await.remove(&hash);
        let Some(pending) = pending else {
            debug!("Unrequested blocktxn for {} from {}", hash, from);
            return;
        };
        if pending.from != from {
            debug!("blocktxn for {} from {}, requested from {}", hash, from, pending.from);
        }

        {
            let mut cache = self.tx_cache.write().await;
            for tx in &response.transactions {
                cache.insert(tx.clone());
            }
        }

        match pending.partial.fill(response.transactions) {
            Ok(block) => {
                let _ = self.accept_block(block, Some(from)).await;
            }
            Err(e) => self.request_full_block(from, hash, &e.to_string()).await,
        }
    }

    async fn request_full_block(&self, from: SocketAddr, hash: Hash256, reason: &str) {
        info!(
            "Compact block {} from {} failed ({}), requesting full block",
            hash, from, reason
        );
        self.emit(NodeEvent::FullBlockRequested(hash));
        self.send(&from, Message::GetData(vec![InvItem::block(hash)]))
            .await;
    }

    /// Validate and connect `block`, then announce it to peers that do not
    /// have it
    async fn accept_block(&self, block: Block, from: Option<SocketAddr>) -> Result<Hash256, Rejection> {
        let hash = block.hash();
        let (result, height) = {
            let mut chain = self.blockchain.write().await;
            let result = chain.submit_block(block.clone());
            if result.is_ok() {
                let mut mempool = self.mempool.write().await;
                mempool.remove_for_block(&block, &*chain);
            }
            (result, chain.height())
        };

        match &result {
            Ok(_) => {
                self.pending_compact.write().await.remove(&hash);
                info!("Connected block {} at height {}", hash, height);
                self.emit(NodeEvent::BlockConnected { hash, height });
                if let Some(peer) = from {
                    self.peer_manager.update_height(&peer, height).await;
                }
                self.announce_block(&block, from).await;
            }
            Err(rejection) => {
                if rejection.code == Some(RejectCode::Duplicate) {
                    return result;
                }
                match from {
                    Some(peer) if rejection.reason == "prev-blk-not-found" => {
                        debug!("Block {} from {} does not connect, syncing", hash, peer);
                        self.chain_sync.request_from(peer).await;
                    }
                    Some(peer) => {
                        warn!("Rejected block {} from {}: {}", hash, peer, rejection);
                        if rejection.code.is_some() {
                            let reject = RejectMessage::block(rejection, hash);
                            self.send(&peer, Message::Reject(reject)).await;
                        }
                        if rejection.code == Some(RejectCode::Invalid) {
                            self.peer_manager
                                .misbehaving(&peer, INVALID_OBJECT_SCORE, &rejection.reason)
                                .await;
                        }
                    }
                    None => warn!("Rejected block {}: {}", hash, rejection),
                }
                self.emit(NodeEvent::BlockRejected {
                    hash,
                    rejection: rejection.clone(),
                });
            }
        }
        result
    }

    async fn accept_transaction(
        &self,
        tx: Transaction,
        from: Option<SocketAddr>,
        allow_high_fees: bool,
    ) -> Result<Hash256, BroadcastError> {
        let txid = tx.txid();
        self.tx_cache.write().await.insert(tx.clone());

        let (result, is_new) = {
            let chain = self.blockchain.read().await;
            let mut mempool = self.mempool.write().await;
            let is_new = !mempool.contains(&txid);
            (mempool.broadcast(tx, &*chain, allow_high_fees), is_new)
        };

        match &result {
            Ok(_) if is_new => {
                info!("Accepted tx {} into mempool", txid);
                self.emit(NodeEvent::TxAccepted(txid));
                self.relay_transaction(txid, from).await;
            }
            Ok(_) => {}
            Err(e) => {
                let rejection = e.to_rejection();
                debug!("Rejected tx {}: {}", txid, rejection);
                if let (Some(peer), Some(code)) = (from, rejection.code) {
                    self.send(&peer, Message::Reject(RejectMessage::tx(&rejection, txid)))
                        .await;
                    if code == RejectCode::Invalid {
                        self.peer_manager
                            .misbehaving(&peer, INVALID_OBJECT_SCORE, &rejection.reason)
                            .await;
                    }
                }
                self.emit(NodeEvent::TxRejected { txid, rejection });
            }
        }
        result
    }

    async fn relay_transaction(&self, txid: Hash256, except: Option<SocketAddr>) {
        let targets = self.peer_manager.tx_relay_targets(txid, except.as_ref()).await;
        for peer in targets {
            self.send(&peer, Message::Inv(vec![InvItem::tx(txid)])).await;
        }
    }

    /// Push `block` to peers that have not seen it: compact when it is
    /// large or the peer asked for compact blocks, in full otherwise
    async fn announce_block(&self, block: &Block, except: Option<SocketAddr>) {
        let targets = self
            .peer_manager
            .block_relay_targets(block.hash(), except.as_ref())
            .await;
        if targets.is_empty() {
            return;
        }

        let large = block.size() > self.config.compact_threshold;
        let compact = CompactBlock::from_block(block, rand::random());
        for (peer, wants_compact) in targets {
            let msg = if large || wants_compact {
                Message::CmpctBlock(compact.clone())
            } else {
                Message::Block(block.clone())
            };
            self.send(&peer, msg).await;
        }
    }

    // =========================================================================
    // Local submission
    // =========================================================================

    /// Admit a transaction to the mempool and relay it
    pub async fn submit_transaction(
        &self,
        tx: Transaction,
        allow_high_fees: bool,
    ) -> Result<Hash256, BroadcastError> {
        self.accept_transaction(tx, None, allow_high_fees).await
    }

    /// Evaluate transactions against the mempool without admitting them
    pub async fn test_admit(
        &self,
        txs: &[Transaction],
        allow_high_fees: bool,
    ) -> BTreeMap<Hash256, AdmitResult> {
        let chain = self.blockchain.read().await;
        let mempool = self.mempool.read().await;
        mempool.test_admit(txs, &*chain, allow_high_fees)
    }

    /// Connect a block built elsewhere and announce it
    pub async fn submit_block(&self, block: Block) -> Result<Hash256, Rejection> {
        self.accept_block(block, None).await
    }

    /// Assemble, connect and announce the next block
    pub async fn mine_block(&self) -> Result<Block, NodeError> {
        let miner = self.miner.as_ref().ok_or(NodeError::NoSigningKey)?;
        let (block, height) = {
            let mut chain = self.blockchain.write().await;
            let mut mempool = self.mempool.write().await;
            let (block, stats) = miner.mine_block(&mut chain, &mut mempool)?;
            (block, stats.height)
        };

        self.emit(NodeEvent::BlockConnected {
            hash: block.hash(),
            height,
        });
        self.announce_block(&block, None).await;
        Ok(block)
    }

    pub async fn mine_blocks(&self, count: usize) -> Result<Vec<Block>, NodeError> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(self.mine_block().await?);
        }
        Ok(blocks)
    }

    /// Get node status
    pub async fn status(&self) -> NodeStatus {
        let (height, tip) = {
            let chain = self.blockchain.read().await;
            (chain.height(), chain.tip().hash())
        };
        let mempool_size = self.mempool.read().await.len();

        NodeStatus {
            addr: self.local_addr().await,
            height,
            tip,
            peers: self.peer_manager.connected_count().await,
            mempool_size,
            syncing: self.chain_sync.is_syncing().await,
        }
    }

    /// Stop accepting, stop handling messages and drop every peer
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for peer in self.peer_manager.get_peers().await {
            self.peer_manager.remove_peer(&peer).await;
        }
        info!("Node shut down");
    }
}

/// Node status information
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub addr: Option<SocketAddr>,
    pub height: u32,
    pub tip: Hash256,
    pub peers: usize,
    pub mempool_size: usize,
    pub syncing: bool,
}
