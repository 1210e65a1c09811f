//! Peer management for P2P networking
//!
//! Tracks connected peers, what each of them already knows about, and how
//! badly each has behaved.

use crate::crypto::Hash256;
use crate::network::message::{Handshake, Message};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

/// Maximum number of connected peers
pub const MAX_PEERS: usize = 16;

/// Misbehavior score at which a peer is disconnected
pub const DISCONNECT_SCORE: u32 = 100;

/// Per-peer cap on remembered inventory hashes
const MAX_KNOWN_INVENTORY: usize = 50_000;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
}

/// Peer connection state
#[derive(Debug, Clone, PartialEq)]
pub enum PeerState {
    Connecting,
    Connected,
}

/// Bounded set of hashes a peer is known to have
#[derive(Debug, Clone, Default)]
pub struct KnownInventory {
    hashes: HashSet<Hash256>,
}

impl KnownInventory {
    /// Returns false if the hash was already known
    pub fn insert(&mut self, hash: Hash256) -> bool {
        if self.hashes.len() >= MAX_KNOWN_INVENTORY {
            self.hashes.clear();
        }
        self.hashes.insert(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub state: PeerState,
    /// Chain height from the peer's handshake
    pub height: u32,
    pub best_hash: Hash256,
    pub user_agent: String,
    pub outbound: bool,
    /// Peer asked for compact block announcements
    pub wants_compact: bool,
    /// Blocks announced by or to this peer
    pub known_blocks: KnownInventory,
    /// Transactions announced by or to this peer
    pub known_txs: KnownInventory,
    /// Reject messages this peer sent us
    pub rejects_received: u32,
    pub misbehavior: u32,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, outbound: bool) -> Self {
        Self {
            addr,
            state: PeerState::Connecting,
            height: 0,
            best_hash: Hash256::ZERO,
            user_agent: String::new(),
            outbound,
            wants_compact: false,
            known_blocks: KnownInventory::default(),
            known_txs: KnownInventory::default(),
            rejects_received: 0,
            misbehavior: 0,
        }
    }

    pub fn update_from_handshake(&mut self, handshake: &Handshake) {
        self.height = handshake.height;
        self.best_hash = handshake.best_hash;
        self.user_agent = handshake.user_agent.clone();
        self.state = PeerState::Connected;
        self.known_blocks.insert(handshake.best_hash);
    }
}

/// Handle for sending messages to a peer
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub async fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.send(msg).await.map_err(|_| PeerError::Disconnected)
    }
}

/// Manages all peer connections
pub struct PeerManager {
    /// Connected peers info
    peers: RwLock<HashMap<SocketAddr, PeerInfo>>,
    /// Peer message senders; dropping one closes the connection
    handles: RwLock<HashMap<SocketAddr, PeerHandle>>,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Add a new peer
    pub async fn add_peer(
        &self,
        addr: SocketAddr,
        handle: PeerHandle,
        outbound: bool,
    ) -> Result<(), PeerError> {
        let mut peers = self.peers.write().await;

        if peers.len() >= MAX_PEERS {
            return Err(PeerError::MaxPeersReached);
        }

        peers.insert(addr, PeerInfo::new(addr, outbound));

        let mut handles = self.handles.write().await;
        handles.insert(addr, handle);

        log::info!("Added peer: {} (outbound: {})", addr, outbound);
        Ok(())
    }

    /// Remove a peer
    pub async fn remove_peer(&self, addr: &SocketAddr) {
        let mut peers = self.peers.write().await;
        let removed = peers.remove(addr).is_some();

        let mut handles = self.handles.write().await;
        handles.remove(addr);

        if removed {
            log::info!("Removed peer: {}", addr);
        }
    }

    /// Update peer info after handshake
    pub async fn update_peer(&self, addr: &SocketAddr, handshake: &Handshake) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.update_from_handshake(handshake);
            log::info!(
                "Peer {} connected: height={}, agent={}",
                addr,
                handshake.height,
                handshake.user_agent
            );
        }
    }

    /// Record a height the peer reached after the handshake
    pub async fn update_height(&self, addr: &SocketAddr, height: u32) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.height = peer.height.max(height);
        }
    }

    pub async fn set_compact(&self, addr: &SocketAddr, enable: bool) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.wants_compact = enable;
        }
    }

    pub async fn mark_block_known(&self, addr: &SocketAddr, hash: Hash256) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.known_blocks.insert(hash);
        }
    }

    pub async fn mark_tx_known(&self, addr: &SocketAddr, txid: Hash256) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.known_txs.insert(txid);
        }
    }

    /// Connected peers that have not seen block `hash`, with their compact
    /// preference. Every returned peer is marked as knowing the block.
    pub async fn block_relay_targets(
        &self,
        hash: Hash256,
        except: Option<&SocketAddr>,
    ) -> Vec<(SocketAddr, bool)> {
        let mut peers = self.peers.write().await;
        peers
            .values_mut()
            .filter(|p| p.state == PeerState::Connected && Some(&p.addr) != except)
            .filter_map(|p| p.known_blocks.insert(hash).then_some((p.addr, p.wants_compact)))
            .collect()
    }

    /// Connected peers that have not seen transaction `txid`; returned peers
    /// are marked as knowing it
    pub async fn tx_relay_targets(
        &self,
        txid: Hash256,
        except: Option<&SocketAddr>,
    ) -> Vec<SocketAddr> {
        let mut peers = self.peers.write().await;
        peers
            .values_mut()
            .filter(|p| p.state == PeerState::Connected && Some(&p.addr) != except)
            .filter_map(|p| p.known_txs.insert(txid).then_some(p.addr))
            .collect()
    }

    pub async fn record_reject(&self, addr: &SocketAddr) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.rejects_received += 1;
        }
    }

    /// Add to a peer's misbehavior score, disconnecting it at
    /// [`DISCONNECT_SCORE`]. Returns true if the peer was dropped.
    pub async fn misbehaving(&self, addr: &SocketAddr, howmuch: u32, reason: &str) -> bool {
        let score = {
            let mut peers = self.peers.write().await;
            let Some(peer) = peers.get_mut(addr) else {
                return false;
            };
            peer.misbehavior = peer.misbehavior.saturating_add(howmuch);
            peer.misbehavior
        };
        log::warn!(
            "Peer {} misbehaving (+{} = {}): {}",
            addr,
            howmuch,
            score,
            reason
        );

        if score >= DISCONNECT_SCORE {
            self.remove_peer(addr).await;
            return true;
        }
        false
    }

    /// Get all connected peer addresses
    pub async fn get_peers(&self) -> Vec<SocketAddr> {
        let peers = self.peers.read().await;
        peers.keys().cloned().collect()
    }

    /// Get peer info
    pub async fn get_peer_info(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        let peers = self.peers.read().await;
        peers.get(addr).cloned()
    }

    /// Get all peer infos
    pub async fn get_all_peer_info(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.values().cloned().collect()
    }

    /// Peers that completed the handshake
    pub async fn connected_count(&self) -> usize {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Get peer count
    pub async fn peer_count(&self) -> usize {
        let peers = self.peers.read().await;
        peers.len()
    }

    /// Broadcast a message to all peers
    pub async fn broadcast(&self, msg: Message) {
        let handles = self.handles.read().await;
        for (addr, handle) in handles.iter() {
            if let Err(e) = handle.send(msg.clone()).await {
                log::warn!("Failed to send to {}: {}", addr, e);
            }
        }
    }

    /// Broadcast a message to all peers except one
    pub async fn broadcast_except(&self, msg: Message, except: &SocketAddr) {
        let handles = self.handles.read().await;
        for (addr, handle) in handles.iter() {
            if addr != except {
                if let Err(e) = handle.send(msg.clone()).await {
                    log::warn!("Failed to send to {}: {}", addr, e);
                }
            }
        }
    }

    /// Send a message to a specific peer
    pub async fn send_to(&self, addr: &SocketAddr, msg: Message) -> Result<(), PeerError> {
        let handle = {
            let handles = self.handles.read().await;
            handles.get(addr).cloned()
        };
        match handle {
            Some(handle) => handle.send(msg).await,
            None => Err(PeerError::Disconnected),
        }
    }

    /// Get the peer with the highest chain
    pub async fn get_best_peer(&self) -> Option<(SocketAddr, u32)> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|(_, p)| p.state == PeerState::Connected)
            .max_by_key(|(_, p)| p.height)
            .map(|(addr, p)| (*addr, p.height))
    }
}
