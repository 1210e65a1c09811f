//! Chain synchronization with peers
//!
//! Catches up with a longer peer by requesting consecutive block batches,
//! and provides [`wait_until`] for callers that need to observe
//! asynchronous relay.

use crate::core::{Block, Blockchain};
use crate::network::message::Message;
use crate::network::peer::PeerManager;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Blocks to request per batch
pub const SYNC_BATCH_SIZE: u32 = 50;

/// Poll interval of [`wait_until`]
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Poll `predicate` until it holds or `timeout` elapses.
///
/// Returns whether the predicate was satisfied.
pub async fn wait_until<F, Fut>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Chain synchronization manager
pub struct ChainSync {
    blockchain: Arc<RwLock<Blockchain>>,
    peer_manager: Arc<PeerManager>,
    syncing: RwLock<bool>,
}

impl ChainSync {
    pub fn new(blockchain: Arc<RwLock<Blockchain>>, peer_manager: Arc<PeerManager>) -> Self {
        Self {
            blockchain,
            peer_manager,
            syncing: RwLock::new(false),
        }
    }

    /// Check if we need to sync and start sync if needed
    pub async fn check_sync(&self) -> bool {
        let our_height = {
            let chain = self.blockchain.read().await;
            chain.height()
        };

        if let Some((peer_addr, peer_height)) = self.peer_manager.get_best_peer().await {
            if peer_height > our_height {
                log::info!(
                    "Peer {} has higher chain ({} vs {}), starting sync",
                    peer_addr,
                    peer_height,
                    our_height
                );
                self.start_sync(peer_addr, our_height + 1).await;
                return true;
            }
        }

        false
    }

    /// Request blocks from `peer` regardless of its advertised height.
    ///
    /// Used when a relayed block does not connect to our tip.
    pub async fn request_from(&self, peer: SocketAddr) {
        let start_height = {
            let chain = self.blockchain.read().await;
            chain.next_height()
        };
        self.start_sync(peer, start_height).await;
    }

    async fn start_sync(&self, peer: SocketAddr, start_height: u32) {
        let mut syncing = self.syncing.write().await;
        if *syncing {
            return;
        }
        *syncing = true;
        drop(syncing);

        let msg = Message::GetBlocks {
            start_height,
            count: SYNC_BATCH_SIZE,
        };

        if let Err(e) = self.peer_manager.send_to(&peer, msg).await {
            log::warn!("Failed to request blocks from {}: {}", peer, e);
            *self.syncing.write().await = false;
        }
    }

    /// Connect a batch from a `GetBlocks` response.
    ///
    /// Returns the blocks that were connected, in order. Requests the next
    /// batch when this one was full.
    pub async fn handle_blocks(&self, blocks: Vec<Block>, from: SocketAddr) -> Vec<Block> {
        let full_batch = blocks.len() == SYNC_BATCH_SIZE as usize;
        let mut connected = Vec::new();

        let mut chain = self.blockchain.write().await;
        for block in blocks {
            let hash = block.hash();
            if chain.contains_block(&hash) {
                continue;
            }
            match chain.submit_block(block.clone()) {
                Ok(_) => connected.push(block),
                Err(rejection) => {
                    log::warn!("Failed to connect synced block {}: {}", hash, rejection);
                    break;
                }
            }
        }
        let current_height = chain.height();
        drop(chain);

        if !connected.is_empty() {
            log::info!(
                "Synced {} blocks from {}, height now {}",
                connected.len(),
                from,
                current_height
            );
        }

        if full_batch && !connected.is_empty() {
            let msg = Message::GetBlocks {
                start_height: current_height + 1,
                count: SYNC_BATCH_SIZE,
            };
            if let Err(e) = self.peer_manager.send_to(&from, msg).await {
                log::warn!("Failed to continue sync: {}", e);
                *self.syncing.write().await = false;
            }
        } else {
            *self.syncing.write().await = false;
            log::debug!("Sync with {} complete", from);
        }

        connected
    }

    /// Get blocks for a peer request
    pub async fn get_blocks(&self, start_height: u32, count: u32) -> Vec<Block> {
        let chain = self.blockchain.read().await;
        chain.blocks_from(start_height, count.min(SYNC_BATCH_SIZE) as usize)
    }

    /// Check if currently syncing
    pub async fn is_syncing(&self) -> bool {
        *self.syncing.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainParams, PolicyConfig, REGTEST_FEDERATION_SECRET};
    use crate::crypto::KeyPair;
    use crate::mining::{Mempool, Miner};

    fn chain() -> Blockchain {
        Blockchain::new(ChainParams::default(), 1).unwrap()
    }

    #[tokio::test]
    async fn test_chain_sync_creation() {
        let blockchain = Arc::new(RwLock::new(chain()));
        let peer_manager = Arc::new(PeerManager::new());
        let sync = ChainSync::new(blockchain, peer_manager);

        assert!(!sync.is_syncing().await);
        assert!(!sync.check_sync().await);
    }

    #[tokio::test]
    async fn test_handle_blocks_connects_in_order() {
        let params = ChainParams::default();
        let mut source = chain();
        let mut mempool = Mempool::new(PolicyConfig::default(), &params);
        let key = KeyPair::from_private_key_hex(REGTEST_FEDERATION_SECRET).unwrap();
        let miner = Miner::new(key, params.default_max_block_size);
        miner.mine_blocks(&mut source, &mut mempool, 3).unwrap();

        let blockchain = Arc::new(RwLock::new(chain()));
        let sync = ChainSync::new(blockchain.clone(), Arc::new(PeerManager::new()));
        let from = SocketAddr::from(([127, 0, 0, 1], 1));

        let connected = sync.handle_blocks(source.blocks_from(1, 10), from).await;
        assert_eq!(connected.len(), 3);
        assert_eq!(blockchain.read().await.tip().hash(), source.tip().hash());

        // Replaying the batch connects nothing
        assert!(sync.handle_blocks(source.blocks_from(1, 10), from).await.is_empty());

        let served = sync.get_blocks(2, 10).await;
        assert_eq!(served.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_until() {
        let flag = Arc::new(RwLock::new(false));
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            *setter.write().await = true;
        });

        let observed = wait_until(
            || {
                let flag = flag.clone();
                async move { *flag.read().await }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(observed);

        assert!(!wait_until(|| async { false }, Duration::from_millis(60)).await);
    }
}
