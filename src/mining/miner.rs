//! Block assembly
//!
//! Builds the next block from the mempool, declares the negotiated size
//! ceiling in the xfield, and signs the header with the federation key.

use crate::core::block::{Block, XField, DEFAULT_MAX_BLOCK_SIZE, MIN_BLOCK_SIZE_FIELD};
use crate::core::script::Script;
use crate::core::transaction::Transaction;
use crate::core::validation::Rejection;
use crate::core::Blockchain;
use crate::crypto::{KeyError, KeyPair};
use crate::mining::Mempool;
use log::info;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MinerError {
    #[error("Signing failed: {0}")]
    Signing(#[from] KeyError),
    #[error("Block rejected: {0}")]
    Rejected(#[from] Rejection),
}

/// Block assembly statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    pub height: u32,
    pub tx_count: usize,
    pub fees: i64,
    /// Serialized block size
    pub size: usize,
    /// Size ceiling the block was assembled against
    pub target_size: u32,
    pub time_ms: u128,
}

/// Assembles and signs blocks
pub struct Miner {
    signing_key: KeyPair,
    payout: Script,
    /// Size this node wants blocks to have
    block_max_size: u32,
}

impl Miner {
    /// A miner paying the reward to the signing key's P2PKH script
    pub fn new(signing_key: KeyPair, block_max_size: u32) -> Self {
        let payout = Script::new_p2pkh(&signing_key.pubkey_hash());
        Self {
            signing_key,
            payout,
            block_max_size,
        }
    }

    pub fn with_payout(mut self, payout: Script) -> Self {
        self.payout = payout;
        self
    }

    pub fn payout(&self) -> &Script {
        &self.payout
    }

    /// The larger of our configured size and the size the tip declared.
    ///
    /// A declaration only covers its own block, so a raised ceiling is kept
    /// alive by declaring it again.
    pub fn target_block_size(&self, chain: &Blockchain) -> u32 {
        let tip_size = chain
            .tip()
            .declared_max_size()
            .unwrap_or(DEFAULT_MAX_BLOCK_SIZE);
        self.block_max_size.max(tip_size)
    }

    /// Build and sign the block that would extend the current tip
    pub fn assemble_block(
        &self,
        chain: &Blockchain,
        mempool: &Mempool,
    ) -> Result<(Block, MiningStats), MinerError> {
        let start = Instant::now();
        let height = chain.next_height();
        let target_size = self.target_block_size(chain);

        let xfield = if target_size != DEFAULT_MAX_BLOCK_SIZE {
            XField::MaxBlockSize(target_size)
        } else {
            XField::None
        };

        // Header and coinbase fit in the minimum ceiling
        let room = (target_size - MIN_BLOCK_SIZE_FIELD.min(target_size)) as usize;
        let selected = mempool.select_for_block(room);
        let fees: i64 = selected
            .iter()
            .filter_map(|tx| mempool.get(&tx.txid()))
            .map(|entry| entry.fee)
            .sum();

        let coinbase = Transaction::new_coinbase(
            height,
            self.payout.clone(),
            chain.params().block_reward + fees,
        );
        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(coinbase);
        transactions.extend(selected);

        let now = chrono::Utc::now().timestamp();
        let time = now.max(chain.median_time_past() + 1) as u32;

        let mut block = Block::new(chain.tip().hash(), time, xfield, transactions);
        block.sign(&self.signing_key)?;

        let stats = MiningStats {
            height,
            tx_count: block.transactions.len(),
            fees,
            size: block.size(),
            target_size,
            time_ms: start.elapsed().as_millis(),
        };
        Ok((block, stats))
    }

    /// Assemble a block, connect it, and clear its transactions from the pool
    pub fn mine_block(
        &self,
        chain: &mut Blockchain,
        mempool: &mut Mempool,
    ) -> Result<(Block, MiningStats), MinerError> {
        let (block, stats) = self.assemble_block(chain, mempool)?;
        chain.submit_block(block.clone())?;
        mempool.remove_for_block(&block, chain);

        info!(
            "Mined block {} at height {} ({} txs, {} bytes, ceiling {})",
            block.hash(),
            stats.height,
            stats.tx_count,
            stats.size,
            stats.target_size
        );
        Ok((block, stats))
    }

    /// Mine `count` blocks in a row
    pub fn mine_blocks(
        &self,
        chain: &mut Blockchain,
        mempool: &mut Mempool,
        count: usize,
    ) -> Result<Vec<Block>, MinerError> {
        (0..count)
            .map(|_| self.mine_block(chain, mempool).map(|(block, _)| block))
            .collect()
    }
}
