//! Compact block relay
//!
//! Large blocks travel as a header, a nonce and one 6-byte short id per
//! transaction. Receivers rebuild the block from transactions they already
//! hold (the recent-transaction cache and the mempool) and fetch only the
//! indexes they could not match.

use crate::core::block::{Block, BlockHeader};
use crate::core::transaction::Transaction;
use crate::crypto::{sha256, Hash256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

pub const SHORT_ID_LEN: usize = 6;

/// Recent transactions kept for reconstruction
pub const DEFAULT_TX_CACHE_SIZE: usize = 5000;

pub type ShortId = [u8; SHORT_ID_LEN];

/// First six bytes of `sha256(nonce || hash)`
pub fn short_id(nonce: u64, tx_hash: &Hash256) -> ShortId {
    let mut preimage = Vec::with_capacity(40);
    preimage.extend_from_slice(&nonce.to_le_bytes());
    preimage.extend_from_slice(tx_hash.as_bytes());
    let digest = sha256(&preimage);
    let mut id = [0u8; SHORT_ID_LEN];
    id.copy_from_slice(&digest[..SHORT_ID_LEN]);
    id
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactError {
    #[error("prefilled transaction index {0} out of range")]
    InvalidPrefilled(u32),
    #[error("short id collision")]
    ShortIdCollision,
    #[error("expected {expected} transactions, got {got}")]
    WrongTransactionCount { expected: usize, got: usize },
    #[error("reconstructed block does not match its merkle root")]
    MerkleMismatch,
}

// =============================================================================
// Compact Block
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefilledTransaction {
    /// Absolute position in the block
    pub index: u32,
    pub tx: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactBlock {
    pub header: BlockHeader,
    pub nonce: u64,
    /// One per non-prefilled transaction, in block order
    pub short_ids: Vec<ShortId>,
    pub prefilled: Vec<PrefilledTransaction>,
}

impl CompactBlock {
    /// Summarize `block`, prefilling the coinbase
    pub fn from_block(block: &Block, nonce: u64) -> Self {
        let mut prefilled = Vec::new();
        let mut short_ids = Vec::with_capacity(block.transactions.len().saturating_sub(1));
        for (index, tx) in block.transactions.iter().enumerate() {
            if index == 0 {
                prefilled.push(PrefilledTransaction {
                    index: 0,
                    tx: tx.clone(),
                });
            } else {
                short_ids.push(short_id(nonce, &tx.hash()));
            }
        }
        Self {
            header: block.header.clone(),
            nonce,
            short_ids,
            prefilled,
        }
    }

    pub fn block_hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn tx_count(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }
}

/// `getblocktxn`: transactions of a compact block the receiver could not match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTxnRequest {
    pub block_hash: Hash256,
    pub indexes: Vec<u32>,
}

/// `blocktxn`: the requested transactions, in request order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTxnResponse {
    pub block_hash: Hash256,
    pub transactions: Vec<Transaction>,
}

impl BlockTxnResponse {
    /// Answer `request` from a full block; `None` if an index is out of range
    pub fn for_request(block: &Block, request: &BlockTxnRequest) -> Option<Self> {
        let transactions = request
            .indexes
            .iter()
            .map(|index| block.transactions.get(*index as usize).cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            block_hash: request.block_hash,
            transactions,
        })
    }
}

// =============================================================================
// Transaction Cache
// =============================================================================

/// Bounded ring of recently seen transactions indexed by hash.
///
/// Holds transactions that may be absent from the mempool (rejected,
/// replaced or evicted) but are still likely to appear in a block.
#[derive(Debug)]
pub struct TxCache {
    arena: Vec<Option<Transaction>>,
    index: HashMap<Hash256, usize>,
    next: usize,
}

impl TxCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: vec![None; capacity.max(1)],
            index: HashMap::new(),
            next: 0,
        }
    }

    pub fn insert(&mut self, tx: Transaction) {
        let hash = tx.hash();
        if self.index.contains_key(&hash) {
            return;
        }
        if let Some(evicted) = self.arena[self.next].take() {
            self.index.remove(&evicted.hash());
        }
        self.index.insert(hash, self.next);
        self.arena[self.next] = Some(tx);
        self.next = (self.next + 1) % self.arena.len();
    }

    pub fn get(&self, hash: &Hash256) -> Option<&Transaction> {
        self.index
            .get(hash)
            .and_then(|slot| self.arena[*slot].as_ref())
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.arena.iter().flatten()
    }
}

impl Default for TxCache {
    fn default() -> Self {
        Self::new(DEFAULT_TX_CACHE_SIZE)
    }
}

// =============================================================================
// Reconstruction
// =============================================================================

/// A compact block being filled in
#[derive(Debug, Clone)]
pub struct PartialBlock {
    header: BlockHeader,
    slots: Vec<Option<Transaction>>,
}

impl PartialBlock {
    /// Place prefilled transactions and every candidate whose short id matches.
    ///
    /// Two different candidates (or two announced slots) sharing a short id
    /// is a collision: the caller should fetch the full block instead.
    pub fn new<'a, I>(compact: &CompactBlock, candidates: I) -> Result<Self, CompactError>
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        let count = compact.tx_count();
        let mut slots: Vec<Option<Transaction>> = vec![None; count];

        for prefilled in &compact.prefilled {
            let slot = slots
                .get_mut(prefilled.index as usize)
                .ok_or(CompactError::InvalidPrefilled(prefilled.index))?;
            if slot.is_some() {
                return Err(CompactError::InvalidPrefilled(prefilled.index));
            }
            *slot = Some(prefilled.tx.clone());
        }

        let mut by_short_id: HashMap<ShortId, usize> = HashMap::new();
        let open = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index);
        for (id, index) in compact.short_ids.iter().zip(open) {
            if by_short_id.insert(*id, index).is_some() {
                return Err(CompactError::ShortIdCollision);
            }
        }

        for tx in candidates {
            let id = short_id(compact.nonce, &tx.hash());
            let Some(index) = by_short_id.get(&id) else {
                continue;
            };
            match &slots[*index] {
                Some(existing) if existing.hash() != tx.hash() => {
                    return Err(CompactError::ShortIdCollision)
                }
                Some(_) => {}
                None => slots[*index] = Some(tx.clone()),
            }
        }

        Ok(Self {
            header: compact.header.clone(),
            slots,
        })
    }

    pub fn block_hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn missing_indexes(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Fill the missing slots in order and assemble the block.
    ///
    /// The merkle root check catches a short-id match on the wrong
    /// transaction.
    pub fn fill(mut self, missing: Vec<Transaction>) -> Result<Block, CompactError> {
        let expected = self.slots.iter().filter(|slot| slot.is_none()).count();
        if missing.len() != expected {
            return Err(CompactError::WrongTransactionCount {
                expected,
                got: missing.len(),
            });
        }
        let mut missing = missing.into_iter();
        let transactions: Vec<Transaction> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.take().or_else(|| missing.next()))
            .collect();

        let block = Block {
            header: self.header,
            transactions,
        };
        let (merkle_root, _) = block.compute_merkle_root();
        if merkle_root != block.header.merkle_root {
            return Err(CompactError::MerkleMismatch);
        }
        Ok(block)
    }
}

// =============================================================================
// Tests
// =============================================================================
