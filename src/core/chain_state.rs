//! Chain state views
//!
//! The [`CoinsView`] capability the validators consult, an in-memory
//! [`CoinSet`] implementing it, and the median-time-past helper used by
//! lock time and block time checks.

use crate::core::transaction::{Coin, OutPoint, Transaction};
use crate::crypto::Hash256;
use std::collections::HashMap;

/// Number of blocks used for Median Time Past calculation
pub const MTP_BLOCK_COUNT: usize = 11;

/// Read access to the unspent coin set and the chain tip it reflects
pub trait CoinsView {
    fn lookup_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    /// Height of the tip block
    fn current_height(&self) -> u32;

    fn tip_hash(&self) -> Hash256;

    /// Median time past of the block at `height` on the active chain
    fn median_time_past_at(&self, height: u32) -> i64;
}

/// Unspent outputs keyed by outpoint
#[derive(Debug, Clone, Default)]
pub struct CoinSet {
    coins: HashMap<OutPoint, Coin>,
}

impl CoinSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, coin);
    }

    pub fn spend(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.remove(outpoint)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.coins.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    /// Spend `tx`'s inputs and add its outputs at `height`.
    /// Provably unspendable outputs never enter the set.
    pub fn apply_transaction(&mut self, tx: &Transaction, height: u32) {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                self.coins.remove(&input.prevout);
            }
        }
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.script_pubkey.is_unspendable() {
                continue;
            }
            self.coins.insert(
                OutPoint::new(txid, vout as u32),
                Coin {
                    output: output.clone(),
                    height,
                    is_coinbase,
                },
            );
        }
    }

    /// Whether any output of `txid` is still unspent
    pub fn has_outputs_of(&self, txid: &Hash256, output_count: usize) -> bool {
        (0..output_count as u32).any(|vout| self.coins.contains_key(&OutPoint::new(*txid, vout)))
    }
}

/// A bare coin set has no chain behind it
impl CoinsView for CoinSet {
    fn lookup_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.get(outpoint).cloned()
    }

    fn current_height(&self) -> u32 {
        0
    }

    fn tip_hash(&self) -> Hash256 {
        Hash256::ZERO
    }

    fn median_time_past_at(&self, _height: u32) -> i64 {
        0
    }
}

/// Median of the last [`MTP_BLOCK_COUNT`] timestamps ending at the slice end
pub fn median_time_past(times: &[u32]) -> i64 {
    let start = times.len().saturating_sub(MTP_BLOCK_COUNT);
    let mut window: Vec<u32> = times[start..].to_vec();
    if window.is_empty() {
        return 0;
    }
    window.sort_unstable();
    window[window.len() / 2] as i64
}
