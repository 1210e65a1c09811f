//! Blockchain implementation
//!
//! The active chain, its coin set and the federation key schedule.
//! [`Blockchain::submit_block`] runs the full block admission pipeline:
//! context-free checks, proof, header context, per-transaction input and
//! lock checks, then script verification (optionally on a worker pool),
//! and only then commits.

use crate::config::{ChainParams, ConfigError};
use crate::core::block::{Block, XField, BLOCK_SIZE_PER_SIGOP, MAX_FUTURE_BLOCK_TIME};
use crate::core::chain_state::{median_time_past, CoinSet, CoinsView};
use crate::core::interpreter::{verify_script, ScriptError, ScriptFlags, TransactionSignatureChecker};
use crate::core::script::{Script, ScriptBuilder};
use crate::core::softfork::SoftForkGate;
use crate::core::transaction::{Coin, OutPoint, Transaction};
use crate::core::validation::{
    block_size_ceiling, calculate_sequence_locks, check_block, check_tx_inputs,
    evaluate_sequence_locks, is_final_tx, legacy_sigop_count, p2sh_sigop_count, RejectCode,
    Rejection,
};
use crate::crypto::Hash256;
use log::{debug, info};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors constructing a chain (validation outcomes are [`Rejection`]s)
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// One input's script verification, deferred until all cheap checks pass
struct ScriptCheck<'a> {
    tx: &'a Transaction,
    input_index: usize,
    script_pubkey: Script,
}

impl ScriptCheck<'_> {
    fn run(&self, flags: ScriptFlags) -> Result<(), ScriptError> {
        let checker = TransactionSignatureChecker::new(self.tx, self.input_index);
        verify_script(
            &self.tx.inputs[self.input_index].script_sig,
            &self.script_pubkey,
            flags,
            &checker,
        )
    }
}

/// Coins created and spent by the block being connected, over the chain's set
struct PendingCoins<'a> {
    chain: &'a Blockchain,
    added: HashMap<OutPoint, Coin>,
    spent: HashSet<OutPoint>,
}

impl<'a> PendingCoins<'a> {
    fn new(chain: &'a Blockchain) -> Self {
        Self {
            chain,
            added: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    fn apply(&mut self, tx: &Transaction, height: u32) {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if self.added.remove(&input.prevout).is_none() {
                    self.spent.insert(input.prevout);
                }
            }
        }
        let txid = tx.txid();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.script_pubkey.is_unspendable() {
                continue;
            }
            self.added.insert(
                OutPoint::new(txid, vout as u32),
                Coin {
                    output: output.clone(),
                    height,
                    is_coinbase: tx.is_coinbase(),
                },
            );
        }
    }
}

impl CoinsView for PendingCoins<'_> {
    fn lookup_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if self.spent.contains(outpoint) {
            return None;
        }
        self.added
            .get(outpoint)
            .cloned()
            .or_else(|| self.chain.lookup_coin(outpoint))
    }

    fn current_height(&self) -> u32 {
        self.chain.current_height()
    }

    fn tip_hash(&self) -> Hash256 {
        self.chain.tip_hash()
    }

    fn median_time_past_at(&self, height: u32) -> i64 {
        self.chain.median_time_past_at(height)
    }
}

/// The active chain
pub struct Blockchain {
    params: ChainParams,
    gate: SoftForkGate,
    blocks: Vec<Block>,
    index: HashMap<Hash256, u32>,
    times: Vec<u32>,
    coins: CoinSet,
    /// (first height the key signs, key), ascending
    federation_keys: Vec<(u32, Vec<u8>)>,
    script_pool: Option<rayon::ThreadPool>,
}

impl Blockchain {
    /// Create a chain holding only the genesis block.
    ///
    /// `script_check_threads` above one verifies block scripts in parallel.
    pub fn new(params: ChainParams, script_check_threads: usize) -> Result<Self, ChainError> {
        let federation_key = params.federation_key_bytes()?;
        let genesis = Block::genesis(&federation_key, params.genesis_time, params.block_reward);
        let genesis_hash = genesis.hash();

        let script_pool = if script_check_threads > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(script_check_threads)
                    .build()?,
            )
        } else {
            None
        };

        let mut index = HashMap::new();
        index.insert(genesis_hash, 0);
        Ok(Self {
            gate: SoftForkGate::new(&params),
            times: vec![genesis.header.time],
            blocks: vec![genesis],
            index,
            coins: CoinSet::new(),
            federation_keys: vec![(1, federation_key.to_vec())],
            params,
            script_pool,
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn gate(&self) -> &SoftForkGate {
        &self.gate
    }

    pub fn height(&self) -> u32 {
        self.blocks.len() as u32 - 1
    }

    pub fn tip(&self) -> &Block {
        // Never empty: genesis is inserted at construction
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn block_at(&self, height: u32) -> Option<&Block> {
        self.blocks.get(height as usize)
    }

    pub fn get_block(&self, hash: &Hash256) -> Option<&Block> {
        self.index
            .get(hash)
            .and_then(|height| self.blocks.get(*height as usize))
    }

    pub fn contains_block(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u32> {
        self.index.get(hash).copied()
    }

    /// Up to `limit` consecutive blocks starting at `height`
    pub fn blocks_from(&self, height: u32, limit: usize) -> Vec<Block> {
        self.blocks
            .iter()
            .skip(height as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn coins(&self) -> &CoinSet {
        &self.coins
    }

    /// Median time past of the tip
    pub fn median_time_past(&self) -> i64 {
        median_time_past(&self.times)
    }

    /// Federation key that must sign the block at `height`
    pub fn federation_key_at(&self, height: u32) -> &[u8] {
        self.federation_keys
            .iter()
            .rev()
            .find(|(from, _)| *from <= height)
            .map(|(_, key)| key.as_slice())
            .unwrap_or(&self.federation_keys[0].1)
    }

    /// Validate `block` and, if valid, append it to the active chain
    pub fn submit_block(&mut self, block: Block) -> Result<Hash256, Rejection> {
        let hash = block.hash();
        match self.connect_block(&block) {
            Ok(()) => {
                info!(
                    "Accepted block {} at height {} ({} txs, {} bytes)",
                    hash,
                    self.height(),
                    block.transactions.len(),
                    block.size()
                );
                Ok(hash)
            }
            Err(rejection) => {
                info!("Rejected block {}: {}", hash, rejection);
                Err(rejection)
            }
        }
    }

    fn connect_block(&mut self, block: &Block) -> Result<(), Rejection> {
        let hash = block.hash();
        if self.index.contains_key(&hash) {
            return Err(Rejection::new(RejectCode::Duplicate, "duplicate"));
        }

        check_block(block)?;

        let Some(prev_height) = self.index.get(&block.header.prev_hash).copied() else {
            return Err(Rejection::invalid("prev-blk-not-found"));
        };
        if prev_height != self.height() {
            // Competing branches are not tracked
            return Err(Rejection::uncoded("inconclusive-not-best-prevblk"));
        }
        let height = prev_height + 1;

        if !block.header.verify_proof(self.federation_key_at(height)) {
            return Err(Rejection::invalid("bad-blk-proof"));
        }

        let prev_mtp = self.median_time_past();
        if block.header.time as i64 <= prev_mtp {
            return Err(Rejection::invalid("time-too-old"));
        }
        let now = chrono::Utc::now().timestamp();
        if block.header.time as i64 > now + MAX_FUTURE_BLOCK_TIME as i64 {
            return Err(Rejection::invalid("time-too-new"));
        }

        if block
            .transactions
            .iter()
            .any(|tx| !is_final_tx(tx, height, prev_mtp))
        {
            return Err(Rejection::invalid("bad-txns-nonfinal"));
        }

        let expected_prefix = ScriptBuilder::new().push_int(height as i64).into_script();
        let coinbase = &block.transactions[0];
        if !coinbase.inputs[0].script_sig.as_bytes().starts_with(expected_prefix.as_bytes())
            || coinbase.lock_time != height
        {
            return Err(Rejection::invalid("bad-cb-height"));
        }

        let ceiling = block_size_ceiling(block) as usize;
        let max_sigops = ceiling / BLOCK_SIZE_PER_SIGOP as usize;
        let mut sigops = 0usize;
        let mut fees: i64 = 0;
        let mut checks = Vec::new();
        let mut pending = PendingCoins::new(self);

        for tx in &block.transactions {
            // Outputs may not land on a coin that is still unspent
            let txid = tx.txid();
            if (0..tx.outputs.len() as u32)
                .any(|vout| pending.lookup_coin(&OutPoint::new(txid, vout)).is_some())
            {
                return Err(Rejection::invalid("bad-txns-BIP30"));
            }

            sigops += legacy_sigop_count(tx);
            if tx.is_coinbase() {
                pending.apply(tx, height);
                continue;
            }

            fees += check_tx_inputs(tx, &pending, height, self.params.coinbase_maturity)?;

            let mut prev_heights = Vec::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                // check_tx_inputs has resolved every input
                if let Some(coin) = pending.lookup_coin(&input.prevout) {
                    prev_heights.push(coin.height);
                    checks.push(ScriptCheck {
                        tx,
                        input_index: prev_heights.len() - 1,
                        script_pubkey: coin.output.script_pubkey,
                    });
                }
            }
            let locks = calculate_sequence_locks(tx, &prev_heights, |h| {
                self.median_time_past_at(h)
            });
            if !evaluate_sequence_locks(height, prev_mtp, locks) {
                return Err(Rejection::invalid("bad-txns-nonfinal"));
            }

            sigops += p2sh_sigop_count(tx, &pending);
            pending.apply(tx, height);
        }
        if sigops > max_sigops {
            return Err(Rejection::invalid("bad-blk-sigops"));
        }

        let reward = self.params.block_reward + fees;
        let coinbase_value = block.transactions[0].total_output().unwrap_or(i64::MAX);
        if coinbase_value > reward {
            return Err(Rejection::invalid("bad-cb-amount"));
        }

        let flags = self.gate.flags_at(height);
        self.run_script_checks(&checks, flags)?;
        drop(pending);

        // Commit
        for tx in &block.transactions {
            self.coins.apply_transaction(tx, height);
        }
        if let XField::AggregatePubkey(key) = &block.header.xfield {
            self.federation_keys.push((height + 1, key.clone()));
            info!("Federation key rotates at height {}", height + 1);
        }
        self.index.insert(hash, height);
        self.times.push(block.header.time);
        self.blocks.push(block.clone());
        Ok(())
    }

    /// Parallel mode reports a generic cause; sequential mode the exact one
    fn run_script_checks(&self, checks: &[ScriptCheck<'_>], flags: ScriptFlags) -> Result<(), Rejection> {
        match &self.script_pool {
            Some(pool) => {
                let failed = pool.install(|| checks.par_iter().any(|check| check.run(flags).is_err()));
                if failed {
                    return Err(Rejection::invalid("block-validation-failed"));
                }
            }
            None => {
                for check in checks {
                    if let Err(err) = check.run(flags) {
                        debug!(
                            "Script failure in {} input {}: {}",
                            check.tx.txid(),
                            check.input_index,
                            err
                        );
                        return Err(Rejection::invalid(format!(
                            "mandatory-script-verify-flag-failed ({})",
                            err
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Chain view for the block after the tip
    pub fn next_height(&self) -> u32 {
        self.height() + 1
    }
}

impl CoinsView for Blockchain {
    fn lookup_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.get(outpoint).cloned()
    }

    fn current_height(&self) -> u32 {
        self.height()
    }

    fn tip_hash(&self) -> Hash256 {
        self.tip().hash()
    }

    fn median_time_past_at(&self, height: u32) -> i64 {
        let end = (height as usize + 1).min(self.times.len());
        median_time_past(&self.times[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REGTEST_FEDERATION_SECRET;
    use crate::core::transaction::{sign_p2pkh, TransactionBuilder, COIN};
    use crate::crypto::KeyPair;

    fn federation() -> KeyPair {
        KeyPair::from_private_key_hex(REGTEST_FEDERATION_SECRET).unwrap()
    }

    fn chain() -> Blockchain {
        Blockchain::new(ChainParams::default(), 1).unwrap()
    }

    fn next_block(chain: &Blockchain, txs: Vec<Transaction>, xfield: XField, key: &KeyPair) -> Block {
        let height = chain.next_height();
        let payout = Script::new_p2pkh(&key.pubkey_hash());
        let mut all = vec![Transaction::new_coinbase(height, payout, chain.params().block_reward)];
        all.extend(txs);
        let time = chain.tip().header.time + 1;
        let mut block = Block::new(chain.tip().hash(), time, xfield, all);
        block.sign(key).unwrap();
        block
    }

    #[test]
    fn test_genesis() {
        let chain = chain();
        assert_eq!(chain.height(), 0);
        assert_eq!(
            chain.federation_key_at(1),
            federation().public_key_bytes().as_slice()
        );
    }

    #[test]
    fn test_submit_and_spend_after_maturity() {
        let mut chain = chain();
        let key = federation();
        let first = next_block(&chain, vec![], XField::None, &key);
        let coinbase = first.transactions[0].clone();
        chain.submit_block(first).unwrap();

        for _ in 0..100 {
            let block = next_block(&chain, vec![], XField::None, &key);
            chain.submit_block(block).unwrap();
        }

        let prev_script = Script::new_p2pkh(&key.pubkey_hash());
        let mut spend = TransactionBuilder::new()
            .add_input(OutPoint::new(coinbase.txid(), 0))
            .add_output(49 * COIN, Script::new_p2pkh(&[5u8; 20]))
            .build();
        sign_p2pkh(&mut spend, 0, &prev_script, &key).unwrap();

        let block = next_block(&chain, vec![spend.clone()], XField::None, &key);
        chain.submit_block(block).unwrap();
        assert!(chain.coins().contains(&OutPoint::new(spend.txid(), 0)));
        assert!(!chain.coins().contains(&OutPoint::new(coinbase.txid(), 0)));
    }

    #[test]
    fn test_old_coinbase_stays_spendable() {
        let mut chain = chain();
        let key = federation();
        let first = next_block(&chain, vec![], XField::None, &key);
        let coinbase = first.transactions[0].clone();
        chain.submit_block(first).unwrap();
        for _ in 0..104 {
            let block = next_block(&chain, vec![], XField::None, &key);
            chain.submit_block(block).unwrap();
        }
        assert_eq!(chain.height(), 105);

        let funding = OutPoint::new(coinbase.txid(), 0);
        let coin = chain.lookup_coin(&funding).unwrap();
        assert_eq!(coin.height, 1);
        assert!(coin.is_coinbase);

        let prev_script = Script::new_p2pkh(&key.pubkey_hash());
        let mut spend = TransactionBuilder::new()
            .add_input(funding)
            .add_output(49 * COIN, Script::new_p2pkh(&[5u8; 20]))
            .build();
        sign_p2pkh(&mut spend, 0, &prev_script, &key).unwrap();
        let block = next_block(&chain, vec![spend.clone()], XField::None, &key);
        chain.submit_block(block).unwrap();

        // Mining the same transaction again would overwrite its unspent outputs
        let replay = next_block(&chain, vec![spend], XField::None, &key);
        let tip = chain.tip_hash();
        assert_eq!(
            chain.submit_block(replay).unwrap_err().reason,
            "bad-txns-BIP30"
        );
        assert_eq!(chain.tip_hash(), tip);
    }

    #[test]
    fn test_bad_proof_leaves_tip_unchanged() {
        let mut chain = chain();
        let block = next_block(&chain, vec![], XField::None, &KeyPair::generate());
        let tip = chain.tip_hash();
        let err = chain.submit_block(block).unwrap_err();
        assert_eq!(err.to_string(), "16: bad-blk-proof");
        assert_eq!(chain.tip_hash(), tip);
    }

    #[test]
    fn test_duplicate_and_unknown_parent() {
        let mut chain = chain();
        let key = federation();
        let block = next_block(&chain, vec![], XField::None, &key);
        chain.submit_block(block.clone()).unwrap();
        assert_eq!(chain.submit_block(block).unwrap_err().reason, "duplicate");

        let mut orphan = next_block(&chain, vec![], XField::None, &key);
        orphan.header.prev_hash = Hash256([7u8; 32]);
        orphan.sign(&key).unwrap();
        assert_eq!(
            chain.submit_block(orphan).unwrap_err().reason,
            "prev-blk-not-found"
        );
    }

    #[test]
    fn test_coinbase_height_and_amount() {
        let mut chain = chain();
        let key = federation();

        let mut wrong_height = next_block(&chain, vec![], XField::None, &key);
        wrong_height.transactions[0] =
            Transaction::new_coinbase(9, Script::new(), chain.params().block_reward);
        wrong_height.update_merkle_roots();
        wrong_height.sign(&key).unwrap();
        assert_eq!(
            chain.submit_block(wrong_height).unwrap_err().reason,
            "bad-cb-height"
        );

        let mut stale_lock = next_block(&chain, vec![], XField::None, &key);
        stale_lock.transactions[0].lock_time = 0;
        stale_lock.update_merkle_roots();
        stale_lock.sign(&key).unwrap();
        assert_eq!(
            chain.submit_block(stale_lock).unwrap_err().reason,
            "bad-cb-height"
        );

        let mut greedy = next_block(&chain, vec![], XField::None, &key);
        greedy.transactions[0].outputs[0].value += 1;
        greedy.update_merkle_roots();
        greedy.sign(&key).unwrap();
        assert_eq!(chain.submit_block(greedy).unwrap_err().reason, "bad-cb-amount");
    }

    #[test]
    fn test_time_too_old() {
        let mut chain = chain();
        let key = federation();
        let mut block = next_block(&chain, vec![], XField::None, &key);
        block.header.time = chain.tip().header.time;
        block.sign(&key).unwrap();
        assert_eq!(chain.submit_block(block).unwrap_err().reason, "time-too-old");
    }

    #[test]
    fn test_federation_key_rotation() {
        let mut chain = chain();
        let old = federation();
        let new = KeyPair::generate();

        let rotate = next_block(
            &chain,
            vec![],
            XField::AggregatePubkey(new.public_key_bytes().to_vec()),
            &old,
        );
        chain.submit_block(rotate).unwrap();

        let still_old = next_block(&chain, vec![], XField::None, &old);
        assert_eq!(chain.submit_block(still_old).unwrap_err().reason, "bad-blk-proof");
        let signed_by_new = next_block(&chain, vec![], XField::None, &new);
        chain.submit_block(signed_by_new).unwrap();
        assert_eq!(chain.height(), 2);
    }
}
