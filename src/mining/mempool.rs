//! Transaction pool (mempool) for pending transactions
//!
//! Admission runs consensus checks, relay policy, Replace-By-Fee rules and
//! ancestor/descendant package limits, then verifies scripts under the
//! standard flag set. [`Mempool::test_admit`] reports the outcome without
//! touching the pool; [`Mempool::broadcast`] admits.

use crate::config::{ChainParams, PolicyConfig};
use crate::core::block::{Block, DEFAULT_MAX_BLOCK_SIZE};
use crate::core::chain_state::CoinsView;
use crate::core::interpreter::{verify_script, ScriptFlags, TransactionSignatureChecker};
use crate::core::softfork::SoftForkGate;
use crate::core::transaction::{Coin, OutPoint, Transaction};
use crate::core::validation::{
    calculate_sequence_locks, check_transaction, check_tx_inputs, evaluate_sequence_locks,
    is_final_tx, RejectCode, Rejection,
};
use crate::crypto::Hash256;
use crate::mining::policy::{are_inputs_standard, fee_for_size, is_standard_tx};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Why [`Mempool::broadcast`] refused a transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("transaction already in block chain")]
    AlreadyKnown,
    #[error("transaction conflicts with the mempool")]
    MempoolConflict,
    #[error("Missing inputs")]
    MissingInputs,
    #[error("{0}")]
    Rejected(Rejection),
}

impl From<Rejection> for BroadcastError {
    fn from(rejection: Rejection) -> Self {
        if rejection.is_missing_inputs() {
            return BroadcastError::MissingInputs;
        }
        match (rejection.code, rejection.reason.as_str()) {
            (Some(RejectCode::Duplicate), "txn-already-known") => BroadcastError::AlreadyKnown,
            (Some(RejectCode::Duplicate), "txn-mempool-conflict") => {
                BroadcastError::MempoolConflict
            }
            _ => BroadcastError::Rejected(rejection),
        }
    }
}

impl BroadcastError {
    /// The rejection as relayed to peers
    pub fn to_rejection(&self) -> Rejection {
        match self {
            BroadcastError::AlreadyKnown => {
                Rejection::new(RejectCode::Duplicate, "txn-already-known")
            }
            BroadcastError::MempoolConflict => {
                Rejection::new(RejectCode::Duplicate, "txn-mempool-conflict")
            }
            BroadcastError::MissingInputs => Rejection::missing_inputs(),
            BroadcastError::Rejected(rejection) => rejection.clone(),
        }
    }
}

/// Per-transaction outcome of [`Mempool::test_admit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmitResult {
    pub allowed: bool,
    #[serde(rename = "reject-reason", skip_serializing_if = "Option::is_none", default)]
    pub reject_reason: Option<String>,
}

impl AdmitResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reject_reason: None,
        }
    }

    pub fn rejected(rejection: &Rejection) -> Self {
        Self {
            allowed: false,
            reject_reason: Some(rejection.to_string()),
        }
    }
}

// =============================================================================
// Mempool Entry
// =============================================================================

/// Entry in the mempool with metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    pub fee: i64,
    /// Serialized size in bytes
    pub size: usize,
    /// When the transaction was added (Unix timestamp)
    pub time: i64,
    /// Chain height when the transaction was added
    pub height: u32,
}

impl MempoolEntry {
    fn new(tx: Transaction, fee: i64, height: u32) -> Self {
        Self {
            txid: tx.txid(),
            size: tx.size(),
            time: chrono::Utc::now().timestamp(),
            tx,
            fee,
            height,
        }
    }

    /// Outpoints this entry consumes
    pub fn prevouts(&self) -> impl Iterator<Item = &OutPoint> {
        self.tx.inputs.iter().map(|input| &input.prevout)
    }

    /// Fee per 1000 bytes
    pub fn fee_rate(&self) -> i64 {
        if self.size == 0 {
            0
        } else {
            self.fee.saturating_mul(1000) / self.size as i64
        }
    }
}

/// `a_fee / a_size > b_fee / b_size` without rounding
fn pays_more_per_byte(a_fee: i64, a_size: usize, b_fee: i64, b_size: usize) -> bool {
    (a_fee as i128) * (b_size as i128) > (b_fee as i128) * (a_size as i128)
}

// =============================================================================
// Coins view over chain + pool
// =============================================================================

/// Chain coins plus the outputs of pool transactions.
///
/// Pool outputs appear at the height of the next block.
pub struct MempoolCoinsView<'a> {
    base: &'a dyn CoinsView,
    pool: &'a Mempool,
}

impl<'a> MempoolCoinsView<'a> {
    pub fn new(base: &'a dyn CoinsView, pool: &'a Mempool) -> Self {
        Self { base, pool }
    }
}

impl CoinsView for MempoolCoinsView<'_> {
    fn lookup_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(coin) = self.base.lookup_coin(outpoint) {
            return Some(coin);
        }
        let entry = self.pool.entries.get(&outpoint.txid)?;
        let output = entry.tx.outputs.get(outpoint.vout as usize)?;
        Some(Coin {
            output: output.clone(),
            height: self.base.current_height() + 1,
            is_coinbase: false,
        })
    }

    fn current_height(&self) -> u32 {
        self.base.current_height()
    }

    fn tip_hash(&self) -> Hash256 {
        self.base.tip_hash()
    }

    fn median_time_past_at(&self, height: u32) -> i64 {
        self.base.median_time_past_at(height)
    }
}

// =============================================================================
// Mempool
// =============================================================================

/// A checked transaction ready to enter the pool
struct Admission {
    entry: MempoolEntry,
    /// Entries evicted by replacement (conflicts and their descendants)
    replaced: HashSet<Hash256>,
}

/// Memory pool for pending transactions
#[derive(Debug)]
pub struct Mempool {
    policy: PolicyConfig,
    gate: SoftForkGate,
    coinbase_maturity: u32,
    /// Entries keyed by txid
    entries: HashMap<Hash256, MempoolEntry>,
    /// Which entry spends each outpoint
    spent_by: HashMap<OutPoint, Hash256>,
}

impl Mempool {
    pub fn new(policy: PolicyConfig, params: &ChainParams) -> Self {
        Self {
            policy,
            gate: SoftForkGate::new(params),
            coinbase_maturity: params.coinbase_maturity,
            entries: HashMap::new(),
            spent_by: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Evaluate each transaction independently against the current pool
    pub fn test_admit(
        &self,
        txs: &[Transaction],
        view: &dyn CoinsView,
        allow_high_fees: bool,
    ) -> BTreeMap<Hash256, AdmitResult> {
        txs.iter()
            .map(|tx| {
                let result = match self.check_admission(tx, view, allow_high_fees) {
                    Ok(_) => AdmitResult::allowed(),
                    Err(rejection) => AdmitResult::rejected(&rejection),
                };
                (tx.txid(), result)
            })
            .collect()
    }

    /// Admit `tx`, evicting whatever it replaces.
    ///
    /// A transaction already in the pool is not an error.
    pub fn broadcast(
        &mut self,
        tx: Transaction,
        view: &dyn CoinsView,
        allow_high_fees: bool,
    ) -> Result<Hash256, BroadcastError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Ok(txid);
        }
        let admission = match self.check_admission(&tx, view, allow_high_fees) {
            Ok(admission) => admission,
            Err(rejection) => {
                debug!("Rejected tx {}: {}", txid, rejection);
                return Err(rejection.into());
            }
        };

        for replaced in &admission.replaced {
            self.remove_entry(replaced);
        }
        if !admission.replaced.is_empty() {
            info!(
                "Tx {} replaced {} mempool entries",
                txid,
                admission.replaced.len()
            );
        }
        info!(
            "Accepted tx {} (fee {}, {} bytes)",
            txid, admission.entry.fee, admission.entry.size
        );
        self.insert_entry(admission.entry);
        Ok(txid)
    }

    fn check_admission(
        &self,
        tx: &Transaction,
        chain: &dyn CoinsView,
        allow_high_fees: bool,
    ) -> Result<Admission, Rejection> {
        check_transaction(tx, DEFAULT_MAX_BLOCK_SIZE as usize)?;
        if tx.is_coinbase() {
            return Err(Rejection::invalid("coinbase"));
        }
        is_standard_tx(tx, &self.policy)?;

        let tip_height = chain.current_height();
        let next_height = tip_height + 1;
        let tip_mtp = chain.median_time_past_at(tip_height);
        if !is_final_tx(tx, next_height, tip_mtp) {
            return Err(Rejection::nonstandard("non-final"));
        }

        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(Rejection::new(RejectCode::Duplicate, "txn-already-in-mempool"));
        }

        let mut conflicts = HashSet::new();
        for input in &tx.inputs {
            if let Some(spender) = self.spent_by.get(&input.prevout) {
                let Some(existing) = self.entries.get(spender) else {
                    continue;
                };
                if !existing.tx.signals_rbf() {
                    return Err(Rejection::new(RejectCode::Duplicate, "txn-mempool-conflict"));
                }
                conflicts.insert(*spender);
            }
        }

        let view = MempoolCoinsView::new(chain, self);
        let mut prev_heights = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            match view.lookup_coin(&input.prevout) {
                Some(coin) => prev_heights.push(coin.height),
                None => {
                    let already_known = (0..tx.outputs.len() as u32)
                        .any(|vout| chain.lookup_coin(&OutPoint::new(txid, vout)).is_some());
                    if already_known {
                        return Err(Rejection::new(RejectCode::Duplicate, "txn-already-known"));
                    }
                    return Err(Rejection::missing_inputs());
                }
            }
        }

        let locks =
            calculate_sequence_locks(tx, &prev_heights, |h| chain.median_time_past_at(h));
        if !evaluate_sequence_locks(next_height, tip_mtp, locks) {
            return Err(Rejection::nonstandard("non-BIP68-final"));
        }

        let fee = check_tx_inputs(tx, &view, next_height, self.coinbase_maturity)?;

        if !are_inputs_standard(tx, &view) {
            return Err(Rejection::nonstandard("bad-txns-nonstandard-inputs"));
        }

        let entry = MempoolEntry::new(tx.clone(), fee, tip_height);
        self.check_package_limits(&entry)?;

        if fee < fee_for_size(self.policy.min_relay_fee, entry.size) {
            return Err(Rejection::new(
                RejectCode::InsufficientFee,
                "min relay fee not met",
            ));
        }
        if !allow_high_fees && fee > self.policy.max_tx_fee {
            return Err(Rejection::new(RejectCode::HighFee, "absurdly-high-fee"));
        }

        let replaced = if conflicts.is_empty() {
            HashSet::new()
        } else {
            self.check_replacement(&entry, &conflicts)?
        };

        self.check_scripts(tx, &view, next_height)?;

        Ok(Admission { entry, replaced })
    }

    /// BIP125 replacement rules; returns every entry the replacement evicts
    fn check_replacement(
        &self,
        entry: &MempoolEntry,
        conflicts: &HashSet<Hash256>,
    ) -> Result<HashSet<Hash256>, Rejection> {
        let insufficient = || Rejection::new(RejectCode::InsufficientFee, "insufficient fee");

        for conflict in conflicts.iter().filter_map(|id| self.entries.get(id)) {
            if !pays_more_per_byte(entry.fee, entry.size, conflict.fee, conflict.size) {
                return Err(insufficient());
            }
        }

        let mut evicted = HashSet::new();
        for conflict in conflicts {
            evicted.insert(*conflict);
            evicted.extend(self.descendants(conflict));
            if evicted.len() > self.policy.max_replacements {
                return Err(Rejection::nonstandard("too many potential replacements"));
            }
        }

        let original_parents: HashSet<Hash256> = conflicts
            .iter()
            .filter_map(|id| self.entries.get(id))
            .flat_map(|e| e.prevouts().map(|p| p.txid))
            .collect();
        for prevout in entry.prevouts() {
            if evicted.contains(&prevout.txid) {
                return Err(Rejection::invalid("bad-txns-spends-conflicting-tx"));
            }
            if self.entries.contains_key(&prevout.txid)
                && !original_parents.contains(&prevout.txid)
            {
                return Err(Rejection::nonstandard("replacement-adds-unconfirmed"));
            }
        }

        let replaced_fees: i64 = evicted
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.fee)
            .sum();
        if entry.fee < replaced_fees {
            return Err(insufficient());
        }
        let additional = entry.fee - replaced_fees;
        if additional < fee_for_size(self.policy.min_relay_fee, entry.size) {
            return Err(insufficient());
        }

        Ok(evicted)
    }

    /// Verify every input under the standard flags. A failure that disappears
    /// under the consensus flags alone is a policy violation, not an invalid
    /// transaction.
    fn check_scripts(
        &self,
        tx: &Transaction,
        view: &dyn CoinsView,
        next_height: u32,
    ) -> Result<(), Rejection> {
        let standard = self.gate.standard_flags(next_height);
        let consensus = self.gate.flags_at(next_height);
        for (index, input) in tx.inputs.iter().enumerate() {
            let coin = view
                .lookup_coin(&input.prevout)
                .ok_or_else(Rejection::missing_inputs)?;
            let checker = TransactionSignatureChecker::new(tx, index);
            let run = |flags: ScriptFlags| {
                verify_script(&input.script_sig, &coin.output.script_pubkey, flags, &checker)
            };
            if let Err(err) = run(standard) {
                return Err(if run(consensus).is_ok() {
                    Rejection::nonstandard(format!("non-mandatory-script-verify-flag ({})", err))
                } else {
                    Rejection::invalid(format!("mandatory-script-verify-flag-failed ({})", err))
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Package Limits (Bitcoin-style ancestor/descendant limits)
    // =========================================================================

    fn check_package_limits(&self, entry: &MempoolEntry) -> Result<(), Rejection> {
        let too_long = || Rejection::nonstandard("too-long-mempool-chain");

        let ancestors = self.ancestors_of(&entry.tx);
        let ancestor_size: usize = entry.size
            + ancestors
                .iter()
                .filter_map(|id| self.entries.get(id))
                .map(|e| e.size)
                .sum::<usize>();
        if ancestors.len() + 1 > self.policy.ancestor_limit
            || ancestor_size > self.policy.ancestor_size_limit_kb * 1000
        {
            return Err(too_long());
        }

        for ancestor in &ancestors {
            let descendants = self.descendants(ancestor);
            let descendant_size: usize = entry.size
                + self.entries.get(ancestor).map_or(0, |e| e.size)
                + descendants
                    .iter()
                    .filter_map(|id| self.entries.get(id))
                    .map(|e| e.size)
                    .sum::<usize>();
            // The ancestor itself and the new entry count toward its package
            if descendants.len() + 2 > self.policy.descendant_limit
                || descendant_size > self.policy.descendant_size_limit_kb * 1000
            {
                return Err(too_long());
            }
        }
        Ok(())
    }

    /// In-pool transactions `tx` depends on, directly or transitively
    pub fn ancestors_of(&self, tx: &Transaction) -> HashSet<Hash256> {
        let mut ancestors = HashSet::new();
        let mut stack: Vec<Hash256> = tx.inputs.iter().map(|i| i.prevout.txid).collect();
        while let Some(id) = stack.pop() {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            if ancestors.insert(id) {
                stack.extend(entry.prevouts().map(|p| p.txid));
            }
        }
        ancestors
    }

    /// In-pool transactions spending `txid`'s outputs, transitively
    pub fn descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        let mut descendants = HashSet::new();
        let mut stack = vec![*txid];
        while let Some(id) = stack.pop() {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            for vout in 0..entry.tx.outputs.len() as u32 {
                if let Some(child) = self.spent_by.get(&OutPoint::new(id, vout)) {
                    if descendants.insert(*child) {
                        stack.push(*child);
                    }
                }
            }
        }
        descendants
    }

    // =========================================================================
    // Pool maintenance
    // =========================================================================

    fn insert_entry(&mut self, entry: MempoolEntry) {
        for prevout in entry.prevouts() {
            self.spent_by.insert(*prevout, entry.txid);
        }
        self.entries.insert(entry.txid, entry);
    }

    fn remove_entry(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for prevout in entry.prevouts() {
            if self.spent_by.get(prevout) == Some(txid) {
                self.spent_by.remove(prevout);
            }
        }
        Some(entry)
    }

    /// Remove a transaction and everything that depends on it
    pub fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<Transaction> {
        let mut doomed = self.descendants(txid);
        doomed.insert(*txid);
        doomed
            .iter()
            .filter_map(|id| self.remove_entry(id))
            .map(|e| e.tx)
            .collect()
    }

    /// Drop entries mined in `block` and entries that conflict with it, then
    /// re-check the rest against the new tip
    pub fn remove_for_block(&mut self, block: &Block, chain: &dyn CoinsView) {
        let before = self.entries.len();
        for tx in &block.transactions {
            let txid = tx.txid();
            self.remove_entry(&txid);
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if let Some(conflict) = self.spent_by.get(&input.prevout).copied() {
                    self.remove_with_descendants(&conflict);
                }
            }
        }
        self.recheck(chain);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(
                "Removed {} mempool entries after block {}",
                removed,
                block.hash()
            );
        }
    }

    /// Evict entries whose inputs no longer resolve or which are no longer
    /// final for the next block
    fn recheck(&mut self, chain: &dyn CoinsView) {
        let next_height = chain.current_height() + 1;
        let tip_mtp = chain.median_time_past_at(chain.current_height());
        loop {
            let stale: Vec<Hash256> = {
                let view = MempoolCoinsView::new(chain, self);
                self.entries
                    .values()
                    .filter(|entry| {
                        !is_final_tx(&entry.tx, next_height, tip_mtp)
                            || entry
                                .prevouts()
                                .any(|prevout| view.lookup_coin(prevout).is_none())
                    })
                    .map(|entry| entry.txid)
                    .collect()
            };
            if stale.is_empty() {
                break;
            }
            for txid in &stale {
                self.remove_with_descendants(txid);
            }
        }
    }

    /// Transactions for a block of at most `max_size` bytes, highest fee rate
    /// first with every parent ahead of its children
    pub fn select_for_block(&self, max_size: usize) -> Vec<Transaction> {
        let mut candidates: Vec<&MempoolEntry> = self.entries.values().collect();
        candidates.sort_by(|a, b| {
            b.fee_rate()
                .cmp(&a.fee_rate())
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.txid.as_bytes().cmp(b.txid.as_bytes()))
        });

        let mut selected: Vec<Transaction> = Vec::new();
        let mut included: HashSet<Hash256> = HashSet::new();
        let mut used = 0usize;
        loop {
            let mut progressed = false;
            for entry in &candidates {
                if included.contains(&entry.txid) || used + entry.size > max_size {
                    continue;
                }
                let parents_ready = entry.prevouts().all(|p| {
                    !self.entries.contains_key(&p.txid) || included.contains(&p.txid)
                });
                if parents_ready {
                    used += entry.size;
                    included.insert(entry.txid);
                    selected.push(entry.tx.clone());
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        selected
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    /// Pool transaction spending `outpoint`, if any
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent_by.get(outpoint).copied()
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.entries.values().map(|e| &e.tx)
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.spent_by.clear();
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            tx_count: self.entries.len(),
            total_fees: self.entries.values().map(|e| e.fee).sum(),
            total_size: self.entries.values().map(|e| e.size).sum(),
        }
    }
}

/// Mempool statistics
#[derive(Debug, Clone, Serialize)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_fees: i64,
    pub total_size: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain_state::CoinSet;
    use crate::core::script::Script;
    use crate::core::transaction::{
        sign_p2pkh, TransactionBuilder, TxOut, COIN, SEQUENCE_FINAL, SEQUENCE_RBF_MAX,
    };
    use crate::crypto::{double_sha256, KeyPair};

    /// A coin set posing as a chain at a fixed height
    struct TestChain {
        coins: CoinSet,
        height: u32,
    }

    impl CoinsView for TestChain {
        fn lookup_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
            self.coins.lookup_coin(outpoint)
        }
        fn current_height(&self) -> u32 {
            self.height
        }
        fn tip_hash(&self) -> Hash256 {
            Hash256::ZERO
        }
        fn median_time_past_at(&self, _height: u32) -> i64 {
            1_600_000_000
        }
    }

    struct Fixture {
        chain: TestChain,
        pool: Mempool,
        key: KeyPair,
        funding: Vec<OutPoint>,
    }

    fn fixture() -> Fixture {
        let key = KeyPair::generate();
        let mut coins = CoinSet::new();
        let mut funding = Vec::new();
        for i in 0..4u8 {
            let outpoint = OutPoint::new(double_sha256(&[i]), 0);
            coins.add(
                outpoint,
                Coin {
                    output: TxOut::new(COIN, Script::new_p2pkh(&key.pubkey_hash())),
                    height: 1,
                    is_coinbase: false,
                },
            );
            funding.push(outpoint);
        }
        Fixture {
            chain: TestChain { coins, height: 200 },
            pool: Mempool::new(PolicyConfig::default(), &ChainParams::default()),
            key,
            funding,
        }
    }

    fn spend(f: &Fixture, prevout: OutPoint, value: i64, sequence: u32) -> Transaction {
        let mut tx = TransactionBuilder::new()
            .add_input_with_sequence(prevout, sequence)
            .add_output(value, Script::new_p2pkh(&f.key.pubkey_hash()))
            .build();
        sign_p2pkh(&mut tx, 0, &Script::new_p2pkh(&f.key.pubkey_hash()), &f.key).unwrap();
        tx
    }

    fn reason(f: &Fixture, tx: &Transaction) -> Option<String> {
        f.pool.test_admit(std::slice::from_ref(tx), &f.chain, false)[&tx.txid()]
            .reject_reason
            .clone()
    }

    #[test]
    fn test_admit_does_not_mutate() {
        let f = fixture();
        let tx = spend(&f, f.funding[0], COIN - 10_000, SEQUENCE_FINAL);
        assert_eq!(reason(&f, &tx), None);
        assert!(f.pool.is_empty());
    }

    #[test]
    fn test_broadcast_and_duplicate() {
        let mut f = fixture();
        let tx = spend(&f, f.funding[0], COIN - 10_000, SEQUENCE_FINAL);
        let txid = f.pool.broadcast(tx.clone(), &f.chain, false).unwrap();
        assert_eq!(txid, tx.txid());
        assert_eq!(f.pool.len(), 1);
        assert_eq!(reason(&f, &tx).unwrap(), "18: txn-already-in-mempool");
        // Re-broadcast is idempotent
        assert_eq!(f.pool.broadcast(tx, &f.chain, false), Ok(txid));
    }

    #[test]
    fn test_conflict_without_rbf() {
        let mut f = fixture();
        let first = spend(&f, f.funding[0], COIN - 10_000, SEQUENCE_FINAL);
        f.pool.broadcast(first, &f.chain, false).unwrap();

        let second = spend(&f, f.funding[0], COIN - 20_000, SEQUENCE_FINAL);
        assert_eq!(reason(&f, &second).unwrap(), "18: txn-mempool-conflict");
        assert_eq!(
            f.pool.broadcast(second, &f.chain, false),
            Err(BroadcastError::MempoolConflict)
        );
    }

    #[test]
    fn test_replace_by_fee() {
        let mut f = fixture();
        let original = spend(&f, f.funding[0], COIN - 10_000, SEQUENCE_RBF_MAX - 1);
        f.pool.broadcast(original.clone(), &f.chain, false).unwrap();

        let cheap = spend(&f, f.funding[0], COIN - 10_000, SEQUENCE_FINAL);
        assert_eq!(reason(&f, &cheap).unwrap(), "66: insufficient fee");

        let bump = spend(&f, f.funding[0], COIN - 20_000, SEQUENCE_FINAL);
        assert_eq!(reason(&f, &bump), None);
        f.pool.broadcast(bump.clone(), &f.chain, false).unwrap();
        assert!(!f.pool.contains(&original.txid()));
        assert!(f.pool.contains(&bump.txid()));
    }

    #[test]
    fn test_missing_inputs_and_already_known() {
        let mut f = fixture();
        let orphan = spend(&f, OutPoint::new(Hash256([0xff; 32]), 14), COIN, SEQUENCE_FINAL);
        assert_eq!(reason(&f, &orphan).unwrap(), "missing-inputs");
        assert_eq!(
            f.pool.broadcast(orphan, &f.chain, false),
            Err(BroadcastError::MissingInputs)
        );

        // Inputs gone but outputs present: the transaction was confirmed
        let confirmed = spend(&f, f.funding[0], COIN - 10_000, SEQUENCE_FINAL);
        f.chain.coins.apply_transaction(&confirmed, 201);
        assert_eq!(reason(&f, &confirmed).unwrap(), "18: txn-already-known");
    }

    #[test]
    fn test_fee_limits() {
        let f = fixture();
        let no_fee = spend(&f, f.funding[0], COIN, SEQUENCE_FINAL);
        assert_eq!(reason(&f, &no_fee).unwrap(), "66: min relay fee not met");

        let absurd = spend(&f, f.funding[0], COIN / 2, SEQUENCE_FINAL);
        assert_eq!(reason(&f, &absurd).unwrap(), "256: absurdly-high-fee");
        let allowed = f.pool.test_admit(std::slice::from_ref(&absurd), &f.chain, true);
        assert!(allowed[&absurd.txid()].allowed);
    }

    #[test]
    fn test_non_final_and_bip68() {
        let f = fixture();
        let mut locked = TransactionBuilder::new()
            .add_input_with_sequence(f.funding[0], 0)
            .add_output(COIN - 10_000, Script::new_p2pkh(&f.key.pubkey_hash()))
            .lock_time(201)
            .build();
        sign_p2pkh(&mut locked, 0, &Script::new_p2pkh(&f.key.pubkey_hash()), &f.key).unwrap();
        assert_eq!(reason(&f, &locked).unwrap(), "64: non-final");

        // Coin at height 1, relative lock of 250 blocks
        let relative = spend(&f, f.funding[0], COIN - 10_000, 250);
        assert_eq!(reason(&f, &relative).unwrap(), "64: non-BIP68-final");
    }

    #[test]
    fn test_chained_spend_and_remove_for_block() {
        let mut f = fixture();
        let parent = spend(&f, f.funding[0], COIN - 10_000, SEQUENCE_FINAL);
        f.pool.broadcast(parent.clone(), &f.chain, false).unwrap();
        let child = spend(&f, OutPoint::new(parent.txid(), 0), COIN - 20_000, SEQUENCE_FINAL);
        f.pool.broadcast(child.clone(), &f.chain, false).unwrap();

        assert_eq!(f.pool.descendants(&parent.txid()).len(), 1);
        assert_eq!(f.pool.ancestors_of(&child).len(), 1);

        let order = f.pool.select_for_block(1_000_000);
        assert_eq!(order, vec![parent.clone(), child.clone()]);

        // A competing spend of the parent's input gets mined
        let rival = spend(&f, f.funding[0], COIN - 5_000, SEQUENCE_FINAL);
        let coinbase = Transaction::new_coinbase(201, Script::new(), 50 * COIN);
        let block = Block::new(Hash256::ZERO, 0, crate::core::block::XField::None, vec![
            coinbase,
            rival.clone(),
        ]);
        f.chain.coins.apply_transaction(&rival, 201);
        f.chain.height = 201;
        f.pool.remove_for_block(&block, &f.chain);
        assert!(f.pool.is_empty());
    }

    #[test]
    fn test_mandatory_vs_policy_script_failure() {
        let f = fixture();
        // Signed, then modified: the signature no longer matches
        let mut tx = spend(&f, f.funding[0], COIN - 10_000, SEQUENCE_FINAL);
        tx.outputs[0].script_pubkey = Script::from_bytes(vec![0x00]);
        assert_eq!(
            reason(&f, &tx).unwrap(),
            "16: mandatory-script-verify-flag-failed (Signature must be zero for failed CHECK(MULTI)SIG operation)"
        );
    }

    #[test]
    fn test_admit_result_json() {
        let ok = serde_json::to_string(&AdmitResult::allowed()).unwrap();
        assert_eq!(ok, r#"{"allowed":true}"#);
        let rejected = AdmitResult::rejected(&Rejection::nonstandard("dust"));
        let json = serde_json::to_string(&rejected).unwrap();
        assert_eq!(json, r#"{"allowed":false,"reject-reason":"64: dust"}"#);
    }
}
