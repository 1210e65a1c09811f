//! Consensus validation
//!
//! Context-free transaction and block checks, input/fee checks against a
//! coin view, absolute and relative lock time evaluation, and the
//! [`Rejection`] values every check reports.

use crate::core::block::{Block, BLOCK_SIZE_PER_SIGOP, DEFAULT_MAX_BLOCK_SIZE};
use crate::core::chain_state::CoinsView;
use crate::core::transaction::{
    money_range, Transaction, LOCKTIME_THRESHOLD, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_GRANULARITY, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// =============================================================================
// Rejections
// =============================================================================

/// Reject codes as carried by reject messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectCode {
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    InsufficientFee,
    /// Internal: fee above the configured ceiling
    HighFee,
}

impl RejectCode {
    pub fn code(self) -> u16 {
        match self {
            RejectCode::Invalid => 16,
            RejectCode::Obsolete => 17,
            RejectCode::Duplicate => 18,
            RejectCode::Nonstandard => 64,
            RejectCode::InsufficientFee => 66,
            RejectCode::HighFee => 256,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            16 => Some(RejectCode::Invalid),
            17 => Some(RejectCode::Obsolete),
            18 => Some(RejectCode::Duplicate),
            64 => Some(RejectCode::Nonstandard),
            66 => Some(RejectCode::InsufficientFee),
            256 => Some(RejectCode::HighFee),
            _ => None,
        }
    }
}

/// Why a transaction or block was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// `None` for retryable outcomes such as `missing-inputs`
    pub code: Option<RejectCode>,
    pub reason: String,
}

impl Rejection {
    pub fn new(code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::new(RejectCode::Invalid, reason)
    }

    pub fn nonstandard(reason: impl Into<String>) -> Self {
        Self::new(RejectCode::Nonstandard, reason)
    }

    pub fn uncoded(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    pub fn missing_inputs() -> Self {
        Self::uncoded("missing-inputs")
    }

    pub fn is_missing_inputs(&self) -> bool {
        self.code.is_none() && self.reason == "missing-inputs"
    }
}

/// `"<code>: <reason>"`, or just the reason when code-less
impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {}", code.code(), self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

impl std::error::Error for Rejection {}

// =============================================================================
// Transaction checks
// =============================================================================

/// Context-free checks; `max_size` is the ceiling of the enclosing block
/// (or the default ceiling for standalone admission)
pub fn check_transaction(tx: &Transaction, max_size: usize) -> Result<(), Rejection> {
    if tx.inputs.is_empty() {
        return Err(Rejection::invalid("bad-txns-vin-empty"));
    }
    if tx.outputs.is_empty() {
        return Err(Rejection::invalid("bad-txns-vout-empty"));
    }
    if tx.size() > max_size {
        return Err(Rejection::invalid("bad-txns-oversize"));
    }

    let mut total: i64 = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(Rejection::invalid("bad-txns-vout-negative"));
        }
        if !money_range(output.value) {
            return Err(Rejection::invalid("bad-txns-vout-toolarge"));
        }
        total += output.value;
        if !money_range(total) {
            return Err(Rejection::invalid("bad-txns-txouttotal-toolarge"));
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(Rejection::invalid("bad-txns-inputs-duplicate"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(Rejection::invalid("bad-cb-length"));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(Rejection::invalid("bad-txns-prevout-null"));
    }

    Ok(())
}

/// Absolute lock time check against the height and time of the block that
/// would contain `tx`
pub fn is_final_tx(tx: &Transaction, block_height: u32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD {
        block_height as i64
    } else {
        block_time
    };
    if (tx.lock_time as i64) < limit {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Earliest height and time (exclusive) at which a transaction's relative
/// locks are satisfied; -1 means unconstrained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLocks {
    pub min_height: i64,
    pub min_time: i64,
}

/// BIP-68 lock evaluation.
///
/// `prev_heights[i]` is the height at which input `i`'s coin was created
/// (the next block's height for unconfirmed parents) and `mtp_at(h)` the
/// median time past of the block at height `h`.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    prev_heights: &[u32],
    mtp_at: impl Fn(u32) -> i64,
) -> SequenceLocks {
    let mut locks = SequenceLocks {
        min_height: -1,
        min_time: -1,
    };
    if tx.is_coinbase() {
        return locks;
    }

    for (input, coin_height) in tx.inputs.iter().zip(prev_heights) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            // Time locks are measured from the MTP of the block before the coin's
            let base = mtp_at(coin_height.saturating_sub(1));
            let min_time = base + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1;
            locks.min_time = locks.min_time.max(min_time);
        } else {
            let min_height = *coin_height as i64 + value - 1;
            locks.min_height = locks.min_height.max(min_height);
        }
    }
    locks
}

/// Whether a block at `block_height` whose predecessor has median time
/// `prev_mtp` satisfies `locks`
pub fn evaluate_sequence_locks(block_height: u32, prev_mtp: i64, locks: SequenceLocks) -> bool {
    locks.min_height < block_height as i64 && locks.min_time < prev_mtp
}

/// Input checks against `view`; returns the fee.
///
/// `spend_height` is the height of the block that would include `tx`.
pub fn check_tx_inputs(
    tx: &Transaction,
    view: &dyn CoinsView,
    spend_height: u32,
    coinbase_maturity: u32,
) -> Result<i64, Rejection> {
    let mut value_in: i64 = 0;
    for input in &tx.inputs {
        let coin = view
            .lookup_coin(&input.prevout)
            .ok_or_else(|| Rejection::invalid("bad-txns-inputs-missingorspent"))?;

        if coin.is_coinbase && spend_height.saturating_sub(coin.height) < coinbase_maturity {
            return Err(Rejection::invalid("bad-txns-premature-spend-of-coinbase"));
        }

        value_in += coin.output.value;
        if !money_range(coin.output.value) || !money_range(value_in) {
            return Err(Rejection::invalid("bad-txns-inputvalues-outofrange"));
        }
    }

    let value_out = tx
        .total_output()
        .ok_or_else(|| Rejection::invalid("bad-txns-txouttotal-toolarge"))?;
    if value_in < value_out {
        return Err(Rejection::invalid("bad-txns-in-belowout"));
    }

    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(Rejection::invalid("bad-txns-fee-outofrange"));
    }
    Ok(fee)
}

// =============================================================================
// Block checks
// =============================================================================

/// Size ceiling that applies to `block`: its own declaration or the default
pub fn block_size_ceiling(block: &Block) -> u32 {
    block.declared_max_size().unwrap_or(DEFAULT_MAX_BLOCK_SIZE)
}

/// Context-free block checks (everything except the proof, which needs the
/// federation key active at the block's height)
pub fn check_block(block: &Block) -> Result<(), Rejection> {
    if !block.header.xfield.is_valid() {
        return Err(Rejection::invalid("bad-xfieldType-xfield"));
    }

    let (merkle_root, mutated) = block.compute_merkle_root();
    if merkle_root != block.header.merkle_root {
        return Err(Rejection::invalid("bad-txnmrklroot"));
    }
    if mutated {
        return Err(Rejection::invalid("bad-txns-duplicate"));
    }
    if block.compute_im_merkle_root() != block.header.im_merkle_root {
        return Err(Rejection::invalid("bad-immutablemrklroot"));
    }

    let ceiling = block_size_ceiling(block) as usize;
    if block.transactions.is_empty() || block.size() > ceiling {
        return Err(Rejection::invalid("bad-blk-length"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(Rejection::invalid("bad-cb-missing"));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(Rejection::invalid("bad-cb-multiple"));
    }

    for tx in &block.transactions {
        check_transaction(tx, ceiling)?;
    }

    let sigops: usize = block.transactions.iter().map(legacy_sigop_count).sum();
    if sigops > ceiling / BLOCK_SIZE_PER_SIGOP as usize {
        return Err(Rejection::invalid("bad-blk-sigops"));
    }

    Ok(())
}

pub fn legacy_sigop_count(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .inputs
        .iter()
        .map(|input| input.script_sig.sigop_count(false))
        .sum();
    let outputs: usize = tx
        .outputs
        .iter()
        .map(|output| output.script_pubkey.sigop_count(false))
        .sum();
    inputs + outputs
}

/// Signature operations revealed by P2SH redeem scripts of `tx`'s inputs
pub fn p2sh_sigop_count(tx: &Transaction, view: &dyn CoinsView) -> usize {
    if tx.is_coinbase() {
        return 0;
    }
    tx.inputs
        .iter()
        .filter_map(|input| {
            let coin = view.lookup_coin(&input.prevout)?;
            if coin.output.script_pubkey.is_p2sh() {
                Some(coin.output.script_pubkey.p2sh_sigop_count(&input.script_sig))
            } else {
                None
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::XField;
    use crate::core::chain_state::CoinSet;
    use crate::core::script::Script;
    use crate::core::transaction::{
        Coin, OutPoint, TransactionBuilder, TxOut, COIN, MAX_MONEY,
    };
    use crate::crypto::{double_sha256, Hash256};

    fn spend(prevout: OutPoint, value: i64) -> Transaction {
        TransactionBuilder::new()
            .add_input(prevout)
            .add_output(value, Script::new_p2pkh(&[4u8; 20]))
            .build()
    }

    fn prevout(tag: &[u8]) -> OutPoint {
        OutPoint::new(double_sha256(tag), 0)
    }

    #[test]
    fn test_structural_rejections_in_order() {
        let mut tx = spend(prevout(b"a"), COIN);

        let mut no_inputs = tx.clone();
        no_inputs.inputs.clear();
        assert_eq!(
            check_transaction(&no_inputs, 1_000_000).unwrap_err().reason,
            "bad-txns-vin-empty"
        );

        let mut no_outputs = tx.clone();
        no_outputs.outputs.clear();
        assert_eq!(
            check_transaction(&no_outputs, 1_000_000).unwrap_err().reason,
            "bad-txns-vout-empty"
        );

        assert_eq!(
            check_transaction(&tx, 10).unwrap_err().reason,
            "bad-txns-oversize"
        );

        tx.outputs[0].value = -1;
        assert_eq!(
            check_transaction(&tx, 1_000_000).unwrap_err().reason,
            "bad-txns-vout-negative"
        );
        tx.outputs[0].value = MAX_MONEY + 1;
        assert_eq!(
            check_transaction(&tx, 1_000_000).unwrap_err().reason,
            "bad-txns-vout-toolarge"
        );
        tx.outputs[0].value = MAX_MONEY;
        tx.outputs.push(TxOut::new(1, Script::new()));
        assert_eq!(
            check_transaction(&tx, 1_000_000).unwrap_err().reason,
            "bad-txns-txouttotal-toolarge"
        );
    }

    #[test]
    fn test_duplicate_and_null_inputs() {
        let mut tx = spend(prevout(b"a"), COIN);
        tx.inputs.push(tx.inputs[0].clone());
        let err = check_transaction(&tx, 1_000_000).unwrap_err();
        assert_eq!(err.to_string(), "16: bad-txns-inputs-duplicate");

        let mut null = spend(prevout(b"a"), COIN);
        null.inputs.push(crate::core::transaction::TxIn::new(OutPoint::null()));
        assert_eq!(
            check_transaction(&null, 1_000_000).unwrap_err().reason,
            "bad-txns-prevout-null"
        );
    }

    #[test]
    fn test_coinbase_length() {
        let mut coinbase = Transaction::new_coinbase(5, Script::new(), COIN);
        assert!(check_transaction(&coinbase, 1_000_000).is_ok());
        coinbase.inputs[0].script_sig = Script::from_bytes(vec![0x51]);
        assert_eq!(
            check_transaction(&coinbase, 1_000_000).unwrap_err().reason,
            "bad-cb-length"
        );
    }

    #[test]
    fn test_finality() {
        let mut tx = TransactionBuilder::new()
            .add_input_with_sequence(prevout(b"a"), 0)
            .add_output(COIN, Script::new())
            .lock_time(10)
            .build();
        assert!(!is_final_tx(&tx, 10, 0));
        assert!(is_final_tx(&tx, 11, 0));

        tx.inputs[0].sequence = SEQUENCE_FINAL;
        assert!(is_final_tx(&tx, 10, 0));
    }

    #[test]
    fn test_sequence_locks_by_height() {
        let tx = TransactionBuilder::new()
            .add_input_with_sequence(prevout(b"a"), 3)
            .add_output(COIN, Script::new())
            .build();
        let locks = calculate_sequence_locks(&tx, &[100], |_| 0);
        assert_eq!(locks.min_height, 102);
        assert!(!evaluate_sequence_locks(102, 0, locks));
        assert!(evaluate_sequence_locks(103, 0, locks));
    }

    #[test]
    fn test_sequence_lock_disabled() {
        let tx = TransactionBuilder::new()
            .add_input_with_sequence(prevout(b"a"), SEQUENCE_LOCKTIME_DISABLE_FLAG | 50)
            .add_output(COIN, Script::new())
            .build();
        let locks = calculate_sequence_locks(&tx, &[100], |_| 0);
        assert!(evaluate_sequence_locks(100, 0, locks));
    }

    #[test]
    fn test_check_tx_inputs() {
        let mut coins = CoinSet::new();
        let out = prevout(b"coinbase");
        coins.add(
            out,
            Coin {
                output: TxOut::new(50 * COIN, Script::new()),
                height: 1,
                is_coinbase: true,
            },
        );

        let tx = spend(out, 49 * COIN);
        assert_eq!(
            check_tx_inputs(&tx, &coins, 50, 100).unwrap_err().reason,
            "bad-txns-premature-spend-of-coinbase"
        );
        assert_eq!(check_tx_inputs(&tx, &coins, 101, 100), Ok(COIN));

        let greedy = spend(out, 51 * COIN);
        assert_eq!(
            check_tx_inputs(&greedy, &coins, 101, 100).unwrap_err().reason,
            "bad-txns-in-belowout"
        );

        let unknown = spend(prevout(b"nowhere"), COIN);
        assert_eq!(
            check_tx_inputs(&unknown, &coins, 101, 100).unwrap_err().reason,
            "bad-txns-inputs-missingorspent"
        );
    }

    #[test]
    fn test_check_block_merkle_and_coinbase() {
        let coinbase = Transaction::new_coinbase(1, Script::new(), COIN);
        let block = Block::new(Hash256::ZERO, 0, XField::None, vec![coinbase.clone()]);
        assert!(check_block(&block).is_ok());

        let mut tampered = block.clone();
        tampered.header.merkle_root = Hash256::ZERO;
        assert_eq!(check_block(&tampered).unwrap_err().reason, "bad-txnmrklroot");

        let two = Block::new(
            Hash256::ZERO,
            0,
            XField::None,
            vec![coinbase.clone(), Transaction::new_coinbase(2, Script::new(), COIN)],
        );
        assert_eq!(check_block(&two).unwrap_err().reason, "bad-cb-multiple");

        let missing = Block::new(Hash256::ZERO, 0, XField::None, vec![spend(prevout(b"x"), 1)]);
        assert_eq!(check_block(&missing).unwrap_err().reason, "bad-cb-missing");
    }

    #[test]
    fn test_check_block_size_field() {
        let coinbase = Transaction::new_coinbase(1, Script::new(), COIN);
        let small = Block::new(Hash256::ZERO, 0, XField::MaxBlockSize(999), vec![coinbase.clone()]);
        assert_eq!(check_block(&small).unwrap_err().reason, "bad-xfieldType-xfield");

        // A filler output pushes the block just above a declared 1000 byte ceiling
        let mut big = Transaction::new_coinbase(1, Script::new(), COIN);
        big.outputs.push(TxOut::new(0, Script::from_bytes(vec![0x51; 1000])));
        let block = Block::new(Hash256::ZERO, 0, XField::MaxBlockSize(1000), vec![big.clone()]);
        assert_eq!(check_block(&block).unwrap_err().reason, "bad-blk-length");

        let roomy = Block::new(Hash256::ZERO, 0, XField::MaxBlockSize(2000), vec![big]);
        assert!(check_block(&roomy).is_ok());
    }
}
