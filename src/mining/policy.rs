//! Relay policy
//!
//! Standardness rules applied on top of consensus before a transaction is
//! admitted to the mempool. None of these make a block invalid.

use crate::config::PolicyConfig;
use crate::core::chain_state::CoinsView;
use crate::core::encode::Encodable;
use crate::core::script::{Script, ScriptType};
use crate::core::transaction::{Transaction, TxOut, TX_FEATURES};
use crate::core::validation::Rejection;

/// Largest standard scriptSig (a 15-of-15 P2SH multisig spend fits)
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;

/// Most keys a bare multisig output may carry and still relay
pub const MAX_STANDARD_MULTISIG_KEYS: usize = 3;

/// Sigop limit for a single P2SH redeem script
pub const MAX_P2SH_SIGOPS: usize = 15;

/// Bytes needed to later spend a typical output (input with signature)
const SPEND_INPUT_SIZE: usize = 148;

/// Fee at `fee_per_kb` for `size` bytes
pub fn fee_for_size(fee_per_kb: i64, size: usize) -> i64 {
    let fee = fee_per_kb.saturating_mul(size as i64) / 1000;
    if fee == 0 && size != 0 && fee_per_kb > 0 {
        1
    } else {
        fee
    }
}

/// Output value below which spending the output costs more than it is worth
pub fn dust_threshold(output: &TxOut, dust_relay_fee: i64) -> i64 {
    if output.script_pubkey.is_unspendable() {
        return 0;
    }
    fee_for_size(dust_relay_fee, output.encoded_size() + SPEND_INPUT_SIZE)
}

pub fn is_dust(output: &TxOut, dust_relay_fee: i64) -> bool {
    output.value < dust_threshold(output, dust_relay_fee)
}

/// Template of `script` if it is a relayable output script
pub fn standard_script_type(script: &Script, policy: &PolicyConfig) -> Option<ScriptType> {
    let script_type = script.script_type();
    match script_type {
        ScriptType::NonStandard => None,
        ScriptType::MultiSig { required, total } => {
            let ok = (1..=MAX_STANDARD_MULTISIG_KEYS).contains(&total)
                && (1..=total).contains(&required);
            ok.then_some(script_type)
        }
        ScriptType::NullData => {
            let ok = policy.data_carrier && script.len() <= policy.data_carrier_size;
            ok.then_some(script_type)
        }
        _ => Some(script_type),
    }
}

/// Context-free standardness of `tx`
pub fn is_standard_tx(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    if tx.features != TX_FEATURES {
        return Err(Rejection::nonstandard("features"));
    }
    if tx.size() > policy.max_standard_tx_size {
        return Err(Rejection::nonstandard("tx-size"));
    }

    for input in &tx.inputs {
        if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
            return Err(Rejection::nonstandard("scriptsig-size"));
        }
        if !input.script_sig.is_push_only() {
            return Err(Rejection::nonstandard("scriptsig-not-pushonly"));
        }
    }

    let mut data_outputs = 0usize;
    for output in &tx.outputs {
        let Some(script_type) = standard_script_type(&output.script_pubkey, policy) else {
            // Stacked OP_RETURNs in one output are a data-carrier violation
            // unless the node relays multiple carriers at all
            if !policy.data_carrier_multiple && output.script_pubkey.count_op_return() > 1 {
                return Err(Rejection::nonstandard("multi-op-return"));
            }
            return Err(Rejection::nonstandard("scriptpubkey"));
        };

        match script_type {
            ScriptType::NullData => data_outputs += 1,
            ScriptType::MultiSig { .. } if !policy.permit_bare_multisig => {
                return Err(Rejection::nonstandard("bare-multisig"));
            }
            _ => {
                if is_dust(output, policy.dust_relay_fee) {
                    return Err(Rejection::nonstandard("dust"));
                }
            }
        }
    }

    if data_outputs > 1 && !policy.data_carrier_multiple {
        return Err(Rejection::nonstandard("multi-op-return"));
    }

    Ok(())
}

/// Whether every input spends a standard output, with P2SH redeem scripts
/// under the sigop limit. Unresolvable inputs count as non-standard.
pub fn are_inputs_standard(tx: &Transaction, view: &dyn CoinsView) -> bool {
    if tx.is_coinbase() {
        return true;
    }
    tx.inputs.iter().all(|input| {
        let Some(coin) = view.lookup_coin(&input.prevout) else {
            return false;
        };
        match coin.output.script_pubkey.script_type() {
            ScriptType::NonStandard => false,
            ScriptType::ScriptHash => {
                let mut redeem: Option<&[u8]> = None;
                for ins in input.script_sig.instructions() {
                    match ins {
                        Ok(ins) => redeem = ins.data,
                        Err(_) => return false,
                    }
                }
                match redeem {
                    Some(redeem) => {
                        Script::from_bytes(redeem.to_vec()).sigop_count(true) <= MAX_P2SH_SIGOPS
                    }
                    None => false,
                }
            }
            _ => true,
        }
    })
}
