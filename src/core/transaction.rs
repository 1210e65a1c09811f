//! Transaction handling
//!
//! UTXO transactions in the canonical wire format:
//! - `features` version field, inputs, outputs, lock time
//! - Malleability-fixed id (`txid`) that ignores scriptSigs, plus the full `hash`
//! - Legacy signature hashing (ALL / NONE / SINGLE, ANYONECANPAY)
//! - Lock time and sequence fields (BIP-65 / BIP-68 / BIP-125)

use crate::core::encode::{
    deserialize, read_array, read_i32, read_i64, read_u32, serialize, varint_size, Decodable,
    EncodeError, Encodable,
};
use crate::core::script::opcodes::{OP_0, OP_CODESEPARATOR};
use crate::core::script::{Script, ScriptBuilder};
use crate::crypto::{double_sha256, Hash256, KeyError, KeyPair};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// =============================================================================
// Constants
// =============================================================================

/// Number of base units in one coin
pub const COIN: i64 = 100_000_000;

/// No amount larger than this is valid
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Standard transaction `features` value
pub const TX_FEATURES: i32 = 1;

/// Sequence number that disables locktime for an input
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// Any sequence below this signals replaceability (BIP-125)
pub const SEQUENCE_RBF_MAX: u32 = 0xFFFF_FFFE;

/// Lock time values below are block heights, at or above are timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// BIP-68: relative lock time disabled for this input
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// BIP-68: relative lock time is time based (512 second units)
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// Time-based relative locks are in units of 2^9 seconds
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

// =============================================================================
// Outpoints, inputs and outputs
// =============================================================================

/// Reference to an output of a previous transaction (by its `txid`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The outpoint a coinbase input spends
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint) -> Self {
        Self {
            prevout,
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: i64, script_pubkey: Script) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub features: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Malleability-fixed identifier: scriptSigs are excluded from the hash
    pub fn txid(&self) -> Hash256 {
        let mut out = Vec::with_capacity(self.encoded_size());
        self.encode_inner(&mut out, false);
        double_sha256(&out)
    }

    /// Hash of the complete serialization, scriptSigs included
    pub fn hash(&self) -> Hash256 {
        double_sha256(&serialize(self))
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.encoded_size()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// BIP-125: any input with a sequence below `SEQUENCE_RBF_MAX`
    pub fn signals_rbf(&self) -> bool {
        self.inputs.iter().any(|i| i.sequence < SEQUENCE_RBF_MAX)
    }

    /// Sum of output values; `None` when a value or the running total leaves
    /// the money range
    pub fn total_output(&self) -> Option<i64> {
        let mut total: i64 = 0;
        for output in &self.outputs {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }

    /// Create a coinbase committing to `height` (BIP-34 style push) that pays
    /// `value` to `script_pubkey`.
    ///
    /// `txid()` skips the scriptSig, so the height is also carried in
    /// `lock_time` to keep coinbase txids unique.
    pub fn new_coinbase(height: u32, script_pubkey: Script, value: i64) -> Self {
        let script_sig = ScriptBuilder::new()
            .push_int(height as i64)
            .push_opcode(OP_0)
            .into_script();
        Self {
            features: TX_FEATURES,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut::new(value, script_pubkey)],
            lock_time: height,
        }
    }

    /// Legacy signature hash for `input_index` with the given script code.
    ///
    /// `script_code` starts after the last executed OP_CODESEPARATOR and must
    /// already have the signature removed; any separators left in it are not
    /// committed to. SIGHASH_SINGLE with no matching output hashes to one.
    pub fn signature_hash(&self, input_index: usize, script_code: &Script, hash_type: u32) -> Hash256 {
        let mut one = [0u8; 32];
        one[0] = 1;
        if input_index >= self.inputs.len() {
            return Hash256(one);
        }

        let base_type = hash_type & 0x1f;
        if base_type == SIGHASH_SINGLE && input_index >= self.outputs.len() {
            return Hash256(one);
        }

        let script_code = script_code.find_and_delete(&Script::from_bytes(vec![OP_CODESEPARATOR]));
        let mut tx = self.clone();
        for (i, input) in tx.inputs.iter_mut().enumerate() {
            input.script_sig = if i == input_index {
                script_code.clone()
            } else {
                Script::new()
            };
        }

        match base_type {
            SIGHASH_NONE => {
                tx.outputs.clear();
                zero_other_sequences(&mut tx, input_index);
            }
            SIGHASH_SINGLE => {
                tx.outputs.truncate(input_index + 1);
                for output in tx.outputs.iter_mut().take(input_index) {
                    *output = TxOut::new(-1, Script::new());
                }
                zero_other_sequences(&mut tx, input_index);
            }
            _ => {}
        }

        if hash_type & SIGHASH_ANYONECANPAY != 0 {
            let input = tx.inputs[input_index].clone();
            tx.inputs = vec![input];
        }

        let mut data = serialize(&tx);
        data.put_u32_le(hash_type);
        double_sha256(&data)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(serialize(self))
    }

    pub fn from_hex(s: &str) -> Result<Self, EncodeError> {
        deserialize(&hex::decode(s.trim())?)
    }

    fn encode_inner<B: BufMut>(&self, buf: &mut B, with_script_sig: bool) {
        buf.put_i32_le(self.features);
        crate::core::encode::write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.encode(buf);
            if with_script_sig {
                input.script_sig.encode(buf);
            } else {
                buf.put_u8(0);
            }
            buf.put_u32_le(input.sequence);
        }
        self.outputs.encode(buf);
        buf.put_u32_le(self.lock_time);
    }
}

fn zero_other_sequences(tx: &mut Transaction, keep: usize) {
    for (i, input) in tx.inputs.iter_mut().enumerate() {
        if i != keep {
            input.sequence = 0;
        }
    }
}

pub fn money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

// =============================================================================
// Wire encoding
// =============================================================================

impl Encodable for OutPoint {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.txid.encode(buf);
        buf.put_u32_le(self.vout);
    }

    fn encoded_size(&self) -> usize {
        36
    }
}

impl Decodable for OutPoint {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            txid: Hash256(read_array(buf)?),
            vout: read_u32(buf)?,
        })
    }
}

impl Encodable for TxIn {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.prevout.encode(buf);
        self.script_sig.encode(buf);
        buf.put_u32_le(self.sequence);
    }

    fn encoded_size(&self) -> usize {
        36 + varint_size(self.script_sig.len() as u64) + self.script_sig.len() + 4
    }
}

impl Decodable for TxIn {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            prevout: OutPoint::decode(buf)?,
            script_sig: Script::decode(buf)?,
            sequence: read_u32(buf)?,
        })
    }
}

impl Encodable for TxOut {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(self.value);
        self.script_pubkey.encode(buf);
    }

    fn encoded_size(&self) -> usize {
        8 + varint_size(self.script_pubkey.len() as u64) + self.script_pubkey.len()
    }
}

impl Decodable for TxOut {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            value: read_i64(buf)?,
            script_pubkey: Script::decode(buf)?,
        })
    }
}

impl Encodable for Transaction {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.encode_inner(buf, true);
    }

    fn encoded_size(&self) -> usize {
        4 + varint_size(self.inputs.len() as u64)
            + self.inputs.iter().map(|i| i.encoded_size()).sum::<usize>()
            + varint_size(self.outputs.len() as u64)
            + self.outputs.iter().map(|o| o.encoded_size()).sum::<usize>()
            + 4
    }
}

impl Decodable for Transaction {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            features: read_i32(buf)?,
            inputs: Vec::<TxIn>::decode(buf)?,
            outputs: Vec::<TxOut>::decode(buf)?,
            lock_time: read_u32(buf)?,
        })
    }
}

impl Serialize for Transaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Transaction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Transaction::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Coins
// =============================================================================

/// An unspent output together with where it was created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Builder for assembling and signing P2PKH spends
pub struct TransactionBuilder {
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
    lock_time: u32,
    features: i32,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            features: TX_FEATURES,
        }
    }

    pub fn add_input(mut self, prevout: OutPoint) -> Self {
        self.inputs.push(TxIn::new(prevout));
        self
    }

    pub fn add_input_with_sequence(mut self, prevout: OutPoint, sequence: u32) -> Self {
        self.inputs.push(TxIn {
            prevout,
            script_sig: Script::new(),
            sequence,
        });
        self
    }

    pub fn add_output(mut self, value: i64, script_pubkey: Script) -> Self {
        self.outputs.push(TxOut::new(value, script_pubkey));
        self
    }

    pub fn lock_time(mut self, lock_time: u32) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn features(mut self, features: i32) -> Self {
        self.features = features;
        self
    }

    /// Signal replaceability on every input
    pub fn with_rbf(mut self) -> Self {
        for input in &mut self.inputs {
            if input.sequence >= SEQUENCE_RBF_MAX {
                input.sequence = SEQUENCE_RBF_MAX - 1;
            }
        }
        self
    }

    pub fn build(self) -> Transaction {
        Transaction {
            features: self.features,
            inputs: self.inputs,
            outputs: self.outputs,
            lock_time: self.lock_time,
        }
    }

    /// Build and sign every input as a P2PKH spend of `key_pair`'s outputs
    pub fn build_and_sign(self, key_pair: &KeyPair) -> Result<Transaction, KeyError> {
        let mut tx = self.build();
        let prev_script = Script::new_p2pkh(&key_pair.pubkey_hash());
        for index in 0..tx.inputs.len() {
            sign_p2pkh(&mut tx, index, &prev_script, key_pair)?;
        }
        Ok(tx)
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill in the scriptSig of input `index` with `<sig+ALL> <pubkey>`
pub fn sign_p2pkh(
    tx: &mut Transaction,
    index: usize,
    prev_script: &Script,
    key_pair: &KeyPair,
) -> Result<(), KeyError> {
    let digest = tx.signature_hash(index, prev_script, SIGHASH_ALL);
    let mut signature = key_pair.sign(&digest)?;
    signature.push(SIGHASH_ALL as u8);
    tx.inputs[index].script_sig = ScriptBuilder::new()
        .push_slice(&signature)
        .push_slice(&key_pair.public_key_bytes())
        .into_script();
    Ok(())
}
