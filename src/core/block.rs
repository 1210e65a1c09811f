//! Block implementation
//!
//! A block is a header plus an ordered transaction list whose first entry is
//! the coinbase. The header carries two merkle commitments (over full hashes
//! and over malleability-fixed ids), an extension field and a proof: the
//! federation's ECDSA signature over the header hash.

use crate::core::encode::{
    deserialize, read_array, read_bytes, read_i32, read_u32, read_u8, serialize, varint_size,
    write_bytes, write_varint, Decodable, EncodeError, Encodable,
};
use crate::core::transaction::Transaction;
use crate::crypto::{
    double_sha256, merkle_root_with_mutation, verify_signature, Hash256, KeyError, KeyPair,
};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Block Constants
// =============================================================================

/// Block size ceiling when no `MaxBlockSize` field is declared
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 1_000_000;

/// Smallest declarable block size: a header plus a minimal coinbase
pub const MIN_BLOCK_SIZE_FIELD: u32 = 1000;

/// Signature operations allowed per byte of block size ceiling
pub const BLOCK_SIZE_PER_SIGOP: u32 = 50;

/// Blocks may be at most this many seconds ahead of the local clock
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;

pub const BLOCK_FEATURES: i32 = 1;

pub const XFIELD_NONE: u8 = 0;
pub const XFIELD_AGGREGATE_PUBKEY: u8 = 1;
pub const XFIELD_MAX_BLOCK_SIZE: u8 = 2;

// =============================================================================
// Extension field
// =============================================================================

/// Typed header extension
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum XField {
    #[default]
    None,
    /// New federation key, effective from the next block
    AggregatePubkey(Vec<u8>),
    /// Size ceiling for this block only
    MaxBlockSize(u32),
    /// Unrecognized type, carried through untouched
    Unknown { xfield_type: u8, data: Vec<u8> },
}

impl XField {
    pub fn xfield_type(&self) -> u8 {
        match self {
            XField::None => XFIELD_NONE,
            XField::AggregatePubkey(_) => XFIELD_AGGREGATE_PUBKEY,
            XField::MaxBlockSize(_) => XFIELD_MAX_BLOCK_SIZE,
            XField::Unknown { xfield_type, .. } => *xfield_type,
        }
    }

    /// Whether the payload is well formed for its type
    pub fn is_valid(&self) -> bool {
        match self {
            XField::None => true,
            XField::AggregatePubkey(key) => key.len() == 33 && matches!(key[0], 0x02 | 0x03),
            XField::MaxBlockSize(size) => *size >= MIN_BLOCK_SIZE_FIELD,
            XField::Unknown { .. } => true,
        }
    }
}

impl Encodable for XField {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.xfield_type());
        match self {
            XField::None => {}
            XField::AggregatePubkey(key) => write_bytes(buf, key),
            XField::MaxBlockSize(size) => buf.put_u32_le(*size),
            XField::Unknown { data, .. } => write_bytes(buf, data),
        }
    }
}

impl Decodable for XField {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        let xfield_type = read_u8(buf)?;
        Ok(match xfield_type {
            XFIELD_NONE => XField::None,
            XFIELD_AGGREGATE_PUBKEY => XField::AggregatePubkey(read_bytes(buf)?),
            XFIELD_MAX_BLOCK_SIZE => XField::MaxBlockSize(read_u32(buf)?),
            other => XField::Unknown {
                xfield_type: other,
                data: read_bytes(buf)?,
            },
        })
    }
}

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub features: i32,
    pub prev_hash: Hash256,
    /// Merkle root over transaction `hash()`es
    pub merkle_root: Hash256,
    /// Merkle root over transaction `txid()`s
    pub im_merkle_root: Hash256,
    pub time: u32,
    pub xfield: XField,
    /// DER signature over [`BlockHeader::hash`]
    pub proof: Vec<u8>,
}

impl BlockHeader {
    /// Double-SHA256 of the header without its proof
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(120);
        self.encode_unsigned(&mut data);
        double_sha256(&data)
    }

    fn encode_unsigned<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.features);
        self.prev_hash.encode(buf);
        self.merkle_root.encode(buf);
        self.im_merkle_root.encode(buf);
        buf.put_u32_le(self.time);
        self.xfield.encode(buf);
    }

    pub fn verify_proof(&self, federation_key: &[u8]) -> bool {
        !self.proof.is_empty() && verify_signature(federation_key, &self.hash(), &self.proof)
    }
}

impl Encodable for BlockHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.encode_unsigned(buf);
        write_bytes(buf, &self.proof);
    }
}

impl Decodable for BlockHeader {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            features: read_i32(buf)?,
            prev_hash: Hash256(read_array(buf)?),
            merkle_root: Hash256(read_array(buf)?),
            im_merkle_root: Hash256(read_array(buf)?),
            time: read_u32(buf)?,
            xfield: XField::decode(buf)?,
            proof: read_bytes(buf)?,
        })
    }
}

// =============================================================================
// Block
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build an unsigned block and fill in both merkle roots
    pub fn new(prev_hash: Hash256, time: u32, xfield: XField, transactions: Vec<Transaction>) -> Self {
        let mut block = Self {
            header: BlockHeader {
                features: BLOCK_FEATURES,
                prev_hash,
                merkle_root: Hash256::ZERO,
                im_merkle_root: Hash256::ZERO,
                time,
                xfield,
                proof: Vec::new(),
            },
            transactions,
        };
        block.update_merkle_roots();
        block
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.encoded_size()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Merkle root over full hashes and whether the tree was mutated
    pub fn compute_merkle_root(&self) -> (Hash256, bool) {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root_with_mutation(&hashes)
    }

    pub fn compute_im_merkle_root(&self) -> Hash256 {
        let ids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.txid()).collect();
        merkle_root_with_mutation(&ids).0
    }

    pub fn update_merkle_roots(&mut self) {
        self.header.merkle_root = self.compute_merkle_root().0;
        self.header.im_merkle_root = self.compute_im_merkle_root();
    }

    /// Size ceiling this block declares for itself
    pub fn declared_max_size(&self) -> Option<u32> {
        match self.header.xfield {
            XField::MaxBlockSize(size) => Some(size),
            _ => None,
        }
    }

    /// Sign the header hash with the federation key
    pub fn sign(&mut self, key: &KeyPair) -> Result<(), KeyError> {
        self.header.proof = key.sign(&self.hash())?;
        Ok(())
    }

    /// Genesis block committing to the federation key
    pub fn genesis(federation_key: &[u8; 33], time: u32, reward: i64) -> Self {
        let coinbase = Transaction::new_coinbase(
            0,
            crate::core::script::Script::new_p2pk(federation_key),
            reward,
        );
        Self::new(
            Hash256::ZERO,
            time,
            XField::AggregatePubkey(federation_key.to_vec()),
            vec![coinbase],
        )
    }

    pub fn to_hex(&self) -> String {
        hex::encode(serialize(self))
    }

    pub fn from_hex(s: &str) -> Result<Self, EncodeError> {
        deserialize(&hex::decode(s.trim())?)
    }
}

impl Encodable for Block {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        write_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(buf);
        }
    }

    fn encoded_size(&self) -> usize {
        self.header.encoded_size()
            + varint_size(self.transactions.len() as u64)
            + self.transactions.iter().map(|tx| tx.size()).sum::<usize>()
    }
}

impl Decodable for Block {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self {
            header: BlockHeader::decode(buf)?,
            transactions: Vec::<Transaction>::decode(buf)?,
        })
    }
}

impl Serialize for Block {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Block {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Block::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for BlockHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(serialize(self)))
    }
}

impl<'de> Deserialize<'de> for BlockHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim()).map_err(serde::de::Error::custom)?;
        deserialize(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::Script;
    use crate::core::transaction::COIN;

    fn sample_block(xfield: XField) -> Block {
        let coinbase = Transaction::new_coinbase(1, Script::new_p2pkh(&[1u8; 20]), 50 * COIN);
        Block::new(double_sha256(b"parent"), 1_600_000_000, xfield, vec![coinbase])
    }

    #[test]
    fn test_wire_round_trip_all_xfields() {
        for xfield in [
            XField::None,
            XField::AggregatePubkey(KeyPair::generate().public_key_bytes().to_vec()),
            XField::MaxBlockSize(4_000_000),
            XField::Unknown {
                xfield_type: 9,
                data: vec![1, 2, 3],
            },
        ] {
            let block = sample_block(xfield);
            let bytes = serialize(&block);
            assert_eq!(bytes.len(), block.size());
            let decoded: Block = deserialize(&bytes).unwrap();
            assert_eq!(decoded, block);
        }
    }

    #[test]
    fn test_hash_excludes_proof() {
        let key = KeyPair::generate();
        let mut block = sample_block(XField::None);
        let unsigned = block.hash();
        block.sign(&key).unwrap();
        assert_eq!(block.hash(), unsigned);
        assert!(block.header.verify_proof(&key.public_key_bytes()));
        assert!(!block
            .header
            .verify_proof(&KeyPair::generate().public_key_bytes()));
    }

    #[test]
    fn test_xfield_changes_hash() {
        let a = sample_block(XField::None);
        let b = sample_block(XField::MaxBlockSize(2_000_000));
        assert_ne!(a.hash(), b.hash());
        assert_eq!(b.declared_max_size(), Some(2_000_000));
        assert_eq!(a.declared_max_size(), None);
    }

    #[test]
    fn test_xfield_validity() {
        assert!(XField::MaxBlockSize(MIN_BLOCK_SIZE_FIELD).is_valid());
        assert!(!XField::MaxBlockSize(MIN_BLOCK_SIZE_FIELD - 1).is_valid());
        assert!(!XField::AggregatePubkey(vec![0x04; 65]).is_valid());
    }

    #[test]
    fn test_merkle_roots_differ_when_signed() {
        let block = sample_block(XField::None);
        // Coinbase scriptSig is non-empty, so hash() and txid() differ
        assert_ne!(block.header.merkle_root, block.header.im_merkle_root);
    }
}
