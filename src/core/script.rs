//! Script programs
//!
//! Raw script byte strings, opcode constants, instruction parsing, standard
//! output templates and signature-operation counting. Execution lives in
//! `core::interpreter`.

use crate::core::encode::{read_bytes, write_bytes, Decodable, EncodeError, Encodable};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Script Constants
// =============================================================================

/// Maximum script length in bytes
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single pushed element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum number of non-push operations per script
pub const MAX_OPS_PER_SCRIPT: usize = 201;

/// Maximum number of public keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Opcode values
pub mod opcodes {
    // push value
    pub const OP_0: u8 = 0x00;
    pub const OP_FALSE: u8 = OP_0;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_RESERVED: u8 = 0x50;
    pub const OP_1: u8 = 0x51;
    pub const OP_TRUE: u8 = OP_1;
    pub const OP_2: u8 = 0x52;
    pub const OP_3: u8 = 0x53;
    pub const OP_16: u8 = 0x60;

    // control
    pub const OP_NOP: u8 = 0x61;
    pub const OP_VER: u8 = 0x62;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_VERIF: u8 = 0x65;
    pub const OP_VERNOTIF: u8 = 0x66;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;

    // stack ops
    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_2DUP: u8 = 0x6e;
    pub const OP_3DUP: u8 = 0x6f;
    pub const OP_2OVER: u8 = 0x70;
    pub const OP_2ROT: u8 = 0x71;
    pub const OP_2SWAP: u8 = 0x72;
    pub const OP_IFDUP: u8 = 0x73;
    pub const OP_DEPTH: u8 = 0x74;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_PICK: u8 = 0x79;
    pub const OP_ROLL: u8 = 0x7a;
    pub const OP_ROT: u8 = 0x7b;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_TUCK: u8 = 0x7d;

    // splice ops (disabled)
    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SUBSTR: u8 = 0x7f;
    pub const OP_LEFT: u8 = 0x80;
    pub const OP_RIGHT: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;

    // bit logic
    pub const OP_INVERT: u8 = 0x83;
    pub const OP_AND: u8 = 0x84;
    pub const OP_OR: u8 = 0x85;
    pub const OP_XOR: u8 = 0x86;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_RESERVED1: u8 = 0x89;
    pub const OP_RESERVED2: u8 = 0x8a;

    // numeric
    pub const OP_1ADD: u8 = 0x8b;
    pub const OP_1SUB: u8 = 0x8c;
    pub const OP_2MUL: u8 = 0x8d;
    pub const OP_2DIV: u8 = 0x8e;
    pub const OP_NEGATE: u8 = 0x8f;
    pub const OP_ABS: u8 = 0x90;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_0NOTEQUAL: u8 = 0x92;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MUL: u8 = 0x95;
    pub const OP_DIV: u8 = 0x96;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LSHIFT: u8 = 0x98;
    pub const OP_RSHIFT: u8 = 0x99;
    pub const OP_BOOLAND: u8 = 0x9a;
    pub const OP_BOOLOR: u8 = 0x9b;
    pub const OP_NUMEQUAL: u8 = 0x9c;
    pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
    pub const OP_NUMNOTEQUAL: u8 = 0x9e;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_GREATERTHAN: u8 = 0xa0;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_MIN: u8 = 0xa3;
    pub const OP_MAX: u8 = 0xa4;
    pub const OP_WITHIN: u8 = 0xa5;

    // crypto
    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

    // expansion
    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
    pub const OP_NOP4: u8 = 0xb3;
    pub const OP_NOP10: u8 = 0xb9;

    /// Highest opcode with defined semantics
    pub const MAX_OPCODE: u8 = OP_NOP10;
}

use opcodes::*;

/// Errors raised while *parsing* a script (execution errors are in the interpreter)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptParseError {
    #[error("push past end of script")]
    BadPush,
}

// =============================================================================
// Script
// =============================================================================

/// A raw script program
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            data: &self.0,
            pos: 0,
        }
    }

    /// Remove every occurrence of `pattern` that starts on an instruction
    /// boundary (legacy signature hashing strips the signature this way)
    pub fn find_and_delete(&self, pattern: &Script) -> Script {
        let pattern = pattern.as_bytes();
        if pattern.is_empty() {
            return self.clone();
        }
        let data = &self.0;
        let mut result = Vec::with_capacity(data.len());
        let mut iter = self.instructions();
        let mut copied_to = 0;
        loop {
            let mut pos = iter.position();
            result.extend_from_slice(&data[copied_to..pos]);
            while data.len() - pos >= pattern.len() && &data[pos..pos + pattern.len()] == pattern {
                pos += pattern.len();
            }
            copied_to = pos;
            iter.pos = pos;
            match iter.next() {
                Some(Ok(_)) => {}
                _ => break,
            }
        }
        result.extend_from_slice(&data[copied_to..]);
        Script(result)
    }

    // -------------------------------------------------------------------------
    // Templates
    // -------------------------------------------------------------------------

    /// OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    pub fn new_p2pkh(pubkey_hash: &[u8; 20]) -> Self {
        ScriptBuilder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(pubkey_hash)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// OP_HASH160 <20> OP_EQUAL
    pub fn new_p2sh(script_hash: &[u8; 20]) -> Self {
        ScriptBuilder::new()
            .push_opcode(OP_HASH160)
            .push_slice(script_hash)
            .push_opcode(OP_EQUAL)
            .into_script()
    }

    /// <pubkey> OP_CHECKSIG
    pub fn new_p2pk(pubkey: &[u8]) -> Self {
        ScriptBuilder::new()
            .push_slice(pubkey)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// OP_m <pubkeys...> OP_n OP_CHECKMULTISIG
    pub fn new_multisig(required: usize, pubkeys: &[Vec<u8>]) -> Self {
        let mut builder = ScriptBuilder::new().push_int(required as i64);
        for key in pubkeys {
            builder = builder.push_slice(key);
        }
        builder
            .push_int(pubkeys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
    }

    /// OP_RETURN <data>
    pub fn new_op_return(data: &[u8]) -> Self {
        ScriptBuilder::new()
            .push_opcode(OP_RETURN)
            .push_slice(data)
            .into_script()
    }

    // -------------------------------------------------------------------------
    // Classification
    // -------------------------------------------------------------------------

    pub fn is_p2pkh(&self) -> bool {
        let b = &self.0;
        b.len() == 25
            && b[0] == OP_DUP
            && b[1] == OP_HASH160
            && b[2] == 0x14
            && b[23] == OP_EQUALVERIFY
            && b[24] == OP_CHECKSIG
    }

    pub fn is_p2sh(&self) -> bool {
        let b = &self.0;
        b.len() == 23 && b[0] == OP_HASH160 && b[1] == 0x14 && b[22] == OP_EQUAL
    }

    /// True if every instruction is a push (OP_RESERVED counts as a push, as
    /// in Bitcoin Core's IsPushOnly)
    pub fn is_push_only(&self) -> bool {
        self.instructions().all(|ins| match ins {
            Ok(ins) => ins.opcode <= OP_16,
            Err(_) => false,
        })
    }

    /// Provably unspendable: starts with OP_RETURN or exceeds the size limit
    pub fn is_unspendable(&self) -> bool {
        self.0.first() == Some(&OP_RETURN) || self.0.len() > MAX_SCRIPT_SIZE
    }

    /// Number of OP_RETURN opcodes in the script (stops at a parse error)
    pub fn count_op_return(&self) -> usize {
        self.instructions()
            .map_while(|ins| ins.ok())
            .filter(|ins| ins.opcode == OP_RETURN)
            .count()
    }

    /// Legacy signature-operation count. `accurate` counts a multisig by its
    /// declared key count instead of the worst case.
    pub fn sigop_count(&self, accurate: bool) -> usize {
        let mut count = 0;
        let mut last_opcode = 0xff;
        for ins in self.instructions() {
            let Ok(ins) = ins else { break };
            match ins.opcode {
                OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                        count += decode_op_n(last_opcode) as usize;
                    } else {
                        count += MAX_PUBKEYS_PER_MULTISIG;
                    }
                }
                _ => {}
            }
            last_opcode = ins.opcode;
        }
        count
    }

    /// Sigops of the redeem script a P2SH spend reveals as its last push
    pub fn p2sh_sigop_count(&self, script_sig: &Script) -> usize {
        if !self.is_p2sh() {
            return self.sigop_count(true);
        }
        let mut last_push: Option<&[u8]> = None;
        for ins in script_sig.instructions() {
            let Ok(ins) = ins else { return 0 };
            if ins.opcode > OP_16 {
                return 0;
            }
            last_push = ins.data;
        }
        match last_push {
            Some(redeem) => Script::from_bytes(redeem.to_vec()).sigop_count(true),
            None => 0,
        }
    }

    /// Classify against the known output templates
    pub fn script_type(&self) -> ScriptType {
        if self.is_p2sh() {
            return ScriptType::ScriptHash;
        }
        if self.is_p2pkh() {
            return ScriptType::PubKeyHash;
        }

        let Ok(instructions) = self.instructions().collect::<Result<Vec<_>, _>>() else {
            return ScriptType::NonStandard;
        };

        // OP_RETURN followed only by pushes
        if instructions.first().map(|i| i.opcode) == Some(OP_RETURN) {
            let rest_push_only = instructions[1..].iter().all(|i| i.opcode <= OP_16);
            return if rest_push_only {
                ScriptType::NullData
            } else {
                ScriptType::NonStandard
            };
        }

        // <pubkey> OP_CHECKSIG
        if instructions.len() == 2 && instructions[1].opcode == OP_CHECKSIG {
            if let Some(key) = instructions[0].data {
                if key.len() == 33 || key.len() == 65 {
                    return ScriptType::PubKey;
                }
            }
        }

        // OP_m <keys> OP_n OP_CHECKMULTISIG
        if instructions.len() >= 4
            && instructions[instructions.len() - 1].opcode == OP_CHECKMULTISIG
        {
            let m_op = instructions[0].opcode;
            let n_op = instructions[instructions.len() - 2].opcode;
            let keys = &instructions[1..instructions.len() - 2];
            if (OP_1..=OP_16).contains(&m_op)
                && (OP_1..=OP_16).contains(&n_op)
                && keys
                    .iter()
                    .all(|k| matches!(k.data, Some(d) if d.len() == 33 || d.len() == 65))
            {
                let required = decode_op_n(m_op) as usize;
                let total = decode_op_n(n_op) as usize;
                if keys.len() == total && required <= total {
                    return ScriptType::MultiSig { required, total };
                }
            }
        }

        // Any other fully parseable script built from defined, enabled,
        // non-reserved opcodes and without OP_RETURN
        let custom = self.0.len() <= MAX_SCRIPT_SIZE
            && instructions
                .iter()
                .all(|i| i.opcode != OP_RETURN && !is_reserved_or_disabled(i.opcode));
        if custom {
            ScriptType::Custom
        } else {
            ScriptType::NonStandard
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Encodable for Script {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_bytes(buf, &self.0);
    }
}

impl Decodable for Script {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Self(read_bytes(buf)?))
    }
}

/// Output template classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptType {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    MultiSig { required: usize, total: usize },
    NullData,
    /// Parseable script outside the fixed templates
    Custom,
}

impl ScriptType {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptType::NonStandard => "nonstandard",
            ScriptType::PubKey => "pubkey",
            ScriptType::PubKeyHash => "pubkeyhash",
            ScriptType::ScriptHash => "scripthash",
            ScriptType::MultiSig { .. } => "multisig",
            ScriptType::NullData => "nulldata",
            ScriptType::Custom => "custom",
        }
    }
}

/// Opcodes that fail a script even inside an unexecuted branch
pub fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT
            | OP_SUBSTR
            | OP_LEFT
            | OP_RIGHT
            | OP_INVERT
            | OP_AND
            | OP_OR
            | OP_XOR
            | OP_2MUL
            | OP_2DIV
            | OP_MUL
            | OP_DIV
            | OP_MOD
            | OP_LSHIFT
            | OP_RSHIFT
    )
}

/// Opcodes that make a script invalid or are reserved for upgrades
pub fn is_reserved_or_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_RESERVED | OP_VER | OP_VERIF | OP_VERNOTIF | OP_RESERVED1 | OP_RESERVED2
    ) || is_disabled(opcode)
        || opcode > MAX_OPCODE
}

/// Value of OP_0 / OP_1..OP_16
pub fn decode_op_n(opcode: u8) -> u8 {
    if opcode == OP_0 {
        0
    } else {
        opcode - (OP_1 - 1)
    }
}

// =============================================================================
// Instruction iteration
// =============================================================================

/// A parsed instruction: the opcode plus pushed data for push opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: Option<&'a [u8]>,
}

impl Instruction<'_> {
    /// Whether the push used the smallest possible encoding
    pub fn is_minimal_push(&self) -> bool {
        let Some(data) = self.data else {
            return true;
        };
        match data.len() {
            0 => self.opcode == OP_0,
            1 if (1..=16).contains(&data[0]) => false,
            1 if data[0] == 0x81 => false,
            len if len <= 75 => self.opcode as usize == len,
            len if len <= 255 => self.opcode == OP_PUSHDATA1,
            len if len <= 65535 => self.opcode == OP_PUSHDATA2,
            _ => true,
        }
    }
}

pub struct Instructions<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ScriptParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let opcode = self.data[self.pos];
        self.pos += 1;

        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => match self.read_le(1) {
                Some(n) => n,
                None => return Some(self.fail()),
            },
            OP_PUSHDATA2 => match self.read_le(2) {
                Some(n) => n,
                None => return Some(self.fail()),
            },
            OP_PUSHDATA4 => match self.read_le(4) {
                Some(n) => n,
                None => return Some(self.fail()),
            },
            OP_0 => return Some(Ok(Instruction { opcode, data: Some(&[]) })),
            _ => return Some(Ok(Instruction { opcode, data: None })),
        };

        if self.data.len() - self.pos < len {
            return Some(self.fail());
        }
        let data = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(Ok(Instruction {
            opcode,
            data: Some(data),
        }))
    }
}

impl Instructions<'_> {
    /// Byte offset of the next instruction
    pub fn position(&self) -> usize {
        self.pos
    }

    fn read_le(&mut self, width: usize) -> Option<usize> {
        if self.data.len() - self.pos < width {
            return None;
        }
        let mut n = 0usize;
        for (i, byte) in self.data[self.pos..self.pos + width].iter().enumerate() {
            n |= (*byte as usize) << (8 * i);
        }
        self.pos += width;
        Some(n)
    }

    fn fail<T>(&mut self) -> Result<T, ScriptParseError> {
        self.pos = self.data.len();
        Err(ScriptParseError::BadPush)
    }
}

// =============================================================================
// Script Builder
// =============================================================================

/// Builder for assembling scripts with minimal pushes
#[derive(Default)]
pub struct ScriptBuilder {
    bytes: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    /// Push data with the smallest push opcode
    pub fn push_slice(mut self, data: &[u8]) -> Self {
        match data.len() {
            len if len < OP_PUSHDATA1 as usize => self.bytes.push(len as u8),
            len if len <= 0xff => {
                self.bytes.push(OP_PUSHDATA1);
                self.bytes.push(len as u8);
            }
            len if len <= 0xffff => {
                self.bytes.push(OP_PUSHDATA2);
                self.bytes.extend_from_slice(&(len as u16).to_le_bytes());
            }
            len => {
                self.bytes.push(OP_PUSHDATA4);
                self.bytes.extend_from_slice(&(len as u32).to_le_bytes());
            }
        }
        self.bytes.extend_from_slice(data);
        self
    }

    /// Push an integer using OP_0/OP_1NEGATE/OP_1..16 or a minimal number encoding
    pub fn push_int(self, n: i64) -> Self {
        match n {
            0 => self.push_opcode(OP_0),
            -1 => self.push_opcode(OP_1NEGATE),
            1..=16 => self.push_opcode(OP_1 + (n as u8) - 1),
            _ => {
                let encoded = crate::core::interpreter::encode_num(n);
                self.push_slice(&encoded)
            }
        }
    }

    pub fn into_script(self) -> Script {
        Script(self.bytes)
    }
}
