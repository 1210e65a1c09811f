//! Script interpreter
//!
//! Evaluates scriptSig / scriptPubKey pairs against a spending transaction:
//! - Legacy opcode set with IF/NOTIF/ELSE/ENDIF flow control
//! - CHECKSIG / CHECKMULTISIG over the legacy signature hash
//! - CHECKLOCKTIMEVERIFY / CHECKSEQUENCEVERIFY
//! - Pay-to-script-hash redeem script evaluation
//!
//! Behaviour toggles are [`ScriptFlags`]; failures are [`ScriptError`] values
//! whose messages match the strings peers and RPC clients expect.

use crate::core::script::opcodes::*;
use crate::core::script::{
    is_disabled, Script, ScriptBuilder, MAX_OPS_PER_SCRIPT, MAX_PUBKEYS_PER_MULTISIG,
    MAX_SCRIPT_ELEMENT_SIZE, MAX_SCRIPT_SIZE,
};
use crate::core::transaction::{
    Transaction, LOCKTIME_THRESHOLD, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use crate::crypto::{double_sha256, hash160, sha256, verify_signature};
use bitflags::bitflags;
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use sha1::Sha1;
use sha2::Digest;
use thiserror::Error;

/// Combined size limit of the main and alt stacks
pub const MAX_STACK_SIZE: usize = 1000;

/// Default byte length limit for numeric operands
const SCRIPTNUM_MAX_LEN: usize = 4;

/// Lock time operands may use five bytes
const LOCKTIME_NUM_MAX_LEN: usize = 5;

bitflags! {
    /// Script verification flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScriptFlags: u32 {
        const P2SH = 1 << 0;
        const STRICTENC = 1 << 1;
        const DERSIG = 1 << 2;
        const LOW_S = 1 << 3;
        const NULLDUMMY = 1 << 4;
        const SIGPUSHONLY = 1 << 5;
        const MINIMALDATA = 1 << 6;
        const DISCOURAGE_UPGRADABLE_NOPS = 1 << 7;
        const CLEANSTACK = 1 << 8;
        const CHECKLOCKTIMEVERIFY = 1 << 9;
        const CHECKSEQUENCEVERIFY = 1 << 10;
        const NULLFAIL = 1 << 14;
    }
}

/// Script failure causes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("unknown error")]
    Unknown,
    #[error("Script evaluated without error but finished with a false/empty top stack element")]
    EvalFalse,
    #[error("OP_RETURN was encountered")]
    OpReturn,
    #[error("Script is too big")]
    ScriptSize,
    #[error("Push value size limit exceeded")]
    PushSize,
    #[error("Operation limit exceeded")]
    OpCount,
    #[error("Stack size limit exceeded")]
    StackSize,
    #[error("Signature count negative or greater than pubkey count")]
    SigCount,
    #[error("Pubkey count negative or limit exceeded")]
    PubkeyCount,
    #[error("Script failed an OP_VERIFY operation")]
    Verify,
    #[error("Script failed an OP_EQUALVERIFY operation")]
    EqualVerify,
    #[error("Script failed an OP_CHECKMULTISIGVERIFY operation")]
    CheckMultiSigVerify,
    #[error("Script failed an OP_CHECKSIGVERIFY operation")]
    CheckSigVerify,
    #[error("Script failed an OP_NUMEQUALVERIFY operation")]
    NumEqualVerify,
    #[error("Opcode missing or not understood")]
    BadOpcode,
    #[error("Attempted to use a disabled opcode")]
    DisabledOpcode,
    #[error("Operation not valid with the current stack size")]
    InvalidStackOperation,
    #[error("Operation not valid with the current altstack size")]
    InvalidAltstackOperation,
    #[error("Invalid OP_IF construction")]
    UnbalancedConditional,
    #[error("Negative locktime")]
    NegativeLockTime,
    #[error("Locktime requirement not satisfied")]
    UnsatisfiedLockTime,
    #[error("Signature hash type missing or not understood")]
    SigHashType,
    #[error("Non-canonical DER signature")]
    SigDer,
    #[error("Data push larger than necessary")]
    MinimalData,
    #[error("Only non-push operators allowed in signatures")]
    SigPushOnly,
    #[error("Non-canonical signature: S value is unnecessarily high")]
    SigHighS,
    #[error("Dummy CHECKMULTISIG argument must be zero")]
    SigNullDummy,
    #[error("Public key is neither compressed or uncompressed")]
    PubkeyType,
    #[error("Extra items left on stack after execution")]
    CleanStack,
    #[error("Signature must be zero for failed CHECK(MULTI)SIG operation")]
    NullFail,
    #[error("NOPx reserved for soft-fork upgrades")]
    DiscourageUpgradableNops,
}

// =============================================================================
// Signature checking
// =============================================================================

/// Transaction context consulted by signature and lock time opcodes
pub trait SignatureChecker {
    /// `sig` carries the trailing hash type byte
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &Script) -> bool;
    fn check_lock_time(&self, lock_time: i64) -> bool;
    fn check_sequence(&self, sequence: i64) -> bool;
}

/// Checker that fails every signature and lock time; used where no
/// transaction is being spent
pub struct NullSignatureChecker;

impl SignatureChecker for NullSignatureChecker {
    fn check_sig(&self, _sig: &[u8], _pubkey: &[u8], _script_code: &Script) -> bool {
        false
    }

    fn check_lock_time(&self, _lock_time: i64) -> bool {
        false
    }

    fn check_sequence(&self, _sequence: i64) -> bool {
        false
    }
}

pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize) -> Self {
        Self { tx, input_index }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &Script) -> bool {
        let Some((&hash_type, der)) = sig.split_last() else {
            return false;
        };
        let digest = self
            .tx
            .signature_hash(self.input_index, script_code, hash_type as u32);
        verify_signature(pubkey, &digest, der)
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock = self.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        if (tx_lock < threshold) != (lock_time < threshold) {
            return false;
        }
        if lock_time > tx_lock {
            return false;
        }
        // A final input would let the transaction bypass its own lock time
        self.tx.inputs[self.input_index].sequence != SEQUENCE_FINAL
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let tx_sequence = self.tx.inputs[self.input_index].sequence as i64;
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let tx_masked = tx_sequence & mask;
        let required = sequence & mask;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        if (tx_masked < type_flag) != (required < type_flag) {
            return false;
        }
        required <= tx_masked
    }
}

// =============================================================================
// Encoding checks
// =============================================================================

/// Strict DER encoding with a trailing hash type byte
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

fn is_low_der_signature(sig: &[u8]) -> Result<(), ScriptError> {
    if !is_valid_signature_encoding(sig) {
        return Err(ScriptError::SigDer);
    }
    let der = &sig[..sig.len() - 1];
    let signature = Signature::from_der(der).map_err(|_| ScriptError::SigDer)?;
    let mut normalized = signature;
    normalized.normalize_s();
    if normalized != signature {
        return Err(ScriptError::SigHighS);
    }
    Ok(())
}

fn is_defined_hashtype_signature(sig: &[u8]) -> bool {
    match sig.last() {
        Some(hash_type) => matches!(hash_type & !0x80, 0x01..=0x03),
        None => false,
    }
}

pub fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    // An empty signature is the canonical way to fail a CHECKSIG
    if sig.is_empty() {
        return Ok(());
    }
    if flags.intersects(ScriptFlags::DERSIG | ScriptFlags::LOW_S | ScriptFlags::STRICTENC)
        && !is_valid_signature_encoding(sig)
    {
        return Err(ScriptError::SigDer);
    }
    if flags.contains(ScriptFlags::LOW_S) {
        is_low_der_signature(sig)?;
    }
    if flags.contains(ScriptFlags::STRICTENC) && !is_defined_hashtype_signature(sig) {
        return Err(ScriptError::SigHashType);
    }
    Ok(())
}

fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if !flags.contains(ScriptFlags::STRICTENC) {
        return Ok(());
    }
    let valid = match pubkey.len() {
        33 => matches!(pubkey[0], 0x02 | 0x03),
        65 => pubkey[0] == 0x04,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ScriptError::PubkeyType)
    }
}

// =============================================================================
// Numbers
// =============================================================================

/// Minimal little-endian sign-magnitude encoding of a script number
pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut result = Vec::with_capacity(9);
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = result.len() - 1;
    if result[last] & 0x80 != 0 {
        result.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        result[last] |= 0x80;
    }
    result
}

fn decode_num(bytes: &[u8], require_minimal: bool, max_len: usize) -> Result<i64, ScriptError> {
    if bytes.len() > max_len {
        return Err(ScriptError::Unknown);
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let last = bytes[bytes.len() - 1];
    if require_minimal && last & 0x7f == 0 && (bytes.len() == 1 || bytes[bytes.len() - 2] & 0x80 == 0)
    {
        return Err(ScriptError::Unknown);
    }
    let mut result: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        result |= (*byte as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        Ok(-(result & mask))
    } else {
        Ok(result)
    }
}

pub fn cast_to_bool(data: &[u8]) -> bool {
    for (i, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // Negative zero
            return !(i == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn bool_bytes(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

// =============================================================================
// Evaluation
// =============================================================================

type Stack = Vec<Vec<u8>>;

/// Element `depth` from the top (1 = top)
fn top(stack: &Stack, depth: usize) -> Result<&Vec<u8>, ScriptError> {
    if depth == 0 || stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Stack) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn require(stack: &Stack, n: usize) -> Result<(), ScriptError> {
    if stack.len() < n {
        Err(ScriptError::InvalidStackOperation)
    } else {
        Ok(())
    }
}

/// Run `script` on `stack`
pub fn eval_script(
    stack: &mut Stack,
    script: &Script,
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let require_minimal = flags.contains(ScriptFlags::MINIMALDATA);
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut alt_stack: Stack = Vec::new();
    let mut op_count = 0usize;
    let mut code_start = 0usize;
    let mut instructions = script.instructions();

    while let Some(next) = instructions.next() {
        let ins = next.map_err(|_| ScriptError::BadOpcode)?;
        let executing = !exec_stack.contains(&false);
        let opcode = ins.opcode;

        if let Some(data) = ins.data {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if let Some(data) = ins.data {
            if executing {
                if require_minimal && !ins.is_minimal_push() {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data.to_vec());
            }
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let n = opcode as i64 - (OP_1 as i64 - 1);
                    stack.push(encode_num(n));
                }

                // Control
                OP_NOP => {}
                OP_CHECKLOCKTIMEVERIFY if flags.contains(ScriptFlags::CHECKLOCKTIMEVERIFY) => {
                    let lock_time =
                        decode_num(top(stack, 1)?, require_minimal, LOCKTIME_NUM_MAX_LEN)?;
                    if lock_time < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    if !checker.check_lock_time(lock_time) {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                }
                OP_CHECKSEQUENCEVERIFY if flags.contains(ScriptFlags::CHECKSEQUENCEVERIFY) => {
                    let sequence =
                        decode_num(top(stack, 1)?, require_minimal, LOCKTIME_NUM_MAX_LEN)?;
                    if sequence < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    // Disabled relative locks behave as a NOP
                    if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0
                        && !checker.check_sequence(sequence)
                    {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                }
                OP_NOP1 | OP_CHECKLOCKTIMEVERIFY | OP_CHECKSEQUENCEVERIFY | OP_NOP4..=OP_NOP10 => {
                    if flags.contains(ScriptFlags::DISCOURAGE_UPGRADABLE_NOPS) {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let condition = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        value = cast_to_bool(&condition);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                }
                OP_ELSE => {
                    let last = exec_stack
                        .last_mut()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(top(stack, 1)?) {
                        return Err(ScriptError::Verify);
                    }
                    stack.pop();
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                // Stack operations
                OP_TOALTSTACK => alt_stack.push(pop(stack)?),
                OP_FROMALTSTACK => {
                    let item = alt_stack
                        .pop()
                        .ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(item);
                }
                OP_2DROP => {
                    require(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    let a = top(stack, 2)?.clone();
                    let b = top(stack, 1)?.clone();
                    stack.extend([a, b]);
                }
                OP_3DUP => {
                    let a = top(stack, 3)?.clone();
                    let b = top(stack, 2)?.clone();
                    let c = top(stack, 1)?.clone();
                    stack.extend([a, b, c]);
                }
                OP_2OVER => {
                    let a = top(stack, 4)?.clone();
                    let b = top(stack, 3)?.clone();
                    stack.extend([a, b]);
                }
                OP_2ROT => {
                    require(stack, 6)?;
                    let at = stack.len() - 6;
                    let moved: Vec<_> = stack.drain(at..at + 2).collect();
                    stack.extend(moved);
                }
                OP_2SWAP => {
                    require(stack, 4)?;
                    let len = stack.len();
                    stack.swap(len - 4, len - 2);
                    stack.swap(len - 3, len - 1);
                }
                OP_IFDUP => {
                    let value = top(stack, 1)?.clone();
                    if cast_to_bool(&value) {
                        stack.push(value);
                    }
                }
                OP_DEPTH => stack.push(encode_num(stack.len() as i64)),
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let value = top(stack, 1)?.clone();
                    stack.push(value);
                }
                OP_NIP => {
                    require(stack, 2)?;
                    stack.remove(stack.len() - 2);
                }
                OP_OVER => {
                    let value = top(stack, 2)?.clone();
                    stack.push(value);
                }
                OP_PICK | OP_ROLL => {
                    let n = decode_num(top(stack, 1)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
                    stack.pop();
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let index = stack.len() - 1 - n as usize;
                    let value = if opcode == OP_ROLL {
                        stack.remove(index)
                    } else {
                        stack[index].clone()
                    };
                    stack.push(value);
                }
                OP_ROT => {
                    require(stack, 3)?;
                    let value = stack.remove(stack.len() - 3);
                    stack.push(value);
                }
                OP_SWAP => {
                    require(stack, 2)?;
                    let len = stack.len();
                    stack.swap(len - 2, len - 1);
                }
                OP_TUCK => {
                    require(stack, 2)?;
                    let value = top(stack, 1)?.clone();
                    stack.insert(stack.len() - 2, value);
                }
                OP_SIZE => {
                    let size = top(stack, 1)?.len();
                    stack.push(encode_num(size as i64));
                }

                // Bitwise logic
                OP_EQUAL | OP_EQUALVERIFY => {
                    require(stack, 2)?;
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(bool_bytes(equal));
                    }
                }

                // Numeric
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = decode_num(top(stack, 1)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
                    let result = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.pop();
                    stack.push(encode_num(result));
                }
                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    require(stack, 2)?;
                    let a = decode_num(top(stack, 2)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
                    let b = decode_num(top(stack, 1)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    stack.truncate(stack.len() - 2);
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(encode_num(result));
                    }
                }
                OP_WITHIN => {
                    require(stack, 3)?;
                    let x = decode_num(top(stack, 3)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
                    let min = decode_num(top(stack, 2)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
                    let max = decode_num(top(stack, 1)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
                    stack.truncate(stack.len() - 3);
                    stack.push(bool_bytes(min <= x && x < max));
                }

                // Crypto
                OP_RIPEMD160 => {
                    let data = pop(stack)?;
                    stack.push(Ripemd160::digest(&data).to_vec());
                }
                OP_SHA1 => {
                    let data = pop(stack)?;
                    stack.push(Sha1::digest(&data).to_vec());
                }
                OP_SHA256 => {
                    let data = pop(stack)?;
                    stack.push(sha256(&data).to_vec());
                }
                OP_HASH160 => {
                    let data = pop(stack)?;
                    stack.push(hash160(&data).to_vec());
                }
                OP_HASH256 => {
                    let data = pop(stack)?;
                    stack.push(double_sha256(&data).as_bytes().to_vec());
                }
                OP_CODESEPARATOR => code_start = instructions.position(),
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    require(stack, 2)?;
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;

                    let script_code = script_code_from(script, code_start)
                        .find_and_delete(&ScriptBuilder::new().push_slice(&sig).into_script());
                    check_signature_encoding(&sig, flags)?;
                    check_pubkey_encoding(&pubkey, flags)?;
                    let success = checker.check_sig(&sig, &pubkey, &script_code);
                    if !success && flags.contains(ScriptFlags::NULLFAIL) && !sig.is_empty() {
                        return Err(ScriptError::NullFail);
                    }

                    if opcode == OP_CHECKSIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_bytes(success));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let success = check_multisig(
                        stack,
                        script_code_from(script, code_start),
                        flags,
                        checker,
                        &mut op_count,
                    )?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckMultiSigVerify);
                        }
                    } else {
                        stack.push(bool_bytes(success));
                    }
                }

                // OP_RESERVED, OP_VER, OP_VERIF, OP_VERNOTIF and undefined opcodes
                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn script_code_from(script: &Script, start: usize) -> Script {
    Script::from_bytes(script.as_bytes()[start..].to_vec())
}

/// Stack layout (top first): n, keys[n], m, sigs[m], dummy
fn check_multisig(
    stack: &mut Stack,
    mut script_code: Script,
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
    op_count: &mut usize,
) -> Result<bool, ScriptError> {
    let require_minimal = flags.contains(ScriptFlags::MINIMALDATA);

    let mut i = 1;
    let key_count = decode_num(top(stack, i)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
    if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    let mut keys_left = key_count as usize;
    *op_count += keys_left;
    if *op_count > MAX_OPS_PER_SCRIPT {
        return Err(ScriptError::OpCount);
    }
    i += 1;
    let mut key_depth = i;
    // Depth of the last key; below it nothing is a key any more
    let mut keys_to_clear = keys_left + 2;
    i += keys_left;
    require(stack, i)?;

    let sig_count = decode_num(top(stack, i)?, require_minimal, SCRIPTNUM_MAX_LEN)?;
    if sig_count < 0 || sig_count as usize > keys_left {
        return Err(ScriptError::SigCount);
    }
    let mut sigs_left = sig_count as usize;
    i += 1;
    let mut sig_depth = i;
    i += sigs_left;
    require(stack, i)?;

    for depth in sig_depth..sig_depth + sigs_left {
        let pattern = ScriptBuilder::new()
            .push_slice(top(stack, depth)?)
            .into_script();
        script_code = script_code.find_and_delete(&pattern);
    }

    let mut success = true;
    while success && sigs_left > 0 {
        let sig = top(stack, sig_depth)?;
        let pubkey = top(stack, key_depth)?;
        check_signature_encoding(sig, flags)?;
        check_pubkey_encoding(pubkey, flags)?;

        if checker.check_sig(sig, pubkey, &script_code) {
            sig_depth += 1;
            sigs_left -= 1;
        }
        key_depth += 1;
        keys_left -= 1;

        if sigs_left > keys_left {
            success = false;
        }
    }

    // Pop everything except the dummy, enforcing NULLFAIL on signatures
    while i > 1 {
        i -= 1;
        if !success
            && flags.contains(ScriptFlags::NULLFAIL)
            && keys_to_clear == 0
            && !top(stack, 1)?.is_empty()
        {
            return Err(ScriptError::NullFail);
        }
        keys_to_clear = keys_to_clear.saturating_sub(1);
        stack.pop();
    }

    let dummy = pop(stack)?;
    if flags.contains(ScriptFlags::NULLDUMMY) && !dummy.is_empty() {
        return Err(ScriptError::SigNullDummy);
    }
    Ok(success)
}

/// Verify that `script_sig` satisfies `script_pubkey`
pub fn verify_script(
    script_sig: &Script,
    script_pubkey: &Script,
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if flags.contains(ScriptFlags::SIGPUSHONLY) && !script_sig.is_push_only() {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker)?;
    let stack_copy = if flags.contains(ScriptFlags::P2SH) {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker)?;
    match stack.last() {
        Some(value) if cast_to_bool(value) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if flags.contains(ScriptFlags::P2SH) && script_pubkey.is_p2sh() {
        if !script_sig.is_push_only() {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        // Cannot be empty: the scriptPubKey evaluated true against it
        let redeem = Script::from_bytes(pop(&mut stack)?);
        eval_script(&mut stack, &redeem, flags, checker)?;
        match stack.last() {
            Some(value) if cast_to_bool(value) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    if flags.contains(ScriptFlags::CLEANSTACK) && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{
        sign_p2pkh, OutPoint, TransactionBuilder, COIN, SIGHASH_ALL,
    };
    use crate::crypto::KeyPair;

    fn run(script: Script) -> Result<Vec<Vec<u8>>, ScriptError> {
        let mut stack = Vec::new();
        eval_script(&mut stack, &script, ScriptFlags::empty(), &NullSignatureChecker)?;
        Ok(stack)
    }

    /// A transaction spending a P2PKH output of `key`, signed
    fn signed_spend(key: &KeyPair) -> (Transaction, Script) {
        let prev_script = Script::new_p2pkh(&key.pubkey_hash());
        let mut tx = TransactionBuilder::new()
            .add_input(OutPoint::new(double_sha256(b"funding"), 0))
            .add_output(COIN, Script::new_p2pkh(&[9u8; 20]))
            .build();
        sign_p2pkh(&mut tx, 0, &prev_script, key).unwrap();
        (tx, prev_script)
    }

    #[test]
    fn test_number_encoding() {
        for n in [0i64, 1, -1, 127, 128, -128, 255, 256, 0x7fff_ffff, -0x7fff_ffff] {
            let encoded = encode_num(n);
            assert_eq!(decode_num(&encoded, true, 5).unwrap(), n);
        }
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert!(decode_num(&[0x01, 0x00], true, 4).is_err());
        assert!(decode_num(&[0x01, 0x00], false, 4).is_ok());
    }

    #[test]
    fn test_conditionals() {
        let script = ScriptBuilder::new()
            .push_opcode(OP_1)
            .push_opcode(OP_IF)
            .push_opcode(OP_2)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_3)
            .push_opcode(OP_ENDIF)
            .into_script();
        assert_eq!(run(script).unwrap(), vec![vec![2u8]]);

        let unbalanced = Script::from_bytes(vec![OP_1, OP_IF]);
        assert_eq!(run(unbalanced), Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn test_disabled_opcode_fails_in_unexecuted_branch() {
        let script = Script::from_bytes(vec![OP_0, OP_IF, OP_CAT, OP_ENDIF]);
        assert_eq!(run(script), Err(ScriptError::DisabledOpcode));

        // Reserved opcodes only fail when executed
        let reserved = Script::from_bytes(vec![OP_0, OP_IF, OP_RESERVED, OP_ENDIF]);
        assert!(run(reserved).is_ok());
        let verif = Script::from_bytes(vec![OP_0, OP_IF, OP_VERIF, OP_ENDIF]);
        assert_eq!(run(verif), Err(ScriptError::BadOpcode));
    }

    #[test]
    fn test_arithmetic_and_within() {
        let script = ScriptBuilder::new()
            .push_int(5)
            .push_int(7)
            .push_opcode(OP_ADD)
            .push_int(12)
            .push_opcode(OP_NUMEQUALVERIFY)
            .push_int(3)
            .push_int(1)
            .push_int(4)
            .push_opcode(OP_WITHIN)
            .into_script();
        assert_eq!(run(script).unwrap(), vec![vec![1u8]]);
    }

    #[test]
    fn test_stack_ops() {
        let script = ScriptBuilder::new()
            .push_int(1)
            .push_int(2)
            .push_int(3)
            .push_opcode(OP_ROT)
            .into_script();
        assert_eq!(run(script).unwrap(), vec![vec![2u8], vec![3u8], vec![1u8]]);

        let pick = ScriptBuilder::new()
            .push_int(7)
            .push_int(8)
            .push_int(1)
            .push_opcode(OP_PICK)
            .into_script();
        assert_eq!(run(pick).unwrap(), vec![vec![7u8], vec![8u8], vec![7u8]]);

        assert_eq!(
            run(Script::from_bytes(vec![OP_FROMALTSTACK])),
            Err(ScriptError::InvalidAltstackOperation)
        );
    }

    #[test]
    fn test_p2pkh_spend_verifies() {
        let key = KeyPair::generate();
        let (tx, prev_script) = signed_spend(&key);
        let checker = TransactionSignatureChecker::new(&tx, 0);
        let flags = ScriptFlags::all();
        assert_eq!(
            verify_script(&tx.inputs[0].script_sig, &prev_script, flags, &checker),
            Ok(())
        );
    }

    #[test]
    fn test_wrong_key_is_eval_false_or_nullfail() {
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let (tx, _) = signed_spend(&key);

        // Re-point the scriptSig's public key at a key that did not sign
        let sig = tx.inputs[0].script_sig.instructions().next().unwrap().unwrap();
        let forged = ScriptBuilder::new()
            .push_slice(sig.data.unwrap())
            .push_slice(&other.public_key_bytes())
            .into_script();
        let prev_script = Script::new_p2pk(&other.public_key_bytes());
        let checker = TransactionSignatureChecker::new(&tx, 0);

        let sig_only = ScriptBuilder::new()
            .push_slice(sig.data.unwrap())
            .into_script();
        assert_eq!(
            verify_script(&sig_only, &prev_script, ScriptFlags::P2SH, &checker),
            Err(ScriptError::EvalFalse)
        );
        assert_eq!(
            verify_script(&sig_only, &prev_script, ScriptFlags::NULLFAIL, &checker),
            Err(ScriptError::NullFail)
        );
        assert!(verify_script(&forged, &prev_script, ScriptFlags::empty(), &checker).is_err());
    }

    #[test]
    fn test_codeseparator_moves_script_code() {
        let key = KeyPair::generate();
        let tail = Script::new_p2pkh(&key.pubkey_hash());
        let tx = TransactionBuilder::new()
            .add_input(OutPoint::new(double_sha256(b"separated"), 0))
            .add_output(COIN, Script::new())
            .build();
        let checker = TransactionSignatureChecker::new(&tx, 0);
        let sign_over = |code: &Script| {
            let mut sig = key.sign(&tx.signature_hash(0, code, SIGHASH_ALL)).unwrap();
            sig.push(SIGHASH_ALL as u8);
            ScriptBuilder::new()
                .push_slice(&sig)
                .push_slice(&key.public_key_bytes())
                .into_script()
        };

        // Executed separator in the middle: only what follows it is signed
        let mut bytes = vec![OP_1, OP_DROP, OP_CODESEPARATOR];
        bytes.extend_from_slice(tail.as_bytes());
        let prev_script = Script::from_bytes(bytes);
        assert_eq!(
            verify_script(&sign_over(&tail), &prev_script, ScriptFlags::P2SH, &checker),
            Ok(())
        );
        assert_eq!(
            verify_script(&sign_over(&prev_script), &prev_script, ScriptFlags::P2SH, &checker),
            Err(ScriptError::EvalFalse)
        );

        // A separator in a skipped branch leaves the start in place
        let mut bytes = vec![OP_0, OP_IF, OP_CODESEPARATOR, OP_ENDIF];
        bytes.extend_from_slice(tail.as_bytes());
        let prev_script = Script::from_bytes(bytes);
        assert_eq!(
            verify_script(&sign_over(&prev_script), &prev_script, ScriptFlags::P2SH, &checker),
            Ok(())
        );
        assert_eq!(
            verify_script(&sign_over(&tail), &prev_script, ScriptFlags::P2SH, &checker),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn test_padded_signature_needs_dersig_to_fail() {
        let key = KeyPair::generate();
        let (tx, prev_script) = signed_spend(&key);
        let mut parts = tx.inputs[0].script_sig.instructions().map(|i| i.unwrap());
        let sig = parts.next().unwrap().data.unwrap().to_vec();
        let pubkey = parts.next().unwrap().data.unwrap().to_vec();

        let (hash_type, der) = sig.split_last().unwrap();
        let mut padded = der.to_vec();
        padded.push(0x00);
        padded.push(*hash_type);
        assert_eq!(*hash_type as u32, SIGHASH_ALL);

        let script_sig = ScriptBuilder::new()
            .push_slice(&padded)
            .push_slice(&pubkey)
            .into_script();
        let checker = TransactionSignatureChecker::new(&tx, 0);

        assert_eq!(
            verify_script(&script_sig, &prev_script, ScriptFlags::P2SH, &checker),
            Ok(())
        );
        let err = verify_script(
            &script_sig,
            &prev_script,
            ScriptFlags::P2SH | ScriptFlags::DERSIG,
            &checker,
        )
        .unwrap_err();
        assert_eq!(err, ScriptError::SigDer);
        assert_eq!(err.to_string(), "Non-canonical DER signature");
    }

    #[test]
    fn test_p2sh_requires_push_only_script_sig() {
        let redeem = Script::from_bytes(vec![OP_1]);
        let p2sh = Script::new_p2sh(&hash160(redeem.as_bytes()));

        let good = ScriptBuilder::new().push_slice(redeem.as_bytes()).into_script();
        assert_eq!(
            verify_script(&good, &p2sh, ScriptFlags::P2SH, &NullSignatureChecker),
            Ok(())
        );

        let mut bad_bytes = vec![OP_NOP];
        bad_bytes.extend_from_slice(good.as_bytes());
        let bad = Script::from_bytes(bad_bytes);
        let err = verify_script(&bad, &p2sh, ScriptFlags::P2SH, &NullSignatureChecker).unwrap_err();
        assert_eq!(err, ScriptError::SigPushOnly);
        assert_eq!(err.to_string(), "Only non-push operators allowed in signatures");
    }

    #[test]
    fn test_multisig_one_of_two() {
        let key_a = KeyPair::generate();
        let key_b = KeyPair::generate();
        let redeem = Script::new_multisig(
            1,
            &[key_a.public_key_bytes().to_vec(), key_b.public_key_bytes().to_vec()],
        );
        let tx = TransactionBuilder::new()
            .add_input(OutPoint::new(double_sha256(b"ms"), 0))
            .add_output(COIN, Script::new())
            .build();
        let digest = tx.signature_hash(0, &redeem, SIGHASH_ALL);
        let mut sig = key_b.sign(&digest).unwrap();
        sig.push(SIGHASH_ALL as u8);

        let script_sig = ScriptBuilder::new()
            .push_opcode(OP_0)
            .push_slice(&sig)
            .into_script();
        let checker = TransactionSignatureChecker::new(&tx, 0);
        assert_eq!(
            verify_script(&script_sig, &redeem, ScriptFlags::all(), &checker),
            Ok(())
        );

        let bad_dummy = ScriptBuilder::new()
            .push_opcode(OP_1)
            .push_slice(&sig)
            .into_script();
        assert_eq!(
            verify_script(&bad_dummy, &redeem, ScriptFlags::NULLDUMMY, &checker),
            Err(ScriptError::SigNullDummy)
        );
    }

    #[test]
    fn test_cleanstack() {
        let script_sig = Script::from_bytes(vec![OP_1, OP_1]);
        let script_pubkey = Script::from_bytes(vec![OP_NOP]);
        assert_eq!(
            verify_script(
                &script_sig,
                &script_pubkey,
                ScriptFlags::P2SH | ScriptFlags::CLEANSTACK,
                &NullSignatureChecker
            ),
            Err(ScriptError::CleanStack)
        );
    }

    #[test]
    fn test_checklocktimeverify() {
        let tx = TransactionBuilder::new()
            .add_input_with_sequence(OutPoint::new(double_sha256(b"cltv"), 0), 0)
            .add_output(COIN, Script::new())
            .lock_time(100)
            .build();
        let checker = TransactionSignatureChecker::new(&tx, 0);
        let flags = ScriptFlags::CHECKLOCKTIMEVERIFY;

        let satisfied = ScriptBuilder::new()
            .push_int(100)
            .push_opcode(OP_CHECKLOCKTIMEVERIFY)
            .into_script();
        let mut stack = Vec::new();
        assert!(eval_script(&mut stack, &satisfied, flags, &checker).is_ok());

        let unsatisfied = ScriptBuilder::new()
            .push_int(101)
            .push_opcode(OP_CHECKLOCKTIMEVERIFY)
            .into_script();
        let mut stack = Vec::new();
        assert_eq!(
            eval_script(&mut stack, &unsatisfied, flags, &checker),
            Err(ScriptError::UnsatisfiedLockTime)
        );

        // Without the flag the opcode is a NOP
        let mut stack = Vec::new();
        assert!(eval_script(&mut stack, &unsatisfied, ScriptFlags::empty(), &checker).is_ok());
    }

    #[test]
    fn test_upgradable_nops_discouraged() {
        let script = Script::from_bytes(vec![OP_NOP4, OP_1]);
        let mut stack = Vec::new();
        assert_eq!(
            eval_script(
                &mut stack,
                &script,
                ScriptFlags::DISCOURAGE_UPGRADABLE_NOPS,
                &NullSignatureChecker
            ),
            Err(ScriptError::DiscourageUpgradableNops)
        );
    }

    #[test]
    fn test_minimaldata() {
        let script = Script::from_bytes(vec![0x01, 0x05]);
        let mut stack = Vec::new();
        assert_eq!(
            eval_script(&mut stack, &script, ScriptFlags::MINIMALDATA, &NullSignatureChecker),
            Err(ScriptError::MinimalData)
        );
    }
}
