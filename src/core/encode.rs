//! Consensus wire encoding
//!
//! Little-endian integers, CompactSize length prefixes and length-prefixed
//! byte vectors, written over `bytes::BufMut` and read from `bytes::Buf`.

use crate::crypto::Hash256;
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Largest length prefix accepted while decoding (32 MiB)
pub const MAX_VECTOR_SIZE: u64 = 0x0200_0000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("unexpected end of data")]
    UnexpectedEof,
    #[error("non-canonical CompactSize encoding")]
    NonCanonicalVarInt,
    #[error("length prefix {0} exceeds limit")]
    OversizedVector(u64),
    #[error("{0} trailing bytes after object")]
    TrailingBytes(usize),
    #[error("invalid data: {0}")]
    Invalid(String),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Types with a canonical consensus serialization
pub trait Encodable {
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Serialized length in bytes
    fn encoded_size(&self) -> usize {
        let mut out = Vec::new();
        self.encode(&mut out);
        out.len()
    }
}

pub trait Decodable: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError>;
}

/// Serialize an object to a fresh byte vector
pub fn serialize<T: Encodable>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode(&mut out);
    out
}

/// Deserialize an object, requiring that every byte is consumed
pub fn deserialize<T: Decodable>(mut data: &[u8]) -> Result<T, EncodeError> {
    let value = T::decode(&mut data)?;
    if !data.is_empty() {
        return Err(EncodeError::TrailingBytes(data.len()));
    }
    Ok(value)
}

pub fn deserialize_hex<T: Decodable>(s: &str) -> Result<T, EncodeError> {
    deserialize(&hex::decode(s.trim())?)
}

pub fn serialize_hex<T: Encodable>(value: &T) -> String {
    hex::encode(serialize(value))
}

// =============================================================================
// CompactSize
// =============================================================================

/// Number of bytes a CompactSize prefix for `n` occupies
pub fn varint_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn write_varint<B: BufMut>(buf: &mut B, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

pub fn read_varint<B: Buf>(buf: &mut B) -> Result<u64, EncodeError> {
    let tag = read_u8(buf)?;
    let value = match tag {
        0xfd => {
            ensure(buf, 2)?;
            let v = buf.get_u16_le() as u64;
            if v < 0xfd {
                return Err(EncodeError::NonCanonicalVarInt);
            }
            v
        }
        0xfe => {
            ensure(buf, 4)?;
            let v = buf.get_u32_le() as u64;
            if v < 0x1_0000 {
                return Err(EncodeError::NonCanonicalVarInt);
            }
            v
        }
        0xff => {
            ensure(buf, 8)?;
            let v = buf.get_u64_le();
            if v < 0x1_0000_0000 {
                return Err(EncodeError::NonCanonicalVarInt);
            }
            v
        }
        small => small as u64,
    };
    Ok(value)
}

/// Read a CompactSize used as an element count or byte length
pub fn read_length<B: Buf>(buf: &mut B) -> Result<usize, EncodeError> {
    let n = read_varint(buf)?;
    if n > MAX_VECTOR_SIZE {
        return Err(EncodeError::OversizedVector(n));
    }
    Ok(n as usize)
}

pub fn write_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn read_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, EncodeError> {
    let len = read_length(buf)?;
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn read_array<B: Buf, const N: usize>(buf: &mut B) -> Result<[u8; N], EncodeError> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn read_u8<B: Buf>(buf: &mut B) -> Result<u8, EncodeError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u32<B: Buf>(buf: &mut B) -> Result<u32, EncodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn read_i32<B: Buf>(buf: &mut B) -> Result<i32, EncodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn read_u64<B: Buf>(buf: &mut B) -> Result<u64, EncodeError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn read_i64<B: Buf>(buf: &mut B) -> Result<i64, EncodeError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

fn ensure<B: Buf>(buf: &B, n: usize) -> Result<(), EncodeError> {
    if buf.remaining() < n {
        Err(EncodeError::UnexpectedEof)
    } else {
        Ok(())
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_varint(buf, self.len() as u64);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        let len = read_length(buf)?;
        // Cap the pre-allocation; a hostile prefix must not reserve memory
        let mut out = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            out.push(T::decode(buf)?);
        }
        Ok(out)
    }
}

impl Encodable for Hash256 {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.as_bytes());
    }

    fn encoded_size(&self) -> usize {
        32
    }
}

impl Decodable for Hash256 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(Hash256(read_array(buf)?))
    }
}
