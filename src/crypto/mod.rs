//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 / double SHA-256 / HASH160 digests
//! - ECDSA key management and DER signatures (secp256k1)
//! - Merkle root calculation

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, hash160, sha256, sha256_hex, Hash256};
pub use keys::{public_key_from_hex, sign_digest, verify_signature, KeyError, KeyPair};
pub use merkle::{calculate_merkle_root, merkle_root_with_mutation};
