//! Core chain components
//!
//! This module contains the consensus building blocks:
//! - Binary codec for transactions, blocks and scripts
//! - Script parsing and the script interpreter
//! - Height-gated soft-fork rules
//! - Structural and contextual validation
//! - The active chain with its coin set
//! - Compact block relay

pub mod block;
pub mod blockchain;
pub mod chain_state;
pub mod compression;
pub mod encode;
pub mod interpreter;
pub mod script;
pub mod softfork;
pub mod transaction;
pub mod validation;

pub use block::{Block, BlockHeader, XField, DEFAULT_MAX_BLOCK_SIZE, MIN_BLOCK_SIZE_FIELD};
pub use blockchain::{Blockchain, ChainError};
pub use chain_state::{CoinSet, CoinsView, MTP_BLOCK_COUNT};
pub use compression::{CompactBlock, CompactError, PartialBlock, TxCache};
pub use encode::{Decodable, Encodable, EncodeError};
pub use interpreter::{ScriptError, ScriptFlags};
pub use script::{Script, ScriptBuilder, ScriptType};
pub use softfork::SoftForkGate;
pub use transaction::{
    Coin, OutPoint, Transaction, TransactionBuilder, TxIn, TxOut, COIN, MAX_MONEY,
    SEQUENCE_FINAL,
};
pub use validation::{RejectCode, Rejection};
