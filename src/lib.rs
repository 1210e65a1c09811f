//! Admission node: transaction and block acceptance for a federated chain
//!
//! This crate provides:
//! - A binary codec for transactions and blocks with an extensible header field
//! - A script interpreter with height-gated soft-fork flags (strict DER, CLTV)
//! - Contextual block validation against a federation-signed chain
//! - A mempool with relay policy, Replace-By-Fee and package limits
//! - Block assembly honoring a negotiated block size ceiling
//! - Peer relay with compact blocks and reject messages
//!
//! # Example
//!
//! ```rust
//! use admission_node::config::{ChainParams, PolicyConfig, REGTEST_FEDERATION_SECRET};
//! use admission_node::core::Blockchain;
//! use admission_node::crypto::KeyPair;
//! use admission_node::mining::{Mempool, Miner};
//!
//! let params = ChainParams::default();
//! let mut chain = Blockchain::new(params.clone(), 1).unwrap();
//! let mut mempool = Mempool::new(PolicyConfig::default(), &params);
//!
//! let key = KeyPair::from_private_key_hex(REGTEST_FEDERATION_SECRET).unwrap();
//! let miner = Miner::new(key, params.default_max_block_size);
//! let (block, stats) = miner.mine_block(&mut chain, &mut mempool).unwrap();
//! println!("Mined block {} at height {}", block.hash(), stats.height);
//! assert_eq!(chain.height(), 1);
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;

// Re-export commonly used types
pub use config::{ChainParams, NodeConfig, PolicyConfig};
pub use core::{Block, Blockchain, RejectCode, Rejection, Transaction};
pub use crypto::{Hash256, KeyPair};
pub use mining::{Mempool, Miner};
pub use network::{Node, NodeEvent};
