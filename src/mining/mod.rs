//! Mining module: relay policy, the transaction pool and block assembly

pub mod mempool;
pub mod miner;
pub mod policy;

pub use mempool::{AdmitResult, BroadcastError, Mempool, MempoolCoinsView, MempoolEntry, MempoolStats};
pub use miner::{Miner, MinerError, MiningStats};
