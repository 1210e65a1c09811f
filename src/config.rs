//! Node configuration
//!
//! Three layers, all serde (de)serializable with regtest defaults:
//! - [`ChainParams`]: consensus constants and activation heights
//! - [`PolicyConfig`]: mempool and block assembly policy
//! - [`NodeConfig`]: networking plus the two above, loadable from JSON

use crate::core::transaction::COIN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

/// Secret key of the regtest federation (private key 1; its public key is
/// the secp256k1 generator point)
pub const REGTEST_FEDERATION_SECRET: &str =
    "0000000000000000000000000000000000000000000000000000000000000001";

/// Compressed public key matching [`REGTEST_FEDERATION_SECRET`]
pub const REGTEST_FEDERATION_PUBKEY: &str =
    "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

// =============================================================================
// Chain parameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub network: String,
    /// Strict DER signatures required from this height
    pub dersig_height: u32,
    /// OP_CHECKLOCKTIMEVERIFY enforced from this height
    pub cltv_height: u32,
    pub coinbase_maturity: u32,
    /// Block size ceiling when a block declares none
    pub default_max_block_size: u32,
    /// Federation aggregate public key committed in the genesis block
    pub federation_pubkey: String,
    pub genesis_time: u32,
    /// Block subsidy paid to the coinbase
    pub block_reward: i64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            network: "regtest".to_string(),
            dersig_height: 1251,
            cltv_height: 1351,
            coinbase_maturity: 100,
            default_max_block_size: 1_000_000,
            federation_pubkey: REGTEST_FEDERATION_PUBKEY.to_string(),
            genesis_time: 1_562_925_929,
            block_reward: 50 * COIN,
        }
    }
}

impl ChainParams {
    /// Decoded federation key
    pub fn federation_key_bytes(&self) -> Result<[u8; 33], ConfigError> {
        let bytes = hex::decode(&self.federation_pubkey)
            .map_err(|e| ConfigError::Invalid(format!("federation_pubkey: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| ConfigError::Invalid("federation_pubkey must be 33 bytes".into()))
    }
}

// =============================================================================
// Policy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Relay OP_RETURN outputs at all
    pub data_carrier: bool,
    /// Largest standard OP_RETURN output script
    pub data_carrier_size: usize,
    /// Allow more than one OP_RETURN output per transaction
    pub data_carrier_multiple: bool,
    /// Satoshis per kB used for the dust threshold
    pub dust_relay_fee: i64,
    /// Satoshis per kB required for relay
    pub min_relay_fee: i64,
    /// Absolute fee above which admission is refused unless explicitly allowed
    pub max_tx_fee: i64,
    pub max_standard_tx_size: usize,
    pub permit_bare_multisig: bool,
    pub ancestor_limit: usize,
    pub ancestor_size_limit_kb: usize,
    pub descendant_limit: usize,
    pub descendant_size_limit_kb: usize,
    /// Most pool entries one replacement may evict
    pub max_replacements: usize,
    /// Size the block assembler aims for
    pub block_max_size: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            data_carrier: true,
            data_carrier_size: 83,
            data_carrier_multiple: false,
            dust_relay_fee: 3000,
            min_relay_fee: 1000,
            max_tx_fee: COIN / 10,
            max_standard_tx_size: 100_000,
            permit_bare_multisig: true,
            ancestor_limit: 25,
            ancestor_size_limit_kb: 101,
            descendant_limit: 25,
            descendant_size_limit_kb: 101,
            max_replacements: 100,
            block_max_size: 1_000_000,
        }
    }
}

// =============================================================================
// Node
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: String,
    /// 0 binds an ephemeral port
    pub port: u16,
    pub bootstrap_peers: Vec<String>,
    /// Workers used for block script checks; 1 checks sequentially
    pub script_check_threads: usize,
    /// Blocks larger than this are relayed as compact blocks
    pub compact_threshold: usize,
    /// Ask peers to announce every block as a compact block
    pub request_compact: bool,
    /// Hex secret key used to sign assembled blocks
    pub signing_key: Option<String>,
    pub chain: ChainParams,
    pub policy: PolicyConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 18444,
            bootstrap_peers: Vec::new(),
            script_check_threads: 1,
            compact_threshold: 100_000,
            request_compact: false,
            signing_key: None,
            chain: ChainParams::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::File::open(path)?;
        let config: NodeConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chain.federation_key_bytes()?;
        if self.script_check_threads == 0 {
            return Err(ConfigError::Invalid(
                "script_check_threads must be at least 1".into(),
            ));
        }
        if self.policy.block_max_size < crate::core::block::MIN_BLOCK_SIZE_FIELD {
            return Err(ConfigError::Invalid(format!(
                "block_max_size must be at least {}",
                crate::core::block::MIN_BLOCK_SIZE_FIELD
            )));
        }
        Ok(())
    }
}
