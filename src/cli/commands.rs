//! CLI commands for the admission node
//!
//! Implements the command handlers behind the `admission` binary.

use crate::config::{NodeConfig, PolicyConfig, REGTEST_FEDERATION_SECRET};
use crate::core::block::DEFAULT_MAX_BLOCK_SIZE;
use crate::core::validation::check_transaction;
use crate::core::{Blockchain, Transaction};
use crate::crypto::KeyPair;
use crate::mining::policy::is_standard_tx;
use crate::mining::{Mempool, Miner};
use crate::network::{Node, NodeEvent};
use std::path::Path;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Load the node config from `path`, or regtest defaults without one
pub fn load_config(path: Option<&Path>) -> CliResult<NodeConfig> {
    match path {
        Some(path) => Ok(NodeConfig::load(path)?),
        None => Ok(NodeConfig::default()),
    }
}

/// Write a default config file
pub fn cmd_init_config(output: &Path) -> CliResult<()> {
    if output.exists() {
        println!("⚠️  Config already exists at {:?}", output);
        return Ok(());
    }

    let config = NodeConfig {
        signing_key: Some(REGTEST_FEDERATION_SECRET.to_string()),
        ..NodeConfig::default()
    };
    config.save(output)?;

    println!("✅ Config written to {:?}", output);
    println!("   🌐 Network: {}", config.chain.network);
    println!("   🔌 Port: {}", config.port);
    println!("   🔑 Federation key: {}", config.chain.federation_pubkey);
    Ok(())
}

/// Generate a signing key pair
pub fn cmd_keygen() -> CliResult<()> {
    let key = KeyPair::generate();
    println!("🔐 New key pair");
    println!("   ├─ Secret: {}", key.private_key_hex());
    println!("   └─ Public: {}", key.public_key_hex());
    Ok(())
}

/// Print the fields of a raw transaction
pub fn cmd_decode(raw: &str) -> CliResult<()> {
    let tx = Transaction::from_hex(raw)?;

    println!("📄 Transaction");
    println!("   ├─ txid: {}", tx.txid());
    println!("   ├─ hash: {}", tx.hash());
    println!("   ├─ features: {}", tx.features);
    println!("   ├─ size: {} bytes", tx.size());
    println!("   ├─ lock_time: {}", tx.lock_time);
    println!("   ├─ inputs: {}", tx.inputs.len());
    for input in &tx.inputs {
        println!(
            "   │  └─ {}:{} seq={:08x} scriptSig={}",
            input.prevout.txid,
            input.prevout.vout,
            input.sequence,
            hex::encode(input.script_sig.as_bytes())
        );
    }
    println!("   └─ outputs: {}", tx.outputs.len());
    for output in &tx.outputs {
        println!(
            "      └─ {} sat {} {}",
            output.value,
            output.script_pubkey.script_type().type_name(),
            hex::encode(output.script_pubkey.as_bytes())
        );
    }
    Ok(())
}

/// Run the context-free consensus and relay policy checks on a raw
/// transaction
pub fn cmd_check(raw: &str, policy: &PolicyConfig) -> CliResult<()> {
    let tx = Transaction::from_hex(raw)?;

    println!("🔍 Checking tx {}", tx.txid());
    match check_transaction(&tx, DEFAULT_MAX_BLOCK_SIZE as usize) {
        Ok(()) => println!("   ├─ consensus: ok"),
        Err(rejection) => println!("   ├─ consensus: ❌ {}", rejection),
    }
    match is_standard_tx(&tx, policy) {
        Ok(()) => println!("   └─ standard: ok"),
        Err(rejection) => println!("   └─ standard: ❌ {}", rejection),
    }
    Ok(())
}

/// Mine `count` blocks on an in-memory regtest chain and print each one
pub fn cmd_regtest(config: &NodeConfig, count: u32) -> CliResult<()> {
    let secret = config
        .signing_key
        .as_deref()
        .unwrap_or(REGTEST_FEDERATION_SECRET);
    let miner = Miner::new(
        KeyPair::from_private_key_hex(secret)?,
        config.policy.block_max_size,
    );
    let mut chain = Blockchain::new(config.chain.clone(), config.script_check_threads)?;
    let mut mempool = Mempool::new(config.policy.clone(), &config.chain);

    println!("⛏️  Mining {} regtest block(s)", count);
    for _ in 0..count {
        let (block, stats) = miner.mine_block(&mut chain, &mut mempool)?;
        println!(
            "   #{} | {} | {} tx | {} bytes | ceiling {} | {}ms",
            stats.height,
            block.hash(),
            stats.tx_count,
            stats.size,
            stats.target_size,
            stats.time_ms
        );
    }

    println!("\n⛓️  Chain");
    println!("   ├─ Height: {}", chain.height());
    println!("   ├─ Tip: {}", chain.tip().hash());
    println!("   └─ Coins: {}", chain.coins().len());
    Ok(())
}

/// Run a node until Ctrl+C, optionally mining every `mine_interval` seconds
pub async fn cmd_node_start(config: NodeConfig, mine_interval: Option<u64>) -> CliResult<()> {
    let node = Node::new(config)?;
    let addr = node.start().await?;
    println!("🌐 Node listening on {}", addr);

    let mut events = node.subscribe();
    let mut ticker = mine_interval.map(|secs| tokio::time::interval(Duration::from_secs(secs)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n📴 Shutting down node...");
                node.shutdown().await;
                return Ok(());
            }
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => ticker.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                if let Err(e) = node.mine_block().await {
                    log::error!("Mining failed: {}", e);
                }
            }
            event = events.recv() => match event {
                Ok(NodeEvent::BlockConnected { hash, height }) => {
                    println!("🧱 Block {} at height {}", hash, height);
                }
                Ok(NodeEvent::BlockRejected { hash, rejection }) => {
                    println!("❌ Block {} rejected: {}", hash, rejection);
                }
                Ok(NodeEvent::TxAccepted(txid)) => {
                    println!("📬 Tx {} accepted", txid);
                }
                Ok(_) => {}
                Err(e) => log::debug!("Event stream: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::Script;
    use crate::core::transaction::{OutPoint, TransactionBuilder, COIN};
    use crate::crypto::double_sha256;

    #[test]
    fn test_init_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        cmd_init_config(&path).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(
            config.signing_key.as_deref(),
            Some(REGTEST_FEDERATION_SECRET)
        );
    }

    #[test]
    fn test_decode_and_check() {
        let tx = TransactionBuilder::new()
            .add_input(OutPoint::new(double_sha256(b"prev"), 0))
            .add_output(COIN, Script::new_p2pkh(&[3u8; 20]))
            .build();
        cmd_decode(&tx.to_hex()).unwrap();
        cmd_check(&tx.to_hex(), &PolicyConfig::default()).unwrap();
        assert!(cmd_decode("zz").is_err());
    }

    #[test]
    fn test_regtest_mines() {
        cmd_regtest(&NodeConfig::default(), 2).unwrap();
    }
}
