//! Admission node CLI application
//!
//! Runs a relay node, or inspects transactions and a local regtest chain.

use admission_node::cli;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "admission")]
#[command(version)]
#[command(about = "Transaction and block admission node for a federated chain", long_about = None)]
struct Cli {
    /// JSON node config; regtest defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    InitConfig {
        #[arg(short, long, default_value = "node.json")]
        output: PathBuf,
    },

    /// Generate a signing key pair
    Keygen,

    /// Decode a raw transaction
    Decode {
        /// Transaction hex
        hex: String,
    },

    /// Run consensus and relay policy checks on a raw transaction
    Check {
        /// Transaction hex
        hex: String,
    },

    /// Mine blocks on an in-memory regtest chain
    Regtest {
        /// Number of blocks to mine
        #[arg(short, long, default_value = "1")]
        blocks: u32,

        /// Block size to declare and fill up to
        #[arg(long)]
        block_max_size: Option<u32>,
    },

    /// P2P node operations
    Node {
        #[command(subcommand)]
        action: NodeCommands,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Start the P2P node
    Start {
        /// Port to listen on (0 for any free port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Initial peers to connect to (comma-separated)
        #[arg(long)]
        peers: Option<String>,

        /// Mine a block every N seconds (needs a signing key)
        #[arg(long)]
        mine_interval: Option<u64>,

        /// Ask peers to announce blocks as compact blocks
        #[arg(long)]
        compact: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Commands::InitConfig { output } = &cli.command {
        return cli::cmd_init_config(output);
    }

    let mut config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::InitConfig { .. } => unreachable!(),

        Commands::Keygen => cli::cmd_keygen()?,

        Commands::Decode { hex } => cli::cmd_decode(&hex)?,

        Commands::Check { hex } => cli::cmd_check(&hex, &config.policy)?,

        Commands::Regtest {
            blocks,
            block_max_size,
        } => {
            if let Some(size) = block_max_size {
                config.policy.block_max_size = size;
            }
            config.validate()?;
            cli::cmd_regtest(&config, blocks)?;
        }

        Commands::Node { action } => match action {
            NodeCommands::Start {
                port,
                peers,
                mine_interval,
                compact,
            } => {
                if let Some(port) = port {
                    config.port = port;
                }
                if let Some(peers) = peers {
                    config
                        .bootstrap_peers
                        .extend(peers.split(',').map(|s| s.trim().to_string()));
                }
                config.request_compact |= compact;

                let rt = tokio::runtime::Runtime::new()?;
                rt.block_on(cli::cmd_node_start(config, mine_interval))?;
            }
        },
    }

    Ok(())
}
