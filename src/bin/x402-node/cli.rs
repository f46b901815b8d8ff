//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use x402_node::config::{LedgerDriver, NodeConfig, StoreDriver};
use x402_node::Network;

/// HTTP 402 paywall node with on-chain micropayment verification.
#[derive(Parser, Debug)]
#[command(name = "x402-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for node data.
    #[arg(long, env = "X402_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, short, env = "X402_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Address receiving payments.
    #[arg(long, env = "X402_RECEIVER")]
    pub receiver: Option<String>,

    /// Price of the protected resource in lamports.
    #[arg(long, env = "X402_PRICE_LAMPORTS")]
    pub price_lamports: Option<u64>,

    /// Cluster payments must be made on.
    #[arg(long, value_enum, env = "X402_NETWORK")]
    pub network: Option<CliNetwork>,

    /// Ledger JSON-RPC endpoint.
    #[arg(long, env = "X402_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Ledger backend.
    #[arg(long, value_enum, env = "X402_LEDGER")]
    pub ledger: Option<CliLedger>,

    /// Reference store backend.
    #[arg(long, value_enum, env = "X402_STORE")]
    pub store: Option<CliStore>,

    /// Rate limit by the first X-Forwarded-For hop (only behind a trusted proxy).
    #[arg(long, env = "X402_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "X402_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Network CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliNetwork {
    /// Development cluster.
    Devnet,
    /// Test cluster.
    Testnet,
    /// Production cluster.
    MainnetBeta,
}

/// Ledger backend CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliLedger {
    /// JSON-RPC against a live cluster.
    Rpc,
    /// Simulated in-process ledger.
    Memory,
}

/// Store backend CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliStore {
    /// Process-local.
    Memory,
    /// Files under the root directory.
    Disk,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Convert CLI arguments into a NodeConfig.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<NodeConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            NodeConfig::from_file(path)?
        } else {
            NodeConfig::default()
        };

        // Override with CLI arguments
        if let Some(root_dir) = self.root_dir {
            config.root_dir = root_dir;
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(receiver) = self.receiver {
            config.payment.receiver_address = receiver;
        }
        if let Some(price) = self.price_lamports {
            config.payment.price_lamports = price;
        }
        if let Some(network) = self.network {
            config.payment.network = network.into();
        }
        if let Some(rpc_url) = self.rpc_url {
            config.ledger.rpc_url = Some(rpc_url);
        }
        if let Some(ledger) = self.ledger {
            config.ledger.driver = ledger.into();
        }
        if let Some(store) = self.store {
            config.store.driver = store.into();
        }
        if self.trust_forwarded_for {
            config.rate_limit.trust_forwarded_for = true;
        }
        config.log_level = self.log_level;

        Ok(config)
    }
}

impl From<CliNetwork> for Network {
    fn from(n: CliNetwork) -> Self {
        match n {
            CliNetwork::Devnet => Self::Devnet,
            CliNetwork::Testnet => Self::Testnet,
            CliNetwork::MainnetBeta => Self::MainnetBeta,
        }
    }
}

impl From<CliLedger> for LedgerDriver {
    fn from(l: CliLedger) -> Self {
        match l {
            CliLedger::Rpc => Self::Rpc,
            CliLedger::Memory => Self::Memory,
        }
    }
}

impl From<CliStore> for StoreDriver {
    fn from(s: CliStore) -> Self {
        match s {
            CliStore::Memory => Self::Memory,
            CliStore::Disk => Self::Disk,
        }
    }
}
