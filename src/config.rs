//! Configuration for x402-node.

use crate::ledger::Commitment;
use crate::payment::{Network, DEFAULT_PAYMENT_HEADER};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Reference store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// Process-local; state is lost on restart.
    Memory,
    /// One file per reference under the data directory.
    #[default]
    Disk,
}

/// Ledger backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerDriver {
    /// JSON-RPC against a live cluster.
    #[default]
    Rpc,
    /// In-process ledger for local demos.
    Memory,
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory for node data.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Address the HTTP server listens on (port 0 for auto-select).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between background sweeps of expired references.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Payment configuration.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Ledger configuration.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Reference store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Challenge rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// What a challenge asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Address receiving payments. Required.
    #[serde(default)]
    pub receiver_address: String,

    /// Price of the protected resource in lamports.
    #[serde(default = "default_price")]
    pub price_lamports: u64,

    /// Seconds an issued reference stays valid.
    #[serde(default = "default_ttl")]
    pub reference_ttl_secs: u64,

    /// Cluster payments must be made on.
    #[serde(default)]
    pub network: Network,

    /// Token mint to request. Token payments are refused at verification,
    /// so setting this effectively disables the paywall.
    #[serde(default)]
    pub mint: Option<String>,

    /// Request header carrying payment proofs.
    #[serde(default = "default_header_name")]
    pub header_name: String,
}

/// Ledger access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Backend.
    #[serde(default)]
    pub driver: LedgerDriver,

    /// JSON-RPC endpoint. Defaults to the public endpoint of the configured network.
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Commitment for reads.
    #[serde(default)]
    pub commitment: Commitment,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Reference store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend.
    #[serde(default)]
    pub driver: StoreDriver,

    /// Directory for the disk store. Defaults to the root directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Challenge rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Challenges a client may request per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Clients tracked at once.
    #[serde(default = "default_tracked_clients")]
    pub tracked_clients: usize,

    /// Identify clients by the first `X-Forwarded-For` hop instead of the
    /// peer address. Only enable behind a reverse proxy that sets the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            sweep_interval_secs: default_sweep_interval(),
            payment: PaymentConfig::default(),
            ledger: LedgerConfig::default(),
            store: StoreConfig::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            receiver_address: String::new(),
            price_lamports: default_price(),
            reference_ttl_secs: default_ttl(),
            network: Network::default(),
            mint: None,
            header_name: default_header_name(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            driver: LedgerDriver::default(),
            rpc_url: None,
            commitment: Commitment::default(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            tracked_clients: default_tracked_clients(),
            trust_forwarded_for: false,
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "x402-node")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".x402"))
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_header_name() -> String {
    DEFAULT_PAYMENT_HEADER.to_string()
}

const fn default_sweep_interval() -> u64 {
    300 // 5 minutes
}

const fn default_price() -> u64 {
    5000
}

const fn default_ttl() -> u64 {
    crate::payment::DEFAULT_REFERENCE_TTL_SECS
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_max_requests() -> u32 {
    crate::payment::DEFAULT_MAX_REQUESTS
}

const fn default_window_ms() -> u64 {
    crate::payment::DEFAULT_WINDOW_MS
}

const fn default_tracked_clients() -> usize {
    crate::payment::DEFAULT_TRACKED_CLIENTS
}

impl LedgerConfig {
    /// The RPC endpoint to use for `network`.
    #[must_use]
    pub fn rpc_url_for(&self, network: Network) -> String {
        self.rpc_url
            .clone()
            .unwrap_or_else(|| network.default_rpc_url().to_string())
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check that the configuration can run a node.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] naming the first invalid setting.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: &str| Err(crate::Error::Config(msg.to_string()));

        if self.payment.receiver_address.trim().is_empty() {
            return invalid("payment.receiver_address must be set");
        }
        if self.payment.price_lamports == 0 {
            return invalid("payment.price_lamports must be positive");
        }
        if self.payment.reference_ttl_secs == 0 {
            return invalid("payment.reference_ttl_secs must be positive");
        }
        if reqwest::header::HeaderName::from_bytes(self.payment.header_name.as_bytes()).is_err() {
            return invalid("payment.header_name is not a valid header name");
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs must be positive");
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_ms == 0 {
            return invalid("rate_limit.max_requests and rate_limit.window_ms must be positive");
        }
        if self.ledger.driver == LedgerDriver::Rpc {
            let url = self.ledger.rpc_url_for(self.payment.network);
            reqwest::Url::parse(&url)
                .map_err(|e| crate::Error::Config(format!("ledger.rpc_url {url}: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn valid() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.payment.receiver_address = "Receiver1111".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.payment.price_lamports, 5000);
        assert_eq!(config.payment.reference_ttl_secs, 300);
        assert_eq!(config.payment.header_name, "X-Payment");
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert!(!config.rate_limit.trust_forwarded_for);
        assert_eq!(config.sweep_interval_secs, 300);
        assert_eq!(config.store.driver, StoreDriver::Disk);
        assert_eq!(
            config.ledger.rpc_url_for(config.payment.network),
            "https://api.devnet.solana.com"
        );
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(NodeConfig::default().validate().is_err());

        let mut zero_price = valid();
        zero_price.payment.price_lamports = 0;
        assert!(zero_price.validate().is_err());

        let mut bad_header = valid();
        bad_header.payment.header_name = "X Payment".to_string();
        assert!(bad_header.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: NodeConfig = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:8080"

            [payment]
            receiver_address = "Recv"
            network = "mainnet-beta"

            [store]
            driver = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.payment.network, Network::MainnetBeta);
        assert_eq!(config.payment.price_lamports, 5000);
        assert_eq!(config.store.driver, StoreDriver::Memory);
        assert_eq!(config.ledger.driver, LedgerDriver::Rpc);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = valid();
        config.to_file(&path).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.payment.receiver_address, "Receiver1111");
        assert_eq!(loaded.listen_addr, config.listen_addr);
    }
}
