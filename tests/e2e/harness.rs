//! Test harness that runs a single node against an in-memory ledger.

use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::info;
use x402_node::clock::{Clock, ManualClock};
use x402_node::config::{LedgerDriver, NodeConfig, StoreDriver};
use x402_node::ledger::{InMemoryLedger, Ledger, MemorySigner, PaymentSigner};
use x402_node::{
    NodeBuilder, NodeEventsChannel, PaymentClient, PaymentClientConfig, PaymentProof,
    PaymentRequirements, PolicyGuard, ShutdownHandle,
};

/// Receiver address configured on every test node.
pub const RECEIVER: &str = "E2eReceiver11111111111111111111111111111111";

/// Funded payer used by the harness signer.
pub const PAYER: &str = "E2ePayer111111111111111111111111111111111111";

/// Price charged by test nodes.
pub const PRICE: u64 = 5000;

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Node error
    #[error("Node error: {0}")]
    Node(#[from] x402_node::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Node task failed
    #[error("Node task failed: {0}")]
    Task(String),

    /// Unexpected response
    #[error("Unexpected response: {0}")]
    Unexpected(String),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// A ledger with the harness payer funded with 10 SOL.
#[must_use]
pub fn funded_ledger() -> InMemoryLedger {
    let ledger = InMemoryLedger::new();
    ledger.set_balance(PAYER, 10_000_000_000);
    ledger
}

/// A node running in a background task.
pub struct TestNode {
    addr: SocketAddr,
    ledger: InMemoryLedger,
    clock: ManualClock,
    signer: MemorySigner,
    http: reqwest::Client,
    events: Option<NodeEventsChannel>,
    shutdown: ShutdownHandle,
    task: JoinHandle<x402_node::Result<()>>,
    _root: TempDir,
}

impl TestNode {
    /// Start a node with a memory store and default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to start.
    pub async fn start() -> Result<Self> {
        Self::start_with(funded_ledger(), |_| {}).await
    }

    /// Start a node on `ledger`, letting `customize` adjust the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to start.
    pub async fn start_with(
        ledger: InMemoryLedger,
        customize: impl FnOnce(&mut NodeConfig),
    ) -> Result<Self> {
        let root = TempDir::new()?;

        let mut config = NodeConfig::default();
        config.root_dir = root.path().to_path_buf();
        config.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        config.payment.receiver_address = RECEIVER.to_string();
        config.payment.price_lamports = PRICE;
        config.ledger.driver = LedgerDriver::Memory;
        config.store.driver = StoreDriver::Memory;
        customize(&mut config);

        let clock = ManualClock::starting_now();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let mut node = NodeBuilder::new(config)
            .with_ledger(Arc::new(ledger.clone()))
            .with_clock(shared_clock)
            .with_verifier_backoff(x402_node::Backoff::immediate(1))
            .build()
            .await?;

        let addr = node.local_addr();
        let events = node.events();
        let shutdown = node.shutdown_handle();
        let task = tokio::spawn(async move { node.run().await });
        info!("Test node listening on {}", addr);

        Ok(Self {
            addr,
            ledger,
            clock,
            signer: MemorySigner::new(PAYER),
            http: reqwest::Client::new(),
            events,
            shutdown,
            task,
            _root: root,
        })
    }

    /// Absolute URL of `path` on this node.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// The ledger the node verifies against.
    #[must_use]
    pub fn ledger(&self) -> &InMemoryLedger {
        &self.ledger
    }

    /// The node's clock.
    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Plain HTTP client.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Take the node's event receiver.
    pub fn events(&mut self) -> Option<NodeEventsChannel> {
        self.events.take()
    }

    /// A paying client on the harness payer with fast retry settings.
    #[must_use]
    pub fn payment_client(&self, policy: Arc<dyn PolicyGuard>) -> PaymentClient {
        let config = PaymentClientConfig {
            confirmation_timeout: std::time::Duration::from_secs(5),
            poll_interval: std::time::Duration::from_millis(20),
            outbound_backoff: x402_node::Backoff::immediate(1),
            refetch_backoff: x402_node::Backoff::immediate(1),
            submission_backoff: x402_node::Backoff::immediate(1),
            status_backoff: x402_node::Backoff::immediate(1),
            balance_backoff: x402_node::Backoff::immediate(1),
            ..PaymentClientConfig::default()
        };
        PaymentClient::new(
            Arc::new(self.ledger.clone()),
            Arc::new(self.signer.clone()),
            policy,
            config,
        )
    }

    /// Request the protected resource without proof and return the challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not answer 402 with a challenge.
    pub async fn challenge(&self) -> Result<PaymentRequirements> {
        let response = self.http.get(self.url("/api/data")).send().await?;
        if response.status() != reqwest::StatusCode::PAYMENT_REQUIRED {
            return Err(HarnessError::Unexpected(format!(
                "expected 402, got {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Transfer `lamports` to the receiver with `memo`, returning the signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger refuses the transfer.
    pub async fn pay(&self, lamports: u64, memo: &str) -> Result<String> {
        let signed = self
            .signer
            .sign_transfer_with_memo(RECEIVER, lamports, memo)
            .await?;
        Ok(self.ledger.submit_transaction(&signed).await?)
    }

    /// Request the protected resource presenting a proof.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent.
    pub async fn redeem(&self, tx_sig: &str, reference: &str) -> Result<reqwest::Response> {
        let header = PaymentProof::new(tx_sig, reference).encode_header()?;
        Ok(self
            .http
            .get(self.url("/api/data"))
            .header("X-Payment", header)
            .send()
            .await?)
    }

    /// Stop the node and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the node task failed.
    pub async fn teardown(self) -> Result<()> {
        info!("Tearing down test node {}", self.addr);
        self.shutdown.shutdown();
        self.task
            .await
            .map_err(|e| HarnessError::Task(e.to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_error_display() {
        let err = HarnessError::Unexpected("status 500".to_string());
        assert!(err.to_string().contains("500"));
    }
}
