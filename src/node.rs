//! Node implementation: wires ledger, store and gate into an HTTP server.

use crate::backoff::Backoff;
use crate::clock::{system_clock, Clock};
use crate::config::{LedgerDriver, NodeConfig};
use crate::error::{Error, Result};
use crate::event::{create_event_channel, NodeEvent, NodeEventsChannel, NodeEventsSender};
use crate::http::{router, AppState};
use crate::ledger::{InMemoryLedger, Ledger, RpcLedger, RpcLedgerConfig};
use crate::payment::{
    ChallengeIssuer, IssuerConfig, OnChainVerifier, PaywallGate, RateLimitConfig, RateLimiter,
};
use crate::store::{open_store, ReferenceStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Builder for constructing an x402 node.
pub struct NodeBuilder {
    config: NodeConfig,
    ledger: Option<Arc<dyn Ledger>>,
    store: Option<Arc<dyn ReferenceStore>>,
    clock: Option<Arc<dyn Clock>>,
    verifier_backoff: Option<Backoff>,
}

impl NodeBuilder {
    /// Create a new node builder with the given configuration.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            ledger: None,
            store: None,
            clock: None,
            verifier_backoff: None,
        }
    }

    /// Use `ledger` instead of the one selected by `config.ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Use `store` instead of the one selected by `config.store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ReferenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Retry policy for transaction lookups during verification.
    #[must_use]
    pub fn with_verifier_backoff(mut self, backoff: Backoff) -> Self {
        self.verifier_backoff = Some(backoff);
        self
    }

    /// Build the node and bind its listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the store cannot be
    /// opened, or the listen address cannot be bound.
    pub async fn build(self) -> Result<RunningNode> {
        self.config.validate()?;
        info!("Building x402-node with config: {:?}", self.config);

        // Ensure root directory exists
        std::fs::create_dir_all(&self.config.root_dir)?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let ledger = match self.ledger {
            Some(ledger) => ledger,
            None => build_ledger(&self.config)?,
        };
        let store = match self.store {
            Some(store) => store,
            None => {
                open_store(&self.config.store, &self.config.root_dir, Arc::clone(&clock)).await?
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let payment = &self.config.payment;
        let ttl = i64::try_from(payment.reference_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| Error::Config("payment.reference_ttl_secs out of range".into()))?;
        let window = i64::try_from(self.config.rate_limit.window_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .ok_or_else(|| Error::Config("rate_limit.window_ms out of range".into()))?;

        let issuer = ChallengeIssuer::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            IssuerConfig {
                receiver_address: payment.receiver_address.clone(),
                network: payment.network,
                mint: payment.mint.clone(),
                ttl,
            },
        );
        let limiter = RateLimiter::new(
            RateLimitConfig {
                max_requests: self.config.rate_limit.max_requests,
                window,
                tracked_clients: self.config.rate_limit.tracked_clients,
            },
            Arc::clone(&clock),
        );
        let verifier = match self.verifier_backoff {
            Some(backoff) => OnChainVerifier::with_backoff(ledger, backoff),
            None => OnChainVerifier::new(ledger),
        };
        let gate = PaywallGate::new(
            Arc::clone(&store),
            issuer,
            verifier,
            limiter,
            clock,
            payment.price_lamports,
        )
        .with_events(events_tx.clone());
        let state = AppState::new(Arc::new(gate), &payment.header_name)?
            .trust_forwarded_for(self.config.rate_limit.trust_forwarded_for);

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        Ok(RunningNode {
            config: self.config,
            local_addr,
            listener: Some(listener),
            state,
            store,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

fn build_ledger(config: &NodeConfig) -> Result<Arc<dyn Ledger>> {
    match config.ledger.driver {
        LedgerDriver::Rpc => {
            let ledger = RpcLedger::new(RpcLedgerConfig {
                rpc_url: config.ledger.rpc_url_for(config.payment.network),
                commitment: config.ledger.commitment,
                request_timeout: Duration::from_secs(config.ledger.request_timeout_secs),
            })?;
            info!(
                "Verifying payments on {} via {}",
                config.payment.network,
                ledger.rpc_url()
            );
            Ok(Arc::new(ledger))
        }
        LedgerDriver::Memory => {
            warn!("Using in-memory ledger: payments are simulated, not settled");
            Ok(Arc::new(InMemoryLedger::new()))
        }
    }
}

/// Resolves once shutdown has been requested or the sender is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Requests shutdown of a [`RunningNode`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Request the node to shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// A running x402 node.
pub struct RunningNode {
    config: NodeConfig,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    state: AppState,
    store: Arc<dyn ReferenceStore>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: NodeEventsSender,
    events_rx: Option<NodeEventsChannel>,
}

impl RunningNode {
    /// Get the node's root directory.
    #[must_use]
    pub fn root_dir(&self) -> &PathBuf {
        &self.config.root_dir
    }

    /// Address the HTTP listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a receiver for node events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<NodeEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to node events.
    #[must_use]
    pub fn subscribe_events(&self) -> NodeEventsChannel {
        self.events_tx.subscribe()
    }

    /// A handle that can stop the node while [`Self::run`] is in progress.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Serve requests until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the node was already run or the server fails.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::Config("node has already been run".to_string()))?;

        info!("Starting x402-node on {}", self.local_addr);
        let _ = self.events_tx.send(NodeEvent::Started {
            addr: self.local_addr.to_string(),
        });

        let sweeper = self.spawn_sweeper();

        let app = router(self.state.clone());
        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        let signal = async move {
            tokio::select! {
                () = stopped(&mut shutdown_rx) => {
                    info!("Shutdown signal received");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    let _ = shutdown_tx.send(true);
                }
            }
        };

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        // Stop background work even if the server failed on its own
        self.shutdown();
        if let Err(e) = sweeper.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }

        let _ = self.events_tx.send(NodeEvent::ShuttingDown);
        self.store.close().await?;
        served?;
        info!("Node shutdown complete");
        Ok(())
    }

    /// Periodically purge expired pending references until shutdown.
    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let events_tx = self.events_tx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = stopped(&mut shutdown_rx) => break,
                    _ = ticker.tick() => match store.sweep_expired().await {
                        Ok(0) => {}
                        Ok(count) => {
                            info!("Swept {} expired references", count);
                            let _ = events_tx.send(NodeEvent::ReferencesSwept { count });
                        }
                        Err(e) => {
                            warn!("Sweep failed: {}", e);
                            let _ = events_tx.send(NodeEvent::Error {
                                message: format!("Sweep failed: {e}"),
                            });
                        }
                    },
                }
            }
        })
    }

    /// Request the node to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
