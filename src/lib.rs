//! # x402-node
//!
//! An HTTP 402 paywall that releases a resource only after an on-chain
//! micropayment has been verified against ledger state.
//!
//! The exchange:
//! 1. A request without proof is answered with `402 Payment Required` and a
//!    challenge naming the amount, the receiver and a single-use reference
//! 2. The client transfers the amount with the reference as transaction memo
//! 3. The client repeats the request with a proof header; the node reads the
//!    transaction back from the ledger, checks it, and consumes the reference
//!
//! A reference unlocks the resource exactly once, and a transaction can pay
//! for at most one reference.
//!
//! ## Architecture
//!
//! - [`payment`]: challenge issuance, on-chain verification, rate limiting
//!   and the [`PaywallGate`](payment::PaywallGate) tying them together
//! - [`store`]: payment reference lifecycle (memory and disk backends)
//! - [`ledger`]: read/submit access to the chain (JSON-RPC and in-memory)
//! - [`client`]: the paying side, guarded by a spending policy
//! - [`node`]: wires everything into an HTTP server
//!
//! ## Example
//!
//! ```rust,no_run
//! use x402_node::{NodeBuilder, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = NodeConfig::default();
//!     config.payment.receiver_address = "YourReceiverAddress".to_string();
//!     let mut node = NodeBuilder::new(config).build().await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod ledger;
pub mod node;
pub mod payment;
pub mod store;

pub use backoff::Backoff;
pub use client::{AllowAll, HostBudgetPolicy, PaymentClient, PaymentClientConfig, PolicyGuard};
pub use config::{NodeConfig, PaymentConfig};
pub use error::{Error, Result};
pub use event::{NodeEvent, NodeEventsChannel};
pub use ledger::{InMemoryLedger, Ledger, MemorySigner, RpcLedger, RpcLedgerConfig};
pub use node::{NodeBuilder, RunningNode, ShutdownHandle};
pub use payment::{Network, PaymentProof, PaymentRequirements, PaywallGate};
pub use store::{DiskStore, MemoryStore, PaymentReference, ReferenceStore};
