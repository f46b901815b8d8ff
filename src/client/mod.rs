//! Paying client for 402-protected resources.
//!
//! [`PaymentClient`] performs the whole exchange on behalf of a wallet: it
//! requests the resource, reads the challenge, asks a [`PolicyGuard`] whether
//! the payment is acceptable, signs and submits a transfer carrying the
//! reference as memo, waits for confirmation and re-requests the resource
//! with the proof header.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use x402_node::client::{HostBudgetPolicy, PaymentClient, PaymentClientConfig};
//! use x402_node::ledger::{RpcLedger, RpcLedgerConfig};
//!
//! let ledger = Arc::new(RpcLedger::new(RpcLedgerConfig::default())?);
//! let client = PaymentClient::new(
//!     ledger,
//!     Arc::new(my_wallet_signer),
//!     Arc::new(HostBudgetPolicy::default()),
//!     PaymentClientConfig::default(),
//! );
//!
//! let outcome = client.fetch("http://localhost:3000/api/data").await?;
//! println!("{} paid={} body={}", outcome.status, outcome.paid, outcome.body);
//! ```

mod executor;
mod policy;

pub use crate::ledger::PaymentSigner;
pub use executor::{FetchOutcome, PaymentClient, PaymentClientConfig};
pub use policy::{AllowAll, HostBudgetPolicy, PolicyDecision, PolicyGuard};
