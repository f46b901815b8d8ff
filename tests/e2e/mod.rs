//! E2E test infrastructure for x402-node.
//!
//! Each test starts a real node on an ephemeral localhost port, backed by an
//! in-memory ledger shared with the test, and talks to it over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! test ──reqwest / PaymentClient──▶ TestNode (axum on 127.0.0.1:0)
//!   │                                    │
//!   └──────────── InMemoryLedger ◀───────┘
//!                 ManualClock
//! ```

mod harness;

#[cfg(test)]
mod integration_tests;

pub use harness::{funded_ledger, TestNode, PAYER, PRICE, RECEIVER};
