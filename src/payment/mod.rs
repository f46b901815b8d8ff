//! Payment challenge, verification and release.
//!
//! This module implements the server side of the HTTP 402 exchange:
//! 1. A request without proof gets a challenge bound to a fresh reference
//! 2. The client pays on-chain with the reference in a memo
//! 3. The proof is verified against the ledger and the reference consumed once
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────┐
//!  request ────▶ │ PaywallGate  │
//!                └──────┬───────┘
//!          ┌────────────┼─────────────┬──────────────┐
//!          ▼            ▼             ▼              ▼
//!   ┌────────────┐ ┌──────────┐ ┌─────────────┐ ┌──────────────┐
//!   │RateLimiter │ │ Challenge│ │  OnChain    │ │ Reference    │
//!   │ (LRU)      │ │ Issuer   │ │  Verifier   │ │ Store        │
//!   └────────────┘ └────┬─────┘ └──────┬──────┘ └──────────────┘
//!                       │              │               ▲
//!                       └──────────────┼───────────────┘
//!                                      ▼
//!                                   Ledger
//! ```

mod gate;
mod issuer;
mod proof;
mod rate_limit;
mod verifier;

pub use gate::{GateDecision, PaywallGate, Receipt};
pub use issuer::{ChallengeIssuer, IssuerConfig, DEFAULT_REFERENCE_TTL_SECS};
pub use proof::{Network, PaymentProof, PaymentRequirements, DEFAULT_PAYMENT_HEADER};
pub use rate_limit::{
    RateLimitConfig, RateLimitStats, RateLimiter, DEFAULT_MAX_REQUESTS, DEFAULT_TRACKED_CLIENTS,
    DEFAULT_WINDOW_MS,
};
pub use verifier::{OnChainVerifier, RejectReason, VerifyOutcome, VerifyRequest};
