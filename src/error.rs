//! Error types for x402-node.

use crate::payment::RejectReason;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in x402-node.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient ledger or transport failure (timeouts, unavailable RPC).
    #[error("network error: {0}")]
    Network(String),

    /// The ledger answered, but with a non-retryable RPC error.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The payment proof header could not be decoded.
    #[error("invalid payment proof: {0}")]
    InvalidProof(String),

    /// A reference with this id already exists in the store.
    #[error("reference already exists: {0}")]
    ReferenceExists(String),

    /// No record exists for the reference.
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    /// The reference is still pending but past its expiry.
    #[error("reference expired: {0}")]
    ReferenceExpired(String),

    /// The reference has already been consumed.
    #[error("reference already consumed: {0}")]
    AlreadyConsumed(String),

    /// The transaction signature already unlocked a different reference.
    #[error("transaction already used: {0}")]
    ReplayDetected(String),

    /// The on-chain transaction does not satisfy the payment requirements.
    #[error("payment rejected: {0}")]
    PaymentRejected(RejectReason),

    /// The caller exceeded the challenge rate limit.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the caller's window resets.
        retry_after_secs: u64,
    },

    /// The policy guard refused to authorize a payment.
    #[error("payment denied by policy: {0}")]
    PolicyDenied(String),

    /// A submitted transaction failed on-chain.
    #[error("transaction failed on-chain: {0}")]
    TransactionFailed(String),

    /// The transaction was not confirmed within the polling window.
    #[error("transaction confirmation timed out after {0}s")]
    ConfirmationTimeout(u64),
}

impl Error {
    /// Returns true if retrying the operation may succeed.
    ///
    /// Only transport-level failures qualify; every other variant describes a
    /// deterministic fact that a retry cannot change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
