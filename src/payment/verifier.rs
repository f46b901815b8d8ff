//! On-chain payment verification.
//!
//! The verifier reads the transaction named by a proof back from the ledger
//! and checks it against the challenge. Nothing the client says is trusted
//! beyond the signature and the reference.
//!
//! # Checks
//!
//! ```text
//! fetch tx (with backoff)
//!        │
//!        ▼
//! absent ─────────────────────▶ NotFound
//! execution error ────────────▶ TransactionFailedOnChain
//! mint requested ─────────────▶ UnsupportedAssetType
//! receiver not in keys ───────▶ ReceiverNotFound
//! receiver delta < amount ────▶ AmountMismatch
//! no memo carrying reference ─▶ MemoMissing
//!        │
//!        ▼
//! Verified { payer = fee payer, amount_received = delta }
//! ```

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerTransaction};
use crate::store::short_sig;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a transaction does not satisfy a payment challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The ledger does not know the transaction, even after retries.
    NotFound,
    /// The transaction executed with an error.
    TransactionFailedOnChain,
    /// The challenge named a token mint; only native transfers are supported.
    UnsupportedAssetType,
    /// The receiver is not among the transaction's accounts.
    ReceiverNotFound,
    /// The receiver gained less than the required amount.
    AmountMismatch {
        /// Required lamports.
        expected: u64,
        /// Measured balance change of the receiver.
        received: i128,
    },
    /// No memo instruction carries the reference.
    MemoMissing,
    /// The transaction names no fee payer to attribute the payment to.
    FeePayerMissing,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("Transaction not found or not confirmed"),
            Self::TransactionFailedOnChain => f.write_str("Transaction failed on-chain"),
            Self::UnsupportedAssetType => f.write_str("Token transfers are not supported"),
            Self::ReceiverNotFound => f.write_str("Receiver not found in transaction"),
            Self::AmountMismatch { expected, received } => write!(
                f,
                "Amount mismatch: expected at least {expected}, got {received}"
            ),
            Self::MemoMissing => f.write_str("Memo with reference not found"),
            Self::FeePayerMissing => f.write_str("Transaction has no fee payer"),
        }
    }
}

/// What a transaction must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    /// Signature of the transaction to inspect.
    pub tx_sig: String,
    /// Reference that must appear in a memo.
    pub reference: String,
    /// Address that must receive the funds.
    pub receiver: String,
    /// Minimum lamports the receiver must gain.
    pub amount: u64,
    /// Requested token mint. Any value is rejected.
    pub mint: Option<String>,
}

/// Result of verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The transaction pays for the reference.
    Verified {
        /// Fee payer of the transaction.
        payer: String,
        /// Lamports the receiver gained.
        amount_received: u64,
    },
    /// The transaction does not pay for the reference.
    Rejected(RejectReason),
}

impl VerifyOutcome {
    /// Returns true for [`VerifyOutcome::Verified`].
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

/// Failure of a single fetch attempt.
enum FetchFailure {
    Absent,
    Ledger(Error),
}

impl FetchFailure {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Absent => true,
            Self::Ledger(e) => e.is_transient(),
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("transaction not yet visible"),
            Self::Ledger(e) => write!(f, "{e}"),
        }
    }
}

/// Verifies payments by reading transactions back from the ledger.
pub struct OnChainVerifier {
    ledger: Arc<dyn Ledger>,
    backoff: Backoff,
}

impl OnChainVerifier {
    /// Create a verifier with the default transaction-fetch retry policy.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self::with_backoff(ledger, Backoff::transaction_fetch())
    }

    /// Create a verifier with a custom retry policy.
    #[must_use]
    pub fn with_backoff(ledger: Arc<dyn Ledger>, backoff: Backoff) -> Self {
        Self { ledger, backoff }
    }

    /// Verify that `request.tx_sig` pays for `request.reference`.
    ///
    /// A transaction the ledger does not know is retried (it may simply not be
    /// visible at the commitment level yet) and rejected as
    /// [`RejectReason::NotFound`] once retries run out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] if the ledger stays unreachable after retries.
    pub async fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let sig = short_sig(&request.tx_sig);

        let tx = match self.fetch(&request.tx_sig).await {
            Ok(tx) => tx,
            Err(FetchFailure::Absent) => {
                warn!("Transaction {} for {} not found", sig, request.reference);
                return Ok(VerifyOutcome::Rejected(RejectReason::NotFound));
            }
            Err(FetchFailure::Ledger(e)) if e.is_transient() => {
                warn!("Ledger unavailable verifying {}: {}", sig, e);
                return Err(e);
            }
            Err(FetchFailure::Ledger(e)) => {
                // The node refused the lookup outright, e.g. a malformed signature
                warn!("Ledger rejected lookup of {}: {}", sig, e);
                return Ok(VerifyOutcome::Rejected(RejectReason::NotFound));
            }
        };

        let outcome = Self::check(&tx, request);
        match &outcome {
            VerifyOutcome::Verified {
                payer,
                amount_received,
            } => info!(
                "Verified {} for {}: {} lamports from {}",
                sig, request.reference, amount_received, payer
            ),
            VerifyOutcome::Rejected(reason) => warn!(
                "Rejected {} for {}: {}",
                sig, request.reference, reason
            ),
        }
        Ok(outcome)
    }

    async fn fetch(&self, tx_sig: &str) -> std::result::Result<LedgerTransaction, FetchFailure> {
        let ledger = &*self.ledger;
        self.backoff
            .execute_if(
                move || async move {
                    match ledger.get_transaction(tx_sig).await {
                        Ok(Some(tx)) => Ok(tx),
                        Ok(None) => Err(FetchFailure::Absent),
                        Err(e) => Err(FetchFailure::Ledger(e)),
                    }
                },
                FetchFailure::is_retryable,
            )
            .await
    }

    /// Apply the payment checks to a fetched transaction.
    fn check(tx: &LedgerTransaction, request: &VerifyRequest) -> VerifyOutcome {
        if tx.error.is_some() {
            return VerifyOutcome::Rejected(RejectReason::TransactionFailedOnChain);
        }

        // Token transfers fail closed; never fall through to native checks.
        if request.mint.is_some() {
            return VerifyOutcome::Rejected(RejectReason::UnsupportedAssetType);
        }

        let Some(payer) = tx.fee_payer().filter(|payer| !payer.is_empty()) else {
            return VerifyOutcome::Rejected(RejectReason::FeePayerMissing);
        };

        let Some(delta) = tx
            .account_index(&request.receiver)
            .and_then(|index| tx.balance_delta(index))
        else {
            return VerifyOutcome::Rejected(RejectReason::ReceiverNotFound);
        };

        if delta < i128::from(request.amount) {
            return VerifyOutcome::Rejected(RejectReason::AmountMismatch {
                expected: request.amount,
                received: delta,
            });
        }

        if !tx.memos().any(|memo| memo.contains(&request.reference)) {
            return VerifyOutcome::Rejected(RejectReason::MemoMissing);
        }

        debug!("Transaction {} passed all checks", short_sig(&tx.signature));

        VerifyOutcome::Verified {
            payer: payer.to_string(),
            amount_received: u64::try_from(delta).unwrap_or(u64::MAX),
        }
    }
}
