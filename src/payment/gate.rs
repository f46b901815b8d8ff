//! The paywall gate: decides, per request, between issuing a challenge and
//! releasing the resource.
//!
//! # Request flow
//!
//! ```text
//! request
//!    │
//!    ├── no proof ──▶ rate limit ──▶ sweep if stale ──▶ issue ──▶ Challenge
//!    │
//!    └── proof ──▶ decode ──▶ lookup ──┬── consumed ──────────────▶ Released (cached)
//!                                      │
//!                                      └── pending ──▶ expiry ──▶ replay
//!                                                        ──▶ verify ──▶ consume
//!                                                        ──▶ Released
//! ```
//!
//! The store's `consume` is the only serialization point; everything before it
//! is advisory and may race. A lost race surfaces either as `AlreadyConsumed`
//! (someone else consumed the same reference, which is still a success for
//! this caller) or as `ReplayDetected`.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::event::{NodeEvent, NodeEventsSender};
use crate::payment::issuer::ChallengeIssuer;
use crate::payment::proof::{PaymentProof, PaymentRequirements};
use crate::payment::rate_limit::RateLimiter;
use crate::payment::verifier::{OnChainVerifier, VerifyOutcome, VerifyRequest};
use crate::store::{short_sig, PaymentReference, ReferenceStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Proof of a completed payment attached to a released request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// The consumed reference.
    pub reference: String,
    /// Signature of the transaction that consumed it.
    pub tx_sig: String,
    /// Fee payer of that transaction.
    pub payer: Option<String>,
    /// True if the reference had already been consumed before this request.
    pub cached: bool,
}

impl Receipt {
    fn from_record(record: &PaymentReference, cached: bool) -> Self {
        Self {
            reference: record.reference.clone(),
            tx_sig: record.tx_sig.clone().unwrap_or_default(),
            payer: record.payer.clone(),
            cached,
        }
    }
}

/// What the gate decided for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// No proof was presented; the client must pay first.
    Challenge(PaymentRequirements),
    /// The payment checks out; serve the resource.
    Released(Receipt),
}

/// Orchestrates issuer, verifier, rate limiter and store.
pub struct PaywallGate {
    store: Arc<dyn ReferenceStore>,
    issuer: ChallengeIssuer,
    verifier: OnChainVerifier,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    price: u64,
    events: Option<NodeEventsSender>,
}

impl PaywallGate {
    /// Create a gate charging `price` lamports per challenge.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReferenceStore>,
        issuer: ChallengeIssuer,
        verifier: OnChainVerifier,
        limiter: RateLimiter,
        clock: Arc<dyn Clock>,
        price: u64,
    ) -> Self {
        Self {
            store,
            issuer,
            verifier,
            limiter,
            clock,
            price,
            events: None,
        }
    }

    /// Publish challenge and consumption events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: NodeEventsSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Handle a request from `client_id` carrying the raw proof header value,
    /// if any.
    ///
    /// # Errors
    ///
    /// - [`Error::RateLimited`] on the challenge path when the client is over its limit
    /// - [`Error::InvalidProof`] if the header cannot be decoded
    /// - [`Error::ReferenceNotFound`] / [`Error::ReferenceExpired`] for dead references
    /// - [`Error::ReplayDetected`] if the transaction already paid for another reference
    /// - [`Error::PaymentRejected`] if the transaction does not satisfy the challenge
    /// - [`Error::Network`] if the ledger is unreachable
    pub async fn handle(&self, client_id: &str, header: Option<&str>) -> Result<GateDecision> {
        match header {
            None => self.challenge(client_id).await.map(GateDecision::Challenge),
            Some(value) => {
                let proof = PaymentProof::decode_header(value).inspect_err(|e| {
                    warn!("Malformed payment proof from {}: {}", client_id, e);
                })?;
                self.redeem(&proof).await.map(GateDecision::Released)
            }
        }
    }

    /// Issue a fresh challenge.
    async fn challenge(&self, client_id: &str) -> Result<PaymentRequirements> {
        self.limiter.check(client_id)?;
        self.sweep_if_stale().await;

        let requirements = self.issuer.issue(self.price).await?;
        debug!(
            "Challenge {} issued to {}",
            requirements.reference, client_id
        );
        self.emit(NodeEvent::ChallengeIssued {
            reference: requirements.reference.clone(),
            amount: requirements.amount,
        });
        Ok(requirements)
    }

    /// Purge expired references when any pending one is past its expiry, so
    /// that stale state does not wait for the periodic sweep.
    async fn sweep_if_stale(&self) {
        let now = self.clock.now();
        let stale = match self.store.list_pending().await {
            Ok(pending) => pending.iter().any(|r| r.is_expired_at(now)),
            Err(e) => {
                warn!("Failed to list pending references: {}", e);
                false
            }
        };
        if stale {
            match self.store.sweep_expired().await {
                Ok(count) => {
                    debug!("Eager sweep removed {} expired references", count);
                    self.emit(NodeEvent::ReferencesSwept { count });
                }
                Err(e) => warn!("Eager sweep failed: {}", e),
            }
        }
    }

    /// Validate a proof and consume its reference.
    async fn redeem(&self, proof: &PaymentProof) -> Result<Receipt> {
        let sig = short_sig(&proof.tx_sig);
        let Some(record) = self.store.find_by_reference(&proof.reference).await? else {
            warn!(
                "Transaction {} presented for unknown reference {}",
                sig, proof.reference
            );
            return Err(Error::ReferenceNotFound(proof.reference.clone()));
        };

        if record.is_consumed() {
            debug!(
                "Reference {} already consumed by {}, serving cached",
                record.reference,
                record.tx_sig.as_deref().map(short_sig).unwrap_or_default()
            );
            return Ok(Receipt::from_record(&record, true));
        }

        if record.is_expired_at(self.clock.now()) {
            warn!(
                "Transaction {} presented for reference {} after expiry",
                sig, record.reference
            );
            return Err(Error::ReferenceExpired(record.reference));
        }

        if self.store.is_transaction_used(&proof.tx_sig).await? {
            warn!(
                "Transaction {} replayed against {}",
                sig, record.reference
            );
            return Err(Error::ReplayDetected(format!(
                "{sig} already consumed another reference"
            )));
        }

        let (payer, amount_received) = match self.verify_record(&record, &proof.tx_sig).await? {
            VerifyOutcome::Verified {
                payer,
                amount_received,
            } => (payer, amount_received),
            VerifyOutcome::Rejected(reason) => return Err(Error::PaymentRejected(reason)),
        };

        match self
            .store
            .consume(&record.reference, &proof.tx_sig, &payer, amount_received)
            .await
        {
            Ok(consumed) => {
                info!(
                    "Payment {} consumed reference {} ({} lamports from {})",
                    sig, consumed.reference, amount_received, payer
                );
                self.emit(NodeEvent::PaymentConsumed {
                    reference: consumed.reference.clone(),
                    payer,
                    amount: amount_received,
                });
                Ok(Receipt::from_record(&consumed, false))
            }
            Err(Error::AlreadyConsumed(_)) => {
                // Lost the race to a concurrent request; serve its result.
                let winner = self
                    .store
                    .find_by_reference(&record.reference)
                    .await?
                    .ok_or_else(|| Error::ReferenceNotFound(record.reference.clone()))?;
                Ok(Receipt::from_record(&winner, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Check `tx_sig` against a reference without consuming it.
    ///
    /// # Errors
    ///
    /// [`Error::ReferenceNotFound`] for unknown references, or
    /// [`Error::Network`] if the ledger is unreachable.
    pub async fn verify_only(&self, proof: &PaymentProof) -> Result<VerifyOutcome> {
        let Some(record) = self.store.find_by_reference(&proof.reference).await? else {
            debug!(
                "Verify of {} against unknown reference {}",
                short_sig(&proof.tx_sig),
                proof.reference
            );
            return Err(Error::ReferenceNotFound(proof.reference.clone()));
        };
        self.verify_record(&record, &proof.tx_sig).await
    }

    async fn verify_record(&self, record: &PaymentReference, tx_sig: &str) -> Result<VerifyOutcome> {
        let config = self.issuer.config();
        self.verifier
            .verify(&VerifyRequest {
                tx_sig: tx_sig.to_string(),
                reference: record.reference.clone(),
                receiver: config.receiver_address.clone(),
                amount: record.amount,
                mint: config.mint.clone(),
            })
            .await
    }

    fn emit(&self, event: NodeEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
