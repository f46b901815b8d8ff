//! Client side of the 402 exchange: fetch, pay, confirm, re-fetch.
//!
//! ```text
//! GET url ──▶ not 402 ──────────────────────────────────────────▶ return (unpaid)
//!    │
//!    ▼ 402
//! decode requirements ──▶ total (+ rent) ──▶ policy ──▶ sign + submit ──▶ poll status
//!                                              │                              │
//!                                            denied                   confirmed/finalized
//!                                              ▼                              ▼
//!                                        PolicyDenied          GET url + proof header ──▶ return (paid)
//! ```

use crate::backoff::Backoff;
use crate::client::policy::PolicyGuard;
use crate::error::{Error, Result};
use crate::ledger::{Ledger, PaymentSigner};
use crate::payment::{PaymentProof, PaymentRequirements, RejectReason, DEFAULT_PAYMENT_HEADER};
use crate::store::short_sig;
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client settings.
#[derive(Debug, Clone)]
pub struct PaymentClientConfig {
    /// Header carrying the payment proof.
    pub header_name: String,
    /// Longest wait for a submitted transaction to confirm.
    pub confirmation_timeout: Duration,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Top up the transfer with the rent-exempt minimum when the receiver
    /// account is empty, so the first transfer to it is not refused.
    pub fund_rent_exemption: bool,
    /// Retries of the first, unpaid request.
    pub outbound_backoff: Backoff,
    /// Retries of the paid re-fetch while the server errors.
    pub refetch_backoff: Backoff,
    /// Retries of transaction submission.
    pub submission_backoff: Backoff,
    /// Retries of each status lookup.
    pub status_backoff: Backoff,
    /// Retries of balance and rent queries.
    pub balance_backoff: Backoff,
}

impl Default for PaymentClientConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_PAYMENT_HEADER.to_string(),
            confirmation_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            fund_rent_exemption: true,
            outbound_backoff: Backoff::outbound_request(),
            refetch_backoff: Backoff::proof_refetch(),
            submission_backoff: Backoff::submission(),
            status_backoff: Backoff::status_fetch(),
            balance_backoff: Backoff::balance_query(),
        }
    }
}

/// Result of [`PaymentClient::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Final HTTP status.
    pub status: u16,
    /// Final response body.
    pub body: String,
    /// Whether a payment was made.
    pub paid: bool,
    /// Signature of the payment, if one was made.
    pub tx_sig: Option<String>,
    /// Reference paid for, if a payment was made.
    pub reference: Option<String>,
}

/// Fetches 402-protected resources, paying for them when policy allows.
pub struct PaymentClient {
    http: reqwest::Client,
    ledger: Arc<dyn Ledger>,
    signer: Arc<dyn PaymentSigner>,
    policy: Arc<dyn PolicyGuard>,
    config: PaymentClientConfig,
}

impl PaymentClient {
    /// Create a client.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        signer: Arc<dyn PaymentSigner>,
        policy: Arc<dyn PolicyGuard>,
        config: PaymentClientConfig,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            ledger,
            signer,
            policy,
            config,
        }
    }

    /// Use a preconfigured HTTP client.
    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Fetch `url`, paying the challenge if the server answers 402.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `url` does not parse
    /// - [`Error::Serialization`] if the 402 body is not a valid challenge
    /// - [`Error::PolicyDenied`] if the policy refuses the full transfer,
    ///   rent top-up included; nothing is submitted
    /// - [`Error::TransactionFailed`] / [`Error::ConfirmationTimeout`] if the
    ///   payment does not settle
    /// - [`Error::Network`] if the server or ledger stays unreachable
    pub async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid URL {url}: {e}")))?;
        info!("Fetching {}", url);

        let http = &self.http;
        let target = &url;
        let response = self
            .config
            .outbound_backoff
            .execute_if(
                move || async move { Ok::<_, Error>(http.get(target.clone()).send().await?) },
                Error::is_transient,
            )
            .await?;

        let status = response.status();
        if status != StatusCode::PAYMENT_REQUIRED {
            debug!("{} answered {} (no payment required)", url, status);
            return Ok(FetchOutcome {
                status: status.as_u16(),
                body: response.text().await?,
                paid: false,
                tx_sig: None,
                reference: None,
            });
        }

        let body = response.text().await?;
        let requirements: PaymentRequirements = serde_json::from_str(&body)
            .map_err(|e| Error::Serialization(format!("invalid payment requirements: {e}")))?;
        info!(
            "Payment required: {} lamports to {} (reference {})",
            requirements.amount, requirements.receiver_address, requirements.reference
        );

        let tx_sig = self.pay(&authority(&url), &requirements).await?;

        let proof = PaymentProof::new(&tx_sig, &requirements.reference).encode_header()?;
        let header_name = self.config.header_name.as_str();
        let proof = proof.as_str();
        let response = self
            .config
            .refetch_backoff
            .execute_if(
                move || async move {
                    let response = http
                        .get(target.clone())
                        .header(header_name, proof)
                        .send()
                        .await?;
                    if response.status().is_server_error() {
                        return Err(Error::Network(format!(
                            "re-fetch answered {}",
                            response.status()
                        )));
                    }
                    Ok(response)
                },
                Error::is_transient,
            )
            .await?;

        let status = response.status();
        info!("Re-fetch with proof answered {}", status);
        Ok(FetchOutcome {
            status: status.as_u16(),
            body: response.text().await?,
            paid: true,
            tx_sig: Some(tx_sig),
            reference: Some(requirements.reference),
        })
    }

    /// Pay a challenge served by `host` and wait for the payment to settle.
    /// Returns the transaction signature.
    ///
    /// # Errors
    ///
    /// See [`PaymentClient::fetch`].
    pub async fn pay(&self, host: &str, requirements: &PaymentRequirements) -> Result<String> {
        if requirements.mint.is_some() {
            return Err(Error::PaymentRejected(RejectReason::UnsupportedAssetType));
        }

        // The policy sees everything that leaves the wallet, top-up included.
        let lamports = self
            .required_amount(&requirements.receiver_address, requirements.amount)
            .await?;

        let decision = self.policy.authorize(host, lamports);
        if !decision.allow {
            warn!("Payment to {} denied: {}", host, decision.reason);
            return Err(Error::PolicyDenied(decision.reason));
        }
        debug!("Payment to {} authorized: {}", host, decision.reason);

        let signed = self
            .signer
            .sign_transfer_with_memo(&requirements.receiver_address, lamports, &requirements.reference)
            .await?;

        let ledger = &*self.ledger;
        let signed_ref = &signed;
        let tx_sig = self
            .config
            .submission_backoff
            .execute_if(
                move || async move { ledger.submit_transaction(signed_ref).await },
                Error::is_transient,
            )
            .await?;
        info!(
            "Submitted payment {} ({} lamports from {})",
            short_sig(&tx_sig),
            lamports,
            self.signer.payer()
        );

        self.wait_for_confirmation(&tx_sig).await?;
        info!("Payment {} confirmed", short_sig(&tx_sig));
        Ok(tx_sig)
    }

    /// The amount to transfer: the price, plus the rent-exempt minimum when
    /// the receiver account is empty.
    async fn required_amount(&self, receiver: &str, amount: u64) -> Result<u64> {
        if !self.config.fund_rent_exemption {
            return Ok(amount);
        }

        let ledger = &*self.ledger;
        let balance = self
            .config
            .balance_backoff
            .execute_if(
                move || async move { ledger.get_balance(receiver).await },
                Error::is_transient,
            )
            .await?;
        if balance > 0 {
            return Ok(amount);
        }

        let rent = self
            .config
            .balance_backoff
            .execute_if(
                move || async move { ledger.minimum_balance_for_rent_exemption().await },
                Error::is_transient,
            )
            .await?;
        info!(
            "Receiver {} is empty, adding {} lamports rent exemption",
            receiver, rent
        );
        amount
            .checked_add(rent)
            .ok_or_else(|| Error::Config("payment amount overflows".to_string()))
    }

    /// Poll until the transaction is confirmed, fails, or the timeout elapses.
    async fn wait_for_confirmation(&self, tx_sig: &str) -> Result<()> {
        let timeout = self.config.confirmation_timeout;
        match tokio::time::timeout(timeout, self.poll_status(tx_sig)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Payment {} not confirmed within {:?}", short_sig(tx_sig), timeout);
                Err(Error::ConfirmationTimeout(timeout.as_secs()))
            }
        }
    }

    async fn poll_status(&self, tx_sig: &str) -> Result<()> {
        let ledger = &*self.ledger;
        loop {
            let status = self
                .config
                .status_backoff
                .execute_if(
                    move || async move { ledger.get_signature_status(tx_sig).await },
                    Error::is_transient,
                )
                .await;

            match status {
                Ok(Some(status)) => {
                    if let Some(error) = status.error {
                        return Err(Error::TransactionFailed(error));
                    }
                    if status.confirmation.is_some_and(|c| c.is_settled()) {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                // Keep polling; the outer timeout bounds the wait.
                Err(e) if e.is_transient() => {
                    debug!("Status lookup for {} failed: {}", short_sig(tx_sig), e);
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// Host of `url` with its explicit port, as policies see it.
fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}
