//! JSON-RPC ledger transport.
//!
//! Speaks the Solana JSON-RPC 2.0 dialect over HTTP. Transactions are fetched
//! with `jsonParsed` encoding so that memo payloads arrive as plain text and
//! account keys of versioned transactions already include addresses loaded
//! from lookup tables.

use super::{
    ConfirmationStatus, Ledger, LedgerInstruction, LedgerTransaction, SignatureStatus,
    SignedTransaction,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Commitment level requested from the RPC node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    /// Latest block seen by the node.
    Processed,
    /// Voted on by a supermajority.
    #[default]
    Confirmed,
    /// Rooted.
    Finalized,
}

impl Commitment {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Confirmed => "confirmed",
            Self::Finalized => "finalized",
        }
    }

    /// `getTransaction` rejects `processed`; fall back to `confirmed`.
    fn for_transaction_lookup(self) -> Self {
        match self {
            Self::Processed => Self::Confirmed,
            other => other,
        }
    }
}

/// Configuration for [`RpcLedger`].
#[derive(Debug, Clone)]
pub struct RpcLedgerConfig {
    /// HTTP(S) endpoint of the RPC node.
    pub rpc_url: String,
    /// Commitment used for reads and preflight.
    pub commitment: Commitment,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RpcLedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.devnet.solana.com".to_string(),
            commitment: Commitment::Confirmed,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Ledger client over JSON-RPC.
pub struct RpcLedger {
    config: RpcLedgerConfig,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcLedger {
    /// Create a new RPC ledger client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: RpcLedgerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        debug!("RPC ledger targeting {}", config.rpc_url);

        Ok(Self {
            config,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// The configured endpoint.
    #[must_use]
    pub fn rpc_url(&self) -> &str {
        &self.config.rpc_url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        trace!("RPC {method} (id={id})");

        let response = self
            .http
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Network(format!("{method}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Ledger(format!("{method}: HTTP {status}")));
        }

        let body = response.bytes().await?;
        decode_response(method, &body)
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Node-side conditions that clear up on their own (unhealthy node, slot not
/// yet available, internal error).
fn is_transient_rpc_code(code: i64) -> bool {
    matches!(code, -32005 | -32004 | -32007 | -32014 | -32016 | -32603)
}

fn decode_response<T: DeserializeOwned>(method: &str, body: &[u8]) -> Result<T> {
    let envelope: RpcEnvelope = serde_json::from_slice(body)
        .map_err(|e| Error::Serialization(format!("{method}: malformed RPC response: {e}")))?;

    if let Some(err) = envelope.error {
        let message = format!("{method}: RPC error {}: {}", err.code, err.message);
        return Err(if is_transient_rpc_code(err.code) {
            Error::Network(message)
        } else {
            Error::Ledger(message)
        });
    }

    serde_json::from_value(envelope.result.unwrap_or(Value::Null))
        .map_err(|e| Error::Serialization(format!("{method}: unexpected result shape: {e}")))
}

#[derive(Debug, Deserialize)]
struct RpcContextual<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransactionResponse {
    #[serde(default)]
    meta: Option<RpcMeta>,
    transaction: RpcEncodedTransaction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcEncodedTransaction {
    #[serde(default)]
    signatures: Vec<String>,
    message: RpcMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMessage {
    account_keys: Vec<RpcAccountKey>,
    #[serde(default)]
    instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcAccountKey {
    Parsed { pubkey: String },
    Plain(String),
}

impl RpcAccountKey {
    fn into_pubkey(self) -> String {
        match self {
            Self::Parsed { pubkey } | Self::Plain(pubkey) => pubkey,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcInstruction {
    #[serde(default)]
    program_id: Option<String>,
    #[serde(default)]
    program_id_index: Option<usize>,
    #[serde(default)]
    parsed: Option<Value>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcSignatureStatus {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    confirmation_status: Option<ConfirmationStatus>,
}

impl RpcTransactionResponse {
    fn into_ledger_transaction(self, requested_signature: &str) -> LedgerTransaction {
        let account_keys: Vec<String> = self
            .transaction
            .message
            .account_keys
            .into_iter()
            .map(RpcAccountKey::into_pubkey)
            .collect();

        let instructions = self
            .transaction
            .message
            .instructions
            .into_iter()
            .filter_map(|ix| {
                let program_id = ix
                    .program_id
                    .or_else(|| ix.program_id_index.and_then(|i| account_keys.get(i).cloned()))?;
                let data = match (ix.parsed, ix.data) {
                    (Some(Value::String(text)), _) => text.into_bytes(),
                    (_, Some(raw)) => raw.into_bytes(),
                    (Some(other), None) => other.to_string().into_bytes(),
                    (None, None) => Vec::new(),
                };
                Some(LedgerInstruction { program_id, data })
            })
            .collect();

        let (error, pre_balances, post_balances) = match self.meta {
            Some(meta) => (
                meta.err.filter(|e| !e.is_null()).map(|e| e.to_string()),
                meta.pre_balances,
                meta.post_balances,
            ),
            None => (None, Vec::new(), Vec::new()),
        };

        LedgerTransaction {
            signature: self
                .transaction
                .signatures
                .into_iter()
                .next()
                .unwrap_or_else(|| requested_signature.to_string()),
            error,
            account_keys,
            pre_balances,
            post_balances,
            instructions,
        }
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn get_transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>> {
        let commitment = self.config.commitment.for_transaction_lookup();
        let response: Option<RpcTransactionResponse> = self
            .call(
                "getTransaction",
                json!([
                    signature,
                    {
                        "encoding": "jsonParsed",
                        "commitment": commitment.as_str(),
                        "maxSupportedTransactionVersion": 0,
                    }
                ]),
            )
            .await?;

        Ok(response.map(|r| r.into_ledger_transaction(signature)))
    }

    async fn get_signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>> {
        let response: RpcContextual<Vec<Option<RpcSignatureStatus>>> = self
            .call(
                "getSignatureStatuses",
                json!([[signature], { "searchTransactionHistory": true }]),
            )
            .await?;

        Ok(response
            .value
            .into_iter()
            .next()
            .flatten()
            .map(|status| SignatureStatus {
                confirmation: status.confirmation_status,
                error: status.err.filter(|e| !e.is_null()).map(|e| e.to_string()),
            }))
    }

    async fn get_balance(&self, account: &str) -> Result<u64> {
        let response: RpcContextual<u64> = self
            .call(
                "getBalance",
                json!([account, { "commitment": self.config.commitment.as_str() }]),
            )
            .await?;
        Ok(response.value)
    }

    async fn minimum_balance_for_rent_exemption(&self) -> Result<u64> {
        self.call("getMinimumBalanceForRentExemption", json!([0]))
            .await
    }

    async fn submit_transaction(&self, transaction: &SignedTransaction) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&transaction.wire);
        self.call(
            "sendTransaction",
            json!([
                encoded,
                {
                    "encoding": "base64",
                    "preflightCommitment": self.config.commitment.as_str(),
                }
            ]),
        )
        .await
    }
}
