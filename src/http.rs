//! HTTP surface of the node.
//!
//! | Route            | Behaviour                                              |
//! |------------------|--------------------------------------------------------|
//! | `GET /healthz`   | liveness probe                                         |
//! | `GET /api/data`  | paywalled resource; 402 challenge without a proof      |
//! | `POST /api/verify` | checks a proof against the ledger without consuming it |
//!
//! Paywalled routes sit behind [`paywall`], which runs the gate and, on
//! release, hands the [`Receipt`] to the handler through request extensions.

use crate::error::Error;
use crate::payment::{GateDecision, PaymentProof, PaywallGate, Receipt, VerifyOutcome};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    gate: Arc<PaywallGate>,
    header: HeaderName,
    trust_forwarded_for: bool,
}

impl AppState {
    /// Create handler state reading proofs from `header_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `header_name` is not a valid header name.
    pub fn new(gate: Arc<PaywallGate>, header_name: &str) -> crate::Result<Self> {
        let header = HeaderName::from_bytes(header_name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid payment header {header_name}: {e}")))?;
        Ok(Self {
            gate,
            header,
            trust_forwarded_for: false,
        })
    }

    /// Key rate limiting on the first `X-Forwarded-For` hop when present.
    /// Only for nodes behind a proxy that overwrites the header.
    #[must_use]
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Build the node's router.
pub fn router(state: AppState) -> Router {
    let paid = Router::new()
        .route("/api/data", get(paid_data))
        .route_layer(middleware::from_fn_with_state(state.clone(), paywall));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/verify", post(verify))
        .merge(paid)
        .with_state(state)
}

/// Gate middleware: challenge, reject, or pass the request on with its receipt.
async fn paywall(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let client_id = client_id(
        request.headers(),
        request.extensions().get(),
        state.trust_forwarded_for,
    );

    let header = match request.headers().get(&state.header).map(|v| v.to_str()) {
        None => None,
        // An empty header is no proof at all
        Some(Ok(value)) if value.trim().is_empty() => None,
        Some(Ok(value)) => Some(value.to_string()),
        Some(Err(_)) => {
            return ApiError(Error::InvalidProof("header is not visible ASCII".to_string()))
                .into_response()
        }
    };

    match state.gate.handle(&client_id, header.as_deref()).await {
        Ok(GateDecision::Challenge(requirements)) => {
            (StatusCode::PAYMENT_REQUIRED, Json(requirements)).into_response()
        }
        Ok(GateDecision::Released(receipt)) => {
            request.extensions_mut().insert(receipt);
            next.run(request).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Identify the caller for rate limiting: the peer IP, or the first
/// `X-Forwarded-For` hop when the node trusts its proxy.
fn client_id(
    headers: &HeaderMap,
    peer: Option<&ConnectInfo<SocketAddr>>,
    trust_forwarded_for: bool,
) -> String {
    let forwarded = || {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let peer_ip = || peer.map(|ConnectInfo(addr)| addr.ip().to_string());

    let id = if trust_forwarded_for {
        forwarded().or_else(peer_ip)
    } else {
        peer_ip()
    };
    id.unwrap_or_else(|| "unknown".to_string())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn paid_data(Extension(receipt): Extension<Receipt>) -> Json<serde_json::Value> {
    Json(json!({
        "data": "Secret resource for paid users",
        "paid": true,
        "reference": receipt.reference,
        "txSig": receipt.tx_sig,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody {
    tx_sig: String,
    reference: String,
}

async fn verify(
    State(state): State<AppState>,
    body: Result<Json<VerifyBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid request body" })),
        )
            .into_response();
    };
    debug!("Verify request for reference {}", body.reference);

    let proof = PaymentProof::new(body.tx_sig, body.reference);
    match state.gate.verify_only(&proof).await {
        Ok(VerifyOutcome::Verified {
            payer,
            amount_received,
        }) => Json(json!({
            "ok": true,
            "txSig": proof.tx_sig,
            "payer": payer,
            "amountLamports": amount_received,
        }))
        .into_response(),
        Ok(VerifyOutcome::Rejected(reason)) => {
            Json(json!({ "ok": false, "reason": reason.to_string() })).into_response()
        }
        Err(Error::ReferenceNotFound(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "reason": "Reference not found" })),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// Maps crate errors onto HTTP responses.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::InvalidProof(_) => (
                StatusCode::BAD_REQUEST,
                "Invalid payment header format".to_string(),
            ),
            Error::ReferenceNotFound(_) | Error::ReferenceExpired(_) => (
                StatusCode::BAD_REQUEST,
                "Invalid or expired reference".to_string(),
            ),
            Error::ReplayDetected(_) => (
                StatusCode::BAD_REQUEST,
                "Transaction already used (replay attack)".to_string(),
            ),
            Error::PaymentRejected(reason) => (StatusCode::PAYMENT_REQUIRED, reason.to_string()),
            Error::RateLimited { retry_after_secs } => {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(RETRY_AFTER, retry_after_secs.to_string())],
                    Json(json!({
                        "error": "Too many requests. Please try again later.",
                        "retryAfter": retry_after_secs,
                    })),
                )
                    .into_response();
            }
            e if e.is_transient() => {
                warn!("Ledger unavailable: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Ledger unavailable, try again later".to_string(),
                )
            }
            e => {
                error!("Request failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
