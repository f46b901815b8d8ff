//! Wire types of the 402 challenge/response exchange.

use crate::error::{Error, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD as BASE64};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default name of the request header carrying a payment proof.
pub const DEFAULT_PAYMENT_HEADER: &str = "X-Payment";

/// Proof headers are accepted with or without padding.
const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);

const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Ledger cluster a payment must be made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Network {
    /// Development cluster.
    #[default]
    #[serde(rename = "devnet")]
    Devnet,
    /// Test cluster.
    #[serde(rename = "testnet")]
    Testnet,
    /// Production cluster.
    #[serde(rename = "mainnet-beta")]
    MainnetBeta,
}

impl Network {
    /// Wire name of the network.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Devnet => "devnet",
            Self::Testnet => "testnet",
            Self::MainnetBeta => "mainnet-beta",
        }
    }

    /// Public RPC endpoint for the network.
    #[must_use]
    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Self::Devnet => "https://api.devnet.solana.com",
            Self::Testnet => "https://api.testnet.solana.com",
            Self::MainnetBeta => "https://api.mainnet-beta.solana.com",
        }
    }

    /// Guess the network from substrings of an RPC URL, defaulting to devnet.
    #[deprecated(note = "configure the network explicitly")]
    #[must_use]
    pub fn infer_from_rpc_url(rpc_url: &str) -> Self {
        if rpc_url.contains("devnet") {
            Self::Devnet
        } else if rpc_url.contains("mainnet") {
            Self::MainnetBeta
        } else if rpc_url.contains("testnet") {
            Self::Testnet
        } else {
            Self::Devnet
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "devnet" => Ok(Self::Devnet),
            "testnet" => Ok(Self::Testnet),
            "mainnet-beta" | "mainnet" => Ok(Self::MainnetBeta),
            other => Err(Error::Config(format!("unknown network: {other}"))),
        }
    }
}

/// The body of a 402 response: what the client must pay, to whom, by when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Lamports to transfer.
    #[serde(alias = "amountLamports")]
    pub amount: u64,
    /// Address that must receive the transfer.
    #[serde(alias = "receiver")]
    pub receiver_address: String,
    /// Single-use reference to embed in the memo.
    pub reference: String,
    /// Cluster the payment must be made on.
    pub network: Network,
    /// Token mint. Always `None`: only native transfers are accepted.
    #[serde(default)]
    pub mint: Option<String>,
    /// When the reference stops being accepted.
    pub expires_at: DateTime<Utc>,
}

/// What a client presents after paying: the transaction and the reference it
/// pays for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    /// Signature of the paying transaction.
    pub tx_sig: String,
    /// Reference from the challenge.
    pub reference: String,
}

impl PaymentProof {
    /// Create a proof.
    #[must_use]
    pub fn new(tx_sig: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            tx_sig: tx_sig.into(),
            reference: reference.into(),
        }
    }

    /// Encode as a header value: base64 of the JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn encode_header(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    /// Decode a header value.
    ///
    /// # Errors
    ///
    /// Standard and URL-safe alphabets are both accepted, padded or not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProof`] if the value is not base64, not JSON,
    /// lacks a field, or carries an empty field.
    pub fn decode_header(value: &str) -> Result<Self> {
        let value = value.trim();
        let bytes = LENIENT_STANDARD
            .decode(value)
            .or_else(|e| LENIENT_URL_SAFE.decode(value).map_err(|_| e))
            .map_err(|e| Error::InvalidProof(format!("not base64: {e}")))?;
        let proof: Self = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidProof(format!("not a proof object: {e}")))?;
        if proof.tx_sig.is_empty() || proof.reference.is_empty() {
            return Err(Error::InvalidProof("empty txSig or reference".to_string()));
        }
        Ok(proof)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding_is_base64_json() {
        let proof = PaymentProof::new("sig-1", "ref-1");
        let header = proof.encode_header().unwrap();

        let raw = BASE64.decode(&header).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["txSig"], "sig-1");
        assert_eq!(json["reference"], "ref-1");

        assert_eq!(PaymentProof::decode_header(&header).unwrap(), proof);
    }

    #[test]
    fn test_unpadded_and_url_safe_headers_accepted() {
        use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

        let mut saw_url_safe_chars = false;
        for pad in 0..3 {
            let proof = PaymentProof::new(format!("{}??????~~~~~~", "x".repeat(pad)), "ref-1");
            let json = serde_json::to_vec(&proof).unwrap();

            for engine in [&STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
                let header = engine.encode(&json);
                saw_url_safe_chars |= header.contains('-') || header.contains('_');
                assert_eq!(PaymentProof::decode_header(&header).unwrap(), proof, "{header}");
            }
        }
        assert!(saw_url_safe_chars);
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let values = vec![
            "%%%not-base64%%%".to_string(),
            BASE64.encode(b"not json"),
            BASE64.encode(br#"{"txSig":"abc"}"#),
            BASE64.encode(br#"{"txSig":"","reference":"r"}"#),
        ];
        for value in &values {
            let err = PaymentProof::decode_header(value).unwrap_err();
            assert!(matches!(err, Error::InvalidProof(_)), "{value}: {err}");
        }
    }

    #[test]
    fn test_requirements_wire_shape() {
        let expires_at = DateTime::parse_from_rfc3339("2025-01-01T00:05:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let requirements = PaymentRequirements {
            amount: 5000,
            receiver_address: "Recv111".to_string(),
            reference: "ref".to_string(),
            network: Network::MainnetBeta,
            mint: None,
            expires_at,
        };
        let json = serde_json::to_value(&requirements).unwrap();
        assert_eq!(json["amount"], 5000);
        assert_eq!(json["receiverAddress"], "Recv111");
        assert_eq!(json["network"], "mainnet-beta");
        assert!(json["mint"].is_null());
        assert!(json["expiresAt"].is_string());
    }

    #[test]
    fn test_requirements_accept_legacy_field_names() {
        let body = r#"{
            "amountLamports": 7000,
            "receiver": "Recv222",
            "reference": "ref",
            "network": "devnet",
            "expiresAt": "2025-01-01T00:05:00Z"
        }"#;
        let parsed: PaymentRequirements = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.amount, 7000);
        assert_eq!(parsed.receiver_address, "Recv222");
        assert_eq!(parsed.mint, None);
    }

    #[test]
    #[allow(deprecated)]
    fn test_network_inference() {
        assert_eq!(
            Network::infer_from_rpc_url("https://api.devnet.solana.com"),
            Network::Devnet
        );
        assert_eq!(
            Network::infer_from_rpc_url("https://api.mainnet-beta.solana.com"),
            Network::MainnetBeta
        );
        assert_eq!(
            Network::infer_from_rpc_url("https://api.testnet.solana.com"),
            Network::Testnet
        );
        assert_eq!(
            Network::infer_from_rpc_url("http://127.0.0.1:8899"),
            Network::Devnet
        );
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert!("moonnet".parse::<Network>().is_err());
    }
}
