//! Ledger capabilities consumed by the verifier and the client.
//!
//! The paywall never trusts what a client claims about a payment; it reads
//! the transaction back from the ledger. This module defines the narrow view
//! of ledger state the rest of the crate needs, and the [`Ledger`] trait
//! through which it is obtained.
//!
//! Two implementations are provided:
//!
//! - [`RpcLedger`]: JSON-RPC over HTTP against a Solana-compatible node.
//! - [`InMemoryLedger`]: a deterministic in-process ledger for tests and
//!   local demos.

mod memory;
mod rpc;

pub use memory::{
    InMemoryLedger, MemorySigner, DEFAULT_FEE_LAMPORTS, DEFAULT_RENT_EXEMPTION_LAMPORTS,
};
pub use rpc::{Commitment, RpcLedger, RpcLedgerConfig};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Program id of the SPL memo program.
pub const MEMO_PROGRAM_ID: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";

/// Program id of the deprecated v1 memo program, still accepted on read.
pub const LEGACY_MEMO_PROGRAM_ID: &str = "Memo1UhkJRfHyvLMcVucJwxXeuD728EqVDDwQDxFMNo";

/// Program id of the native system program (lamport transfers).
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

/// An instruction as recorded in a confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInstruction {
    /// Base58 address of the invoked program.
    pub program_id: String,
    /// Instruction payload. For memo instructions this is the UTF-8 memo.
    pub data: Vec<u8>,
}

impl LedgerInstruction {
    /// Returns true if this instruction invokes a memo program.
    #[must_use]
    pub fn is_memo(&self) -> bool {
        self.program_id == MEMO_PROGRAM_ID || self.program_id == LEGACY_MEMO_PROGRAM_ID
    }
}

/// A confirmed transaction, reduced to what payment verification reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Transaction signature.
    pub signature: String,
    /// Execution error recorded on-chain, if the transaction failed.
    pub error: Option<String>,
    /// All account keys referenced by the message. Index 0 is the fee payer.
    pub account_keys: Vec<String>,
    /// Balances in lamports before execution, indexed like `account_keys`.
    pub pre_balances: Vec<u64>,
    /// Balances in lamports after execution, indexed like `account_keys`.
    pub post_balances: Vec<u64>,
    /// Top-level instructions in execution order.
    pub instructions: Vec<LedgerInstruction>,
}

impl LedgerTransaction {
    /// The fee payer, i.e. the first account key.
    #[must_use]
    pub fn fee_payer(&self) -> Option<&str> {
        self.account_keys.first().map(String::as_str)
    }

    /// Position of `account` among the account keys.
    #[must_use]
    pub fn account_index(&self, account: &str) -> Option<usize> {
        self.account_keys.iter().position(|key| key == account)
    }

    /// Lamport balance change of the account at `index`.
    ///
    /// Returns `None` if either balance is missing for that index.
    #[must_use]
    pub fn balance_delta(&self, index: usize) -> Option<i128> {
        let pre = *self.pre_balances.get(index)?;
        let post = *self.post_balances.get(index)?;
        Some(i128::from(post) - i128::from(pre))
    }

    /// Memo payloads carried by this transaction, decoded lossily as UTF-8.
    pub fn memos(&self) -> impl Iterator<Item = String> + '_ {
        self.instructions
            .iter()
            .filter(|ix| ix.is_memo())
            .map(|ix| String::from_utf8_lossy(&ix.data).into_owned())
    }
}

/// Confirmation level reported for a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    /// Seen by the node, not yet voted on.
    Processed,
    /// Voted on by a supermajority.
    Confirmed,
    /// Rooted; cannot be rolled back.
    Finalized,
}

impl ConfirmationStatus {
    /// Returns true for levels the client accepts as paid.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Finalized)
    }
}

/// Status of a submitted signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureStatus {
    /// Confirmation level, if the node reports one.
    pub confirmation: Option<ConfirmationStatus>,
    /// Execution error, if the transaction failed.
    pub error: Option<String>,
}

/// What a signer put into a transfer-plus-memo transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Paying account (fee payer and transfer source).
    pub payer: String,
    /// Receiving account.
    pub receiver: String,
    /// Lamports transferred.
    pub lamports: u64,
    /// Memo payload.
    pub memo: String,
}

/// A fully signed transaction ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// The transaction's first signature, which identifies it on-chain.
    pub signature: String,
    /// Serialized wire bytes.
    pub wire: Vec<u8>,
    /// The transfer the signer encoded.
    pub summary: TransferSummary,
}

/// Read and submit access to the ledger.
///
/// Implementations report transport failures as [`crate::Error::Network`] so
/// that callers can retry them; everything else is treated as final.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Fetch a confirmed transaction by signature. `Ok(None)` if unknown.
    async fn get_transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>>;

    /// Fetch the status of a signature. `Ok(None)` if the node has not seen it.
    async fn get_signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>>;

    /// Current balance of `account` in lamports.
    async fn get_balance(&self, account: &str) -> Result<u64>;

    /// Minimum balance for a zero-data account to be rent exempt.
    async fn minimum_balance_for_rent_exemption(&self) -> Result<u64>;

    /// Submit a signed transaction, returning its signature.
    async fn submit_transaction(&self, transaction: &SignedTransaction) -> Result<String>;
}

/// Signs transfer-plus-memo transactions on behalf of a wallet.
///
/// Key custody lives outside this crate; implementations wrap whatever wallet
/// or keystore holds the payer's key.
#[async_trait]
pub trait PaymentSigner: Send + Sync {
    /// Address of the paying account.
    fn payer(&self) -> &str;

    /// Build and sign a transaction transferring `lamports` to `receiver`
    /// with a memo instruction carrying `memo`.
    async fn sign_transfer_with_memo(
        &self,
        receiver: &str,
        lamports: u64,
        memo: &str,
    ) -> Result<SignedTransaction>;
}
