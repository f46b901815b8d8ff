//! In-process ledger.
//!
//! Applies submitted transfers to an in-memory balance table and records them
//! as confirmed transactions, which is enough to run the full
//! challenge/pay/verify loop without a network. Failure injection hooks let
//! tests exercise retries and on-chain errors.

use super::{
    ConfirmationStatus, Ledger, LedgerInstruction, LedgerTransaction, PaymentSigner,
    SignatureStatus, SignedTransaction, TransferSummary, MEMO_PROGRAM_ID, SYSTEM_PROGRAM_ID,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Fee charged to the payer of every submitted transaction.
pub const DEFAULT_FEE_LAMPORTS: u64 = 5000;

/// Rent-exempt minimum for a zero-data account.
pub const DEFAULT_RENT_EXEMPTION_LAMPORTS: u64 = 890_880;

#[derive(Debug, Default)]
struct LedgerState {
    transactions: HashMap<String, LedgerTransaction>,
    statuses: HashMap<String, SignatureStatus>,
    balances: HashMap<String, u64>,
    rent_exemption: u64,
    fee: u64,
    transaction_fetches: u64,
    fail_fetches: u32,
    fail_status_fetches: u32,
    next_execution_error: Option<String>,
}

/// A deterministic in-memory ledger.
#[derive(Debug, Clone)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// Create an empty ledger with default fee and rent-exemption minimum.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                rent_exemption: DEFAULT_RENT_EXEMPTION_LAMPORTS,
                fee: DEFAULT_FEE_LAMPORTS,
                ..LedgerState::default()
            })),
        }
    }

    /// Set the balance of an account.
    pub fn set_balance(&self, account: &str, lamports: u64) {
        self.state.lock().balances.insert(account.to_string(), lamports);
    }

    /// Current balance of an account (zero if unknown).
    #[must_use]
    pub fn balance(&self, account: &str) -> u64 {
        self.state.lock().balances.get(account).copied().unwrap_or(0)
    }

    /// Record an arbitrary confirmed transaction.
    pub fn insert_transaction(&self, transaction: LedgerTransaction) {
        let mut state = self.state.lock();
        state.statuses.insert(
            transaction.signature.clone(),
            SignatureStatus {
                confirmation: Some(ConfirmationStatus::Confirmed),
                error: transaction.error.clone(),
            },
        );
        state
            .transactions
            .insert(transaction.signature.clone(), transaction);
    }

    /// Override the reported status of a signature.
    pub fn set_status(&self, signature: &str, status: SignatureStatus) {
        self.state
            .lock()
            .statuses
            .insert(signature.to_string(), status);
    }

    /// Make the next `count` transaction fetches fail with a transient error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().fail_fetches = count;
    }

    /// Make the next `count` signature status lookups fail with a transient error.
    pub fn fail_next_status_fetches(&self, count: u32) {
        self.state.lock().fail_status_fetches = count;
    }

    /// Make the next submitted transaction fail during execution.
    pub fn fail_next_execution(&self, reason: &str) {
        self.state.lock().next_execution_error = Some(reason.to_string());
    }

    /// Number of `get_transaction` calls served so far.
    #[must_use]
    pub fn transaction_fetches(&self) -> u64 {
        self.state.lock().transaction_fetches
    }

    /// Number of transactions recorded.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn get_transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>> {
        let mut state = self.state.lock();
        state.transaction_fetches += 1;
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(Error::Network("injected fetch failure".to_string()));
        }
        Ok(state.transactions.get(signature).cloned())
    }

    async fn get_signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>> {
        let mut state = self.state.lock();
        if state.fail_status_fetches > 0 {
            state.fail_status_fetches -= 1;
            return Err(Error::Network("injected status failure".to_string()));
        }
        Ok(state.statuses.get(signature).cloned())
    }

    async fn get_balance(&self, account: &str) -> Result<u64> {
        Ok(self.balance(account))
    }

    async fn minimum_balance_for_rent_exemption(&self) -> Result<u64> {
        Ok(self.state.lock().rent_exemption)
    }

    async fn submit_transaction(&self, transaction: &SignedTransaction) -> Result<String> {
        let summary = &transaction.summary;
        let mut state = self.state.lock();

        if state.transactions.contains_key(&transaction.signature) {
            return Err(Error::Ledger(format!(
                "transaction {} already processed",
                transaction.signature
            )));
        }

        let fee = state.fee;
        let payer_pre = state.balances.get(&summary.payer).copied().unwrap_or(0);
        let receiver_pre = state.balances.get(&summary.receiver).copied().unwrap_or(0);

        let total = summary
            .lamports
            .checked_add(fee)
            .ok_or_else(|| Error::Ledger("lamport overflow".to_string()))?;
        if payer_pre < total {
            return Err(Error::Ledger(format!(
                "insufficient funds: {} has {payer_pre}, needs {total}",
                summary.payer
            )));
        }

        // A self-transfer touches one account, which only loses the fee
        let self_transfer = summary.payer == summary.receiver;
        let receiver_credited = if self_transfer {
            receiver_pre
        } else {
            receiver_pre
                .checked_add(summary.lamports)
                .ok_or_else(|| Error::Ledger("lamport overflow".to_string()))?
        };

        let execution_error = state.next_execution_error.take();
        let (payer_post, receiver_post) = if execution_error.is_some() || self_transfer {
            // Failed transactions still pay the fee
            (payer_pre - fee, receiver_pre)
        } else {
            (payer_pre - total, receiver_credited)
        };

        state.balances.insert(summary.payer.clone(), payer_post);
        let (account_keys, pre_balances, post_balances) = if self_transfer {
            (
                vec![
                    summary.payer.clone(),
                    SYSTEM_PROGRAM_ID.to_string(),
                    MEMO_PROGRAM_ID.to_string(),
                ],
                vec![payer_pre, 1, 1],
                vec![payer_post, 1, 1],
            )
        } else {
            state
                .balances
                .insert(summary.receiver.clone(), receiver_post);
            (
                vec![
                    summary.payer.clone(),
                    summary.receiver.clone(),
                    SYSTEM_PROGRAM_ID.to_string(),
                    MEMO_PROGRAM_ID.to_string(),
                ],
                vec![payer_pre, receiver_pre, 1, 1],
                vec![payer_post, receiver_post, 1, 1],
            )
        };

        let recorded = LedgerTransaction {
            signature: transaction.signature.clone(),
            error: execution_error.clone(),
            account_keys,
            pre_balances,
            post_balances,
            instructions: vec![
                LedgerInstruction {
                    program_id: SYSTEM_PROGRAM_ID.to_string(),
                    data: summary.lamports.to_le_bytes().to_vec(),
                },
                LedgerInstruction {
                    program_id: MEMO_PROGRAM_ID.to_string(),
                    data: summary.memo.as_bytes().to_vec(),
                },
            ],
        };

        state.statuses.insert(
            transaction.signature.clone(),
            SignatureStatus {
                confirmation: Some(ConfirmationStatus::Confirmed),
                error: execution_error,
            },
        );
        state
            .transactions
            .insert(transaction.signature.clone(), recorded);

        debug!(
            "In-memory ledger applied {} lamports {} -> {}",
            summary.lamports, summary.payer, summary.receiver
        );

        Ok(transaction.signature.clone())
    }
}

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Signer producing transactions for [`InMemoryLedger`].
///
/// Signatures are random base58 strings of the usual length; nothing is
/// cryptographically signed.
#[derive(Debug, Clone)]
pub struct MemorySigner {
    payer: String,
}

impl MemorySigner {
    /// Create a signer paying from `payer`.
    #[must_use]
    pub fn new(payer: impl Into<String>) -> Self {
        Self {
            payer: payer.into(),
        }
    }

    fn random_signature() -> String {
        let mut rng = rand::thread_rng();
        (0..88)
            .map(|_| char::from(BASE58_ALPHABET[rng.gen_range(0..BASE58_ALPHABET.len())]))
            .collect()
    }
}

#[async_trait]
impl PaymentSigner for MemorySigner {
    fn payer(&self) -> &str {
        &self.payer
    }

    async fn sign_transfer_with_memo(
        &self,
        receiver: &str,
        lamports: u64,
        memo: &str,
    ) -> Result<SignedTransaction> {
        let summary = TransferSummary {
            payer: self.payer.clone(),
            receiver: receiver.to_string(),
            lamports,
            memo: memo.to_string(),
        };
        let wire = serde_json::to_vec(&(&summary.payer, &summary.receiver, lamports, memo))?;
        Ok(SignedTransaction {
            signature: Self::random_signature(),
            wire,
            summary,
        })
    }
}
