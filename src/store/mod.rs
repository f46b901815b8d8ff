//! Payment reference persistence.
//!
//! A reference moves through a two-state lifecycle:
//!
//! ```text
//!   create_reference          consume (once)
//!  ─────────────────▶ pending ───────────────▶ consumed (terminal)
//!                        │
//!                        │ sweep_expired (only once past expires_at)
//!                        ▼
//!                     removed
//! ```
//!
//! Alongside the records, every store keeps an index from transaction
//! signature to reference so that one on-chain payment can never unlock two
//! references.
//!
//! Backends:
//!
//! - [`MemoryStore`]: process-local, for tests and development.
//! - [`DiskStore`]: durable, one MessagePack file per reference.

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use crate::clock::Clock;
use crate::config::{StoreConfig, StoreDriver};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Lifecycle state of a payment reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceStatus {
    /// Issued, awaiting payment.
    Pending,
    /// Paid and released. Terminal.
    Consumed,
}

/// A persisted payment reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReference {
    /// Single-use identifier.
    pub reference: String,
    /// Lamports required while pending; lamports received once consumed.
    pub amount: u64,
    /// Lifecycle state.
    pub status: ReferenceStatus,
    /// Expiry of a pending reference.
    pub expires_at: DateTime<Utc>,
    /// When the reference was issued.
    pub created_at: DateTime<Utc>,
    /// When the reference was consumed.
    pub consumed_at: Option<DateTime<Utc>>,
    /// Signature of the transaction that paid for it.
    pub tx_sig: Option<String>,
    /// Fee payer of that transaction.
    pub payer: Option<String>,
}

impl PaymentReference {
    /// Returns true once the reference has been consumed.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.status == ReferenceStatus::Consumed
    }

    /// Returns true if the reference is pending and past its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReferenceStatus::Pending && self.expires_at < now
    }
}

/// Storage for payment references.
///
/// `consume` is the only mutual-exclusion point of the paywall: implementations
/// must perform the status check, the replay check and the update as one
/// atomic step so that two concurrent consumers of the same reference (or the
/// same signature) cannot both succeed.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Persist a new pending reference.
    ///
    /// # Errors
    ///
    /// [`Error::ReferenceExists`] if the reference is already present.
    async fn create_reference(
        &self,
        reference: &str,
        amount: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<PaymentReference>;

    /// Look up a reference in any state.
    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentReference>>;

    /// Atomically mark a pending reference as consumed by `tx_sig`.
    ///
    /// # Errors
    ///
    /// - [`Error::ReferenceNotFound`] if the reference does not exist
    /// - [`Error::AlreadyConsumed`] if it was consumed before
    /// - [`Error::ReplayDetected`] if `tx_sig` already consumed another reference
    async fn consume(
        &self,
        reference: &str,
        tx_sig: &str,
        payer: &str,
        amount: u64,
    ) -> Result<PaymentReference>;

    /// Whether `tx_sig` has consumed any reference.
    async fn is_transaction_used(&self, tx_sig: &str) -> Result<bool>;

    /// Remove pending references past their expiry. Returns how many were removed.
    async fn sweep_expired(&self) -> Result<usize>;

    /// All pending references, expired or not.
    async fn list_pending(&self) -> Result<Vec<PaymentReference>>;

    /// Flush and release resources. Called once at shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the store selected by `config`.
///
/// # Errors
///
/// Returns an error if the disk store cannot be opened.
pub async fn open_store(
    config: &StoreConfig,
    root_dir: &Path,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn ReferenceStore>> {
    match config.driver {
        StoreDriver::Memory => {
            info!("Using in-memory reference store (state is lost on restart)");
            Ok(Arc::new(MemoryStore::with_clock(clock)))
        }
        StoreDriver::Disk => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| root_dir.to_path_buf());
            let store = DiskStore::open_with_clock(path, clock).await?;
            Ok(Arc::new(store))
        }
    }
}

/// In-memory reference table shared by both backends.
///
/// Holds the state machine rules; callers provide the locking.
#[derive(Debug, Default)]
pub(crate) struct ReferenceTable {
    records: HashMap<String, PaymentReference>,
    tx_index: HashMap<String, String>,
}

impl ReferenceTable {
    /// Insert a record loaded from persistent storage, indexing its signature.
    pub(crate) fn load(&mut self, record: PaymentReference) {
        if record.is_consumed() {
            if let Some(sig) = &record.tx_sig {
                self.tx_index.insert(sig.clone(), record.reference.clone());
            }
        }
        self.records.insert(record.reference.clone(), record);
    }

    pub(crate) fn create(
        &mut self,
        reference: &str,
        amount: u64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PaymentReference> {
        if self.records.contains_key(reference) {
            return Err(Error::ReferenceExists(reference.to_string()));
        }
        let record = PaymentReference {
            reference: reference.to_string(),
            amount,
            status: ReferenceStatus::Pending,
            expires_at,
            created_at: now,
            consumed_at: None,
            tx_sig: None,
            payer: None,
        };
        self.records.insert(reference.to_string(), record.clone());
        Ok(record)
    }

    pub(crate) fn get(&self, reference: &str) -> Option<&PaymentReference> {
        self.records.get(reference)
    }

    pub(crate) fn consume(
        &mut self,
        reference: &str,
        tx_sig: &str,
        payer: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<PaymentReference> {
        let used_by = self.tx_index.get(tx_sig).cloned();
        let record = self
            .records
            .get_mut(reference)
            .ok_or_else(|| Error::ReferenceNotFound(reference.to_string()))?;

        if record.is_consumed() {
            return Err(Error::AlreadyConsumed(reference.to_string()));
        }
        if let Some(other) = used_by {
            return Err(Error::ReplayDetected(format!(
                "{} already consumed reference {other}",
                short_sig(tx_sig)
            )));
        }

        record.status = ReferenceStatus::Consumed;
        record.tx_sig = Some(tx_sig.to_string());
        record.payer = Some(payer.to_string());
        record.amount = amount;
        record.consumed_at = Some(now);
        let consumed = record.clone();

        self.tx_index
            .insert(tx_sig.to_string(), reference.to_string());
        Ok(consumed)
    }

    /// Put back a record exactly as it was, undoing a `create` or `consume`
    /// whose persistence failed.
    pub(crate) fn revert(&mut self, reference: &str, previous: Option<PaymentReference>) {
        if let Some(current) = self.records.get(reference) {
            if let Some(sig) = &current.tx_sig {
                self.tx_index.remove(sig);
            }
        }
        match previous {
            Some(record) => self.load(record),
            None => {
                self.records.remove(reference);
            }
        }
    }

    pub(crate) fn is_transaction_used(&self, tx_sig: &str) -> bool {
        self.tx_index.contains_key(tx_sig)
    }

    pub(crate) fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<PaymentReference> {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.reference.clone())
            .collect();

        expired
            .iter()
            .filter_map(|reference| self.records.remove(reference))
            .collect()
    }

    pub(crate) fn pending(&self) -> Vec<PaymentReference> {
        self.records
            .values()
            .filter(|r| r.status == ReferenceStatus::Pending)
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Shorten a transaction signature for logs: first 8 and last 4 characters.
#[must_use]
pub fn short_sig(tx_sig: &str) -> String {
    let chars: Vec<char> = tx_sig.chars().collect();
    if chars.len() <= 12 {
        return tx_sig.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
