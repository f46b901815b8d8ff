//! Process-local reference store.

use super::{PaymentReference, ReferenceStore, ReferenceTable};
use crate::clock::{system_clock, Clock};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Reference store backed by a mutex-guarded map. State is lost on restart.
pub struct MemoryStore {
    table: Mutex<ReferenceTable>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an empty store reading time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(ReferenceTable::default()),
            clock,
        }
    }

    /// Number of records held, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReferenceStore for MemoryStore {
    async fn create_reference(
        &self,
        reference: &str,
        amount: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<PaymentReference> {
        let now = self.clock.now();
        self.table.lock().create(reference, amount, expires_at, now)
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentReference>> {
        Ok(self.table.lock().get(reference).cloned())
    }

    async fn consume(
        &self,
        reference: &str,
        tx_sig: &str,
        payer: &str,
        amount: u64,
    ) -> Result<PaymentReference> {
        let now = self.clock.now();
        self.table
            .lock()
            .consume(reference, tx_sig, payer, amount, now)
    }

    async fn is_transaction_used(&self, tx_sig: &str) -> Result<bool> {
        Ok(self.table.lock().is_transaction_used(tx_sig))
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let removed = self.table.lock().sweep_expired(now).len();
        if removed > 0 {
            debug!("Swept {removed} expired references from memory");
        }
        Ok(removed)
    }

    async fn list_pending(&self) -> Result<Vec<PaymentReference>> {
        Ok(self.table.lock().pending())
    }
}
