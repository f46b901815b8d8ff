//! Durable reference store with sharded directories.
//!
//! Each reference is one MessagePack file:
//!
//! ```text
//! {root}/references/{xx}/{yy}/{reference}.ref
//! ```
//!
//! Where `xx` and `yy` are the first two pairs of characters of the
//! reference. The full record set is loaded at open and kept in memory; every
//! mutation is written through to disk before it becomes visible.

use super::{PaymentReference, ReferenceStore, ReferenceTable};
use crate::clock::{system_clock, Clock};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

const RECORD_EXTENSION: &str = "ref";
const TEMP_EXTENSION: &str = "tmp";

/// Statistics about store operations since open.
#[derive(Debug, Clone, Default)]
pub struct DiskStoreStats {
    /// Records loaded from disk at open.
    pub loaded: u64,
    /// Files skipped at open because they could not be decoded.
    pub corrupt: u64,
    /// Records written.
    pub writes: u64,
    /// Records deleted by sweeps.
    pub deletes: u64,
}

/// Reference store persisted to the local filesystem.
pub struct DiskStore {
    /// Directory holding the shard tree.
    dir: PathBuf,
    /// In-memory view. The async mutex is held across the disk write so
    /// that no other operation observes an unpersisted change.
    table: Mutex<ReferenceTable>,
    clock: Arc<dyn Clock>,
    stats: parking_lot::RwLock<DiskStoreStats>,
}

impl DiskStore {
    /// Open (or create) a store under `root_dir` using the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or scanned.
    pub async fn open(root_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_clock(root_dir, system_clock()).await
    }

    /// Open (or create) a store under `root_dir` reading time from `clock`.
    ///
    /// Unreadable record files are logged and skipped; leftover temp files
    /// from an interrupted write are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or scanned.
    pub async fn open_with_clock(
        root_dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dir = root_dir.into().join("references");
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create references directory: {e}")))?;

        let mut table = ReferenceTable::default();
        let mut stats = DiskStoreStats::default();
        for path in Self::record_files(&dir).await? {
            match Self::read_record(&path).await {
                Ok(record) => {
                    table.load(record);
                    stats.loaded += 1;
                }
                Err(e) => {
                    warn!("Skipping unreadable reference file {}: {e}", path.display());
                    stats.corrupt += 1;
                }
            }
        }

        info!(
            "Opened reference store at {} ({} records)",
            dir.display(),
            stats.loaded
        );

        Ok(Self {
            dir,
            table: Mutex::new(table),
            clock,
            stats: parking_lot::RwLock::new(stats),
        })
    }

    /// Get store statistics.
    #[must_use]
    pub fn stats(&self) -> DiskStoreStats {
        self.stats.read().clone()
    }

    /// Walk the two shard levels and collect record files.
    async fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut outer = read_dir(dir).await?;
        while let Some(shard1) = next_entry(&mut outer).await? {
            if !shard1.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let mut middle = read_dir(&shard1.path()).await?;
            while let Some(shard2) = next_entry(&mut middle).await? {
                if !shard2.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let mut inner = read_dir(&shard2.path()).await?;
                while let Some(entry) = next_entry(&mut inner).await? {
                    let path = entry.path();
                    match path.extension().and_then(|e| e.to_str()) {
                        Some(RECORD_EXTENSION) => files.push(path),
                        Some(TEMP_EXTENSION) => {
                            debug!("Removing interrupted write {}", path.display());
                            if let Err(e) = fs::remove_file(&path).await {
                                warn!("Failed to remove {}: {e}", path.display());
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(files)
    }

    async fn read_record(path: &Path) -> Result<PaymentReference> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read record: {e}")))?;
        rmp_serde::from_slice(&bytes)
            .map_err(|e| Error::Serialization(format!("Failed to decode record: {e}")))
    }

    /// Write a record with temp file + rename.
    async fn write_record(&self, record: &PaymentReference) -> Result<()> {
        let path = self.record_path(&record.reference);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create shard directory: {e}")))?;
        }

        let bytes = rmp_serde::to_vec_named(record)
            .map_err(|e| Error::Serialization(format!("Failed to encode record: {e}")))?;

        let temp_path = path.with_extension(TEMP_EXTENSION);
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create temp file: {e}")))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write record: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Storage(format!("Failed to sync record: {e}")))?;
        drop(file);

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to rename temp file: {e}")))?;

        self.stats.write().writes += 1;
        trace!("Wrote reference {} ({} bytes)", record.reference, bytes.len());
        Ok(())
    }

    fn record_path(&self, reference: &str) -> PathBuf {
        let mut chars = reference.chars().chain(std::iter::repeat('_'));
        let shard1: String = chars.by_ref().take(2).collect();
        let shard2: String = chars.take(2).collect();
        self.dir
            .join(shard1)
            .join(shard2)
            .join(format!("{reference}.{RECORD_EXTENSION}"))
    }
}

/// References become file names, so only a conservative alphabet is accepted.
fn validate_reference(reference: &str) -> Result<()> {
    let valid = !reference.is_empty()
        && reference.len() <= 128
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Storage(format!(
            "reference {reference:?} contains unsupported characters"
        )))
    }
}

async fn read_dir(path: &Path) -> Result<fs::ReadDir> {
    fs::read_dir(path)
        .await
        .map_err(|e| Error::Storage(format!("Failed to scan {}: {e}", path.display())))
}

async fn next_entry(dir: &mut fs::ReadDir) -> Result<Option<fs::DirEntry>> {
    dir.next_entry()
        .await
        .map_err(|e| Error::Storage(format!("Failed to scan directory: {e}")))
}

#[async_trait]
impl ReferenceStore for DiskStore {
    async fn create_reference(
        &self,
        reference: &str,
        amount: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<PaymentReference> {
        validate_reference(reference)?;
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let record = table.create(reference, amount, expires_at, now)?;
        if let Err(e) = self.write_record(&record).await {
            table.revert(reference, None);
            return Err(e);
        }
        Ok(record)
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentReference>> {
        Ok(self.table.lock().await.get(reference).cloned())
    }

    async fn consume(
        &self,
        reference: &str,
        tx_sig: &str,
        payer: &str,
        amount: u64,
    ) -> Result<PaymentReference> {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let previous = table.get(reference).cloned();
        let record = table.consume(reference, tx_sig, payer, amount, now)?;
        if let Err(e) = self.write_record(&record).await {
            table.revert(reference, previous);
            return Err(e);
        }
        Ok(record)
    }

    async fn is_transaction_used(&self, tx_sig: &str) -> Result<bool> {
        Ok(self.table.lock().await.is_transaction_used(tx_sig))
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let removed = table.sweep_expired(now);

        for record in &removed {
            let path = self.record_path(&record.reference);
            match fs::remove_file(&path).await {
                Ok(()) => {
                    self.stats.write().deletes += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                // Left on disk it is loaded as expired and swept again next run
                Err(e) => warn!("Failed to delete {}: {e}", path.display()),
            }
        }

        if !removed.is_empty() {
            debug!("Swept {} expired references from disk", removed.len());
        }
        Ok(removed.len())
    }

    async fn list_pending(&self) -> Result<Vec<PaymentReference>> {
        Ok(self.table.lock().await.pending())
    }

    async fn close(&self) -> Result<()> {
        // Writes are synced as they happen; hold the lock so none is in flight.
        let table = self.table.lock().await;
        info!("Closed reference store ({} records)", table.len());
        Ok(())
    }
}
