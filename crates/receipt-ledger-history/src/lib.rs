//! Identity-scoped receipt history on top of the namespace store: listing,
//! saving, deletion, sync-on-login, legacy migration, and versioned backups.

use std::collections::BTreeSet;
use std::path::Path;

use receipt_ledger_core::{
    merge_collections, now_millis, sort_newest_first, Identity, LedgerError, Namespace, Receipt,
    ReceiptDraft, ReceiptId, LEGACY_NAMESPACES,
};
use receipt_ledger_store_sqlite::{SqliteStore, StorageUsage, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

mod retry;

/// Version tag written into every backup envelope.
pub const BACKUP_VERSION: &str = "1";

/// How many of the oldest records one capacity eviction drops before the
/// failed write is retried.
const EVICTION_BATCH: usize = 10;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid receipt draft: {0}")]
    Draft(#[from] LedgerError),

    #[error("payload is not a valid backup: {0}")]
    BackupFormat(String),

    #[error("unsupported backup version: {0}")]
    BackupVersion(String),

    #[error("backup digest mismatch: expected {expected}, computed {computed}")]
    BackupDigest { expected: String, computed: String },

    #[error("timestamp formatting error: {0}")]
    Timestamp(#[from] time::error::Format),

    #[error("backup encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(
        "storage is full: a {payload_bytes} byte write still exceeds the {quota_bytes} byte quota after evicting {evicted} records"
    )]
    CapacityExhausted { payload_bytes: usize, quota_bytes: usize, evicted: usize },
}

/// Portable backup envelope: a versioned JSON document carrying one record
/// collection plus an integrity digest over its serialized form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub version: String,
    pub exported_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_sha256: Option<String>,
    pub records: Vec<Receipt>,
}

/// Outcome of one sync-on-login merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub namespace: String,
    pub merged_records: usize,
    pub moved_from_local: usize,
    pub already_in_cloud: usize,
}

/// Outcome of one backup import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub namespace: String,
    pub imported_records: usize,
    pub skipped_existing_records: usize,
    pub total_records: usize,
}

/// Receipt history facade. Holds the store exclusively, so every operation on
/// one service instance is serialized through `&mut self`.
pub struct HistoryService {
    store: SqliteStore,
}

impl HistoryService {
    /// Open a history service over the database at `path`.
    ///
    /// # Errors
    /// Returns an error when the backing store cannot be opened.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        Ok(Self { store: SqliteStore::open(path)? })
    }

    #[must_use]
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// All receipts visible to `identity`, newest first. For the anonymous
    /// namespace this first absorbs any legacy record collections.
    ///
    /// # Errors
    /// Returns an error when storage access fails. A corrupt payload in the
    /// resolved namespace reads as an empty collection, not an error.
    pub fn list(&mut self, identity: Option<&Identity>) -> Result<Vec<Receipt>, HistoryError> {
        let namespace = Namespace::resolve(identity);
        let mut records = self.collection(&namespace)?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    /// Normalize `draft` into a receipt stamped with the current time and
    /// `identity`, and prepend it to the resolved namespace.
    ///
    /// On a capacity failure the oldest records are evicted once and the
    /// write retried; if even that write does not fit, the stored collection
    /// keeps its evicted shape and [`HistoryError::CapacityExhausted`] is
    /// returned.
    ///
    /// # Errors
    /// Returns [`HistoryError::Draft`] for a draft that fails validation and
    /// storage errors otherwise.
    pub fn save(
        &mut self,
        draft: ReceiptDraft,
        identity: Option<&Identity>,
    ) -> Result<Receipt, HistoryError> {
        let namespace = Namespace::resolve(identity);
        let record = draft.normalize(now_millis(), identity)?;

        let mut records = self.collection(&namespace)?;
        records.insert(0, record.clone());

        match self.write_collection(&namespace, &records) {
            Ok(()) => Ok(record),
            Err(StoreError::Capacity { .. }) => self.save_with_eviction(&namespace, records, record),
            Err(err) => Err(err.into()),
        }
    }

    fn save_with_eviction(
        &mut self,
        namespace: &Namespace,
        records: Vec<Receipt>,
        record: Receipt,
    ) -> Result<Receipt, HistoryError> {
        // Eviction sheds only pre-existing history; the incoming record is
        // held aside and re-inserted at the front.
        let mut rest: Vec<Receipt> =
            records.into_iter().filter(|existing| existing.id != record.id).collect();
        sort_newest_first(&mut rest);

        let keep = rest.len().saturating_sub(EVICTION_BATCH);
        let evicted = rest.len() - keep;
        rest.truncate(keep);

        warn!(
            namespace = %namespace,
            evicted,
            "storage quota reached, evicting oldest records and retrying"
        );

        let mut retained = Vec::with_capacity(rest.len() + 1);
        retained.push(record.clone());
        retained.extend(rest);

        match self.write_collection(namespace, &retained) {
            Ok(()) => Ok(record),
            Err(StoreError::Capacity { payload_bytes, quota_bytes, .. }) => {
                Err(HistoryError::CapacityExhausted { payload_bytes, quota_bytes, evicted })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove the receipt with `id` from the resolved namespace and return
    /// the remaining collection, newest first. Deleting an id that is not
    /// present is a no-op.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn delete(
        &mut self,
        id: &ReceiptId,
        identity: Option<&Identity>,
    ) -> Result<Vec<Receipt>, HistoryError> {
        let namespace = Namespace::resolve(identity);
        let mut records = self.collection(&namespace)?;

        let before = records.len();
        records.retain(|record| record.id != *id);
        if records.len() != before {
            self.write_collection(&namespace, &records)?;
        }

        sort_newest_first(&mut records);
        Ok(records)
    }

    /// One-way sync-on-login: merge the anonymous collection into the cloud
    /// namespace of `identity` (existing cloud records win on id collisions),
    /// then clear the anonymous namespace. The destination is written before
    /// the source is cleared, so a failed sync leaves the anonymous records
    /// in place.
    ///
    /// # Errors
    /// Returns an error when either namespace cannot be read or written.
    pub fn sync(&mut self, identity: &Identity) -> Result<SyncReport, HistoryError> {
        let anonymous = Namespace::anonymous();
        let cloud = Namespace::for_identity(identity);

        let local = self.collection(&anonymous)?;
        let existing = self.read_resilient(&cloud)?;

        let existing_ids: BTreeSet<&ReceiptId> =
            existing.iter().filter(|record| !record.id.is_empty()).map(|record| &record.id).collect();
        let moved_from_local = local
            .iter()
            .filter(|record| !record.id.is_empty() && !existing_ids.contains(&record.id))
            .map(|record| &record.id)
            .collect::<BTreeSet<_>>()
            .len();

        let merged = merge_collections(&existing, &local, Some(identity));

        self.write_collection(&cloud, &merged)?;
        self.store.delete_namespace(&anonymous)?;

        info!(
            namespace = %cloud,
            merged_records = merged.len(),
            moved_from_local,
            "sync-on-login complete"
        );

        Ok(SyncReport {
            namespace: cloud.to_string(),
            merged_records: merged.len(),
            moved_from_local,
            already_in_cloud: existing.len(),
        })
    }

    /// Serialize the resolved namespace into a portable backup document.
    ///
    /// # Errors
    /// Returns an error when storage access or serialization fails.
    pub fn export(&mut self, identity: Option<&Identity>) -> Result<Vec<u8>, HistoryError> {
        let records = self.list(identity)?;
        let serialized_records = serde_json::to_string(&records)?;

        let backup = BackupFile {
            version: BACKUP_VERSION.to_string(),
            exported_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
            records_sha256: Some(sha256_hex(serialized_records.as_bytes())),
            records,
        };

        Ok(serde_json::to_vec_pretty(&backup)?)
    }

    /// Merge a backup document into the resolved namespace. Records already
    /// present keep their stored form; imported records are re-stamped with
    /// `identity` where their owner differs. A payload that is not a valid
    /// backup fails before anything is written.
    ///
    /// # Errors
    /// Returns [`HistoryError::BackupFormat`], [`HistoryError::BackupVersion`],
    /// or [`HistoryError::BackupDigest`] for a rejected payload, and storage
    /// errors otherwise.
    pub fn import(
        &mut self,
        payload: &[u8],
        identity: Option<&Identity>,
    ) -> Result<ImportReport, HistoryError> {
        let backup: BackupFile = serde_json::from_slice(payload)
            .map_err(|err| HistoryError::BackupFormat(err.to_string()))?;

        if backup.version != BACKUP_VERSION {
            return Err(HistoryError::BackupVersion(backup.version));
        }

        if let Some(expected) = &backup.records_sha256 {
            let serialized = serde_json::to_string(&backup.records)?;
            let computed = sha256_hex(serialized.as_bytes());
            if &computed != expected {
                return Err(HistoryError::BackupDigest {
                    expected: expected.clone(),
                    computed,
                });
            }
        }

        let namespace = Namespace::resolve(identity);
        let current = self.collection(&namespace)?;

        let current_ids: BTreeSet<&ReceiptId> =
            current.iter().filter(|record| !record.id.is_empty()).map(|record| &record.id).collect();
        let incoming_ids: BTreeSet<&ReceiptId> = backup
            .records
            .iter()
            .filter(|record| !record.id.is_empty())
            .map(|record| &record.id)
            .collect();
        let imported_records =
            incoming_ids.iter().filter(|id| !current_ids.contains(*id)).count();
        let skipped_existing_records = incoming_ids.len() - imported_records;

        let merged = merge_collections(&current, &backup.records, identity);
        self.write_collection(&namespace, &merged)?;

        info!(
            namespace = %namespace,
            imported_records,
            skipped_existing_records,
            "backup import complete"
        );

        Ok(ImportReport {
            namespace: namespace.to_string(),
            imported_records,
            skipped_existing_records,
            total_records: merged.len(),
        })
    }

    /// Per-namespace storage footprint, including corruption flags.
    ///
    /// # Errors
    /// Returns an error when the underlying usage walk fails.
    pub fn storage_report(&self) -> Result<StorageUsage, HistoryError> {
        Ok(self.store.usage()?)
    }

    /// Resolved read for one namespace: anonymous reads absorb legacy
    /// collections first, and a corrupt payload degrades to empty.
    fn collection(&mut self, namespace: &Namespace) -> Result<Vec<Receipt>, HistoryError> {
        if namespace.is_anonymous() {
            self.migrate_legacy_namespaces()?;
        }
        Ok(self.read_resilient(namespace)?)
    }

    fn read_resilient(&self, namespace: &Namespace) -> Result<Vec<Receipt>, StoreError> {
        match self.store.read_namespace(namespace) {
            Ok(records) => Ok(records),
            Err(StoreError::Corrupt { namespace, detail }) => {
                warn!(namespace = %namespace, detail = %detail, "treating undecodable namespace as empty");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Absorb the fixed legacy namespaces into the anonymous one. Runs only
    /// while the anonymous namespace is empty, so it is a no-op on every
    /// store that has already migrated.
    fn migrate_legacy_namespaces(&mut self) -> Result<(), HistoryError> {
        let anonymous = Namespace::anonymous();
        if !self.read_resilient(&anonymous)?.is_empty() {
            return Ok(());
        }

        let mut absorbed: Vec<Receipt> = Vec::new();
        for name in LEGACY_NAMESPACES {
            let legacy = Namespace::named(name);
            let records = match self.store.read_namespace(&legacy) {
                Ok(records) => records,
                Err(StoreError::Corrupt { detail, .. }) => {
                    warn!(namespace = name, detail = %detail, "skipping undecodable legacy namespace");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if records.is_empty() {
                continue;
            }

            info!(namespace = name, records = records.len(), "absorbing legacy namespace");
            absorbed.extend(records);
            self.store.delete_namespace(&legacy)?;
        }

        if !absorbed.is_empty() {
            self.write_collection(&anonymous, &absorbed)?;
        }
        Ok(())
    }

    fn write_collection(
        &mut self,
        namespace: &Namespace,
        records: &[Receipt],
    ) -> Result<(), StoreError> {
        let store = &mut self.store;
        retry::with_retry(&retry::WRITE_RETRY, || store.write_namespace(namespace, records))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
