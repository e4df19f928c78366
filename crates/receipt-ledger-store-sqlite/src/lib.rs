use std::path::Path;

use receipt_ledger_core::{Namespace, Receipt};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const CREATE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS namespaces (
  namespace TEXT PRIMARY KEY,
  payload TEXT NOT NULL,
  updated_at_ms INTEGER NOT NULL
);
";

/// Storage-layer failures. `Busy` and `Capacity` are separated out because
/// callers react to them differently: busy writes are retryable, capacity
/// failures call for eviction.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("storage is busy: {0}")]
    Busy(rusqlite::Error),

    #[error("namespace {namespace} holds an undecodable payload: {detail}")]
    Corrupt { namespace: String, detail: String },

    #[error("write of {payload_bytes} bytes to namespace {namespace} exceeds the {quota_bytes} byte quota")]
    Capacity { namespace: String, payload_bytes: usize, quota_bytes: usize },

    #[error("payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// True for failures that a short backoff-and-retry can clear.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return Self::Busy(err);
            }
        }
        Self::Sqlite(err)
    }
}

/// Stored footprint of one namespace, as reported by [`SqliteStore::usage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceUsage {
    pub namespace: String,
    pub records: usize,
    pub payload_bytes: usize,
    pub corrupt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageUsage {
    pub namespaces: Vec<NamespaceUsage>,
    pub total_bytes: usize,
    pub quota_bytes: Option<usize>,
}

/// SQLite-backed record store: one JSON array of receipts per namespace,
/// always replaced wholesale.
pub struct SqliteStore {
    conn: Connection,
    quota_bytes: Option<usize>,
}

impl SqliteStore {
    /// Open the backing database, configure runtime pragmas, and ensure the
    /// namespace table exists.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(CREATE_SCHEMA_SQL)?;

        Ok(Self { conn, quota_bytes: None })
    }

    /// Cap every namespace write at `quota_bytes` of serialized payload.
    #[must_use]
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    #[must_use]
    pub fn quota_bytes(&self) -> Option<usize> {
        self.quota_bytes
    }

    /// Load the record collection stored under `namespace`. A namespace that
    /// was never written reads as an empty collection.
    ///
    /// # Errors
    /// Returns [`StoreError::Corrupt`] when a stored payload no longer decodes
    /// as a receipt array, and the underlying error for any SQLite failure.
    pub fn read_namespace(&self, namespace: &Namespace) -> Result<Vec<Receipt>, StoreError> {
        let payload = self
            .conn
            .prepare("SELECT payload FROM namespaces WHERE namespace = ?1")?
            .query_row(params![namespace.as_str()], |row| row.get::<_, String>(0))
            .optional()?;

        match payload {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
                namespace: namespace.to_string(),
                detail: err.to_string(),
            }),
        }
    }

    /// Replace the record collection stored under `namespace` in one atomic
    /// upsert. On a quota breach the previously stored payload is untouched.
    ///
    /// # Errors
    /// Returns [`StoreError::Capacity`] when the serialized payload exceeds
    /// the configured quota, and the underlying error for SQLite failures.
    pub fn write_namespace(
        &mut self,
        namespace: &Namespace,
        records: &[Receipt],
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(records)?;

        if let Some(quota_bytes) = self.quota_bytes {
            if payload.len() > quota_bytes {
                return Err(StoreError::Capacity {
                    namespace: namespace.to_string(),
                    payload_bytes: payload.len(),
                    quota_bytes,
                });
            }
        }

        self.conn.execute(
            "INSERT INTO namespaces(namespace, payload, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace) DO UPDATE SET
                payload = excluded.payload,
                updated_at_ms = excluded.updated_at_ms",
            params![namespace.as_str(), payload, receipt_ledger_core::now_millis()],
        )?;

        debug!(
            namespace = %namespace,
            records = records.len(),
            bytes = payload.len(),
            "replaced namespace payload"
        );
        Ok(())
    }

    /// Remove `namespace` and everything stored under it. Returns whether a
    /// stored payload existed.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_namespace(&mut self, namespace: &Namespace) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM namespaces WHERE namespace = ?1", params![namespace.as_str()])?;
        Ok(deleted > 0)
    }

    /// Every namespace currently holding a payload, in stable name order.
    ///
    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let mut stmt =
            self.conn.prepare("SELECT namespace FROM namespaces ORDER BY namespace ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut namespaces = Vec::new();
        for row in rows {
            namespaces.push(Namespace::named(&row?));
        }
        Ok(namespaces)
    }

    /// Walk every stored namespace and report its footprint. Undecodable
    /// payloads are flagged rather than failing the whole report.
    ///
    /// # Errors
    /// Returns an error only when the walk itself fails, never for corrupt
    /// payloads.
    pub fn usage(&self) -> Result<StorageUsage, StoreError> {
        let mut stmt =
            self.conn.prepare("SELECT namespace, payload FROM namespaces ORDER BY namespace ASC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut namespaces = Vec::new();
        let mut total_bytes = 0_usize;

        for row in rows {
            let (namespace, payload) = row?;
            let decoded = serde_json::from_str::<Vec<Receipt>>(&payload);
            total_bytes += payload.len();
            namespaces.push(NamespaceUsage {
                namespace,
                records: decoded.as_ref().map_or(0, Vec::len),
                payload_bytes: payload.len(),
                corrupt: decoded.is_err(),
            });
        }

        Ok(StorageUsage { namespaces, total_bytes, quota_bytes: self.quota_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use receipt_ledger_core::{Receipt, ReceiptId};

    fn open_memory_store() -> SqliteStore {
        match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("failed to open in-memory store: {err}"),
        }
    }

    fn receipt(id: &str, created_at: i64) -> Receipt {
        Receipt {
            id: ReceiptId::new(id.to_string()),
            created_at,
            transaction_date: "2026-08-01".to_string(),
            total_domestic_currency: 1200.0,
            ..Receipt::default()
        }
    }

    fn write_or_panic(store: &mut SqliteStore, namespace: &Namespace, records: &[Receipt]) {
        if let Err(err) = store.write_namespace(namespace, records) {
            panic!("write_namespace failed: {err}");
        }
    }

    fn read_or_panic(store: &SqliteStore, namespace: &Namespace) -> Vec<Receipt> {
        match store.read_namespace(namespace) {
            Ok(records) => records,
            Err(err) => panic!("read_namespace failed: {err}"),
        }
    }

    #[test]
    fn missing_namespace_reads_as_empty() {
        let store = open_memory_store();
        let records = read_or_panic(&store, &Namespace::anonymous());
        assert!(records.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut store = open_memory_store();
        let namespace = Namespace::anonymous();
        let records = vec![receipt("a", 10), receipt("b", 20)];

        write_or_panic(&mut store, &namespace, &records);
        assert_eq!(read_or_panic(&store, &namespace), records);
    }

    #[test]
    fn second_write_replaces_the_first() {
        let mut store = open_memory_store();
        let namespace = Namespace::anonymous();

        write_or_panic(&mut store, &namespace, &[receipt("a", 10), receipt("b", 20)]);
        write_or_panic(&mut store, &namespace, &[receipt("c", 30)]);

        let stored = read_or_panic(&store, &namespace);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id.as_str(), "c");
    }

    #[test]
    fn namespaces_are_isolated() {
        let mut store = open_memory_store();
        let anonymous = Namespace::anonymous();
        let cloud = Namespace::named("cloud:u1");

        write_or_panic(&mut store, &anonymous, &[receipt("a", 10)]);
        write_or_panic(&mut store, &cloud, &[receipt("b", 20)]);

        assert_eq!(read_or_panic(&store, &anonymous)[0].id.as_str(), "a");
        assert_eq!(read_or_panic(&store, &cloud)[0].id.as_str(), "b");
    }

    #[test]
    fn undecodable_payload_is_reported_as_corrupt() {
        let store = open_memory_store();
        let namespace = Namespace::anonymous();

        let planted = store.conn.execute(
            "INSERT INTO namespaces(namespace, payload, updated_at_ms) VALUES (?1, ?2, ?3)",
            params![namespace.as_str(), "definitely not json", 0_i64],
        );
        assert!(planted.is_ok());

        match store.read_namespace(&namespace) {
            Err(StoreError::Corrupt { namespace: reported, .. }) => {
                assert_eq!(reported, namespace.to_string());
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn quota_breach_leaves_stored_payload_untouched() {
        let mut store = open_memory_store().with_quota(4096);
        let namespace = Namespace::anonymous();
        let small = vec![receipt("a", 10)];

        write_or_panic(&mut store, &namespace, &small);

        let big: Vec<Receipt> = (0..200).map(|n| receipt(&format!("r{n}"), n)).collect();
        match store.write_namespace(&namespace, &big) {
            Err(StoreError::Capacity { payload_bytes, quota_bytes, .. }) => {
                assert!(payload_bytes > quota_bytes);
                assert_eq!(quota_bytes, 4096);
            }
            other => panic!("expected Capacity, got {other:?}"),
        }

        assert_eq!(read_or_panic(&store, &namespace), small);
    }

    #[test]
    fn delete_namespace_reports_whether_anything_existed() {
        let mut store = open_memory_store();
        let namespace = Namespace::anonymous();

        write_or_panic(&mut store, &namespace, &[receipt("a", 10)]);

        match store.delete_namespace(&namespace) {
            Ok(existed) => assert!(existed),
            Err(err) => panic!("delete_namespace failed: {err}"),
        }
        assert!(read_or_panic(&store, &namespace).is_empty());

        match store.delete_namespace(&namespace) {
            Ok(existed) => assert!(!existed),
            Err(err) => panic!("delete_namespace failed: {err}"),
        }
    }

    #[test]
    fn usage_flags_corrupt_namespaces_without_failing() {
        let mut store = open_memory_store().with_quota(1_000_000);
        let healthy = Namespace::anonymous();
        write_or_panic(&mut store, &healthy, &[receipt("a", 10), receipt("b", 20)]);

        let planted = store.conn.execute(
            "INSERT INTO namespaces(namespace, payload, updated_at_ms) VALUES (?1, ?2, ?3)",
            params!["receiptHistory", "{broken", 0_i64],
        );
        assert!(planted.is_ok());

        let usage = match store.usage() {
            Ok(usage) => usage,
            Err(err) => panic!("usage failed: {err}"),
        };

        assert_eq!(usage.quota_bytes, Some(1_000_000));
        assert_eq!(usage.namespaces.len(), 2);

        let by_name = |name: &str| {
            usage
                .namespaces
                .iter()
                .find(|entry| entry.namespace == name)
                .unwrap_or_else(|| panic!("missing usage entry for {name}"))
        };
        let broken = by_name("receiptHistory");
        assert!(broken.corrupt);
        assert_eq!(broken.records, 0);

        let ok = by_name(healthy.as_str());
        assert!(!ok.corrupt);
        assert_eq!(ok.records, 2);
        assert!(usage.total_bytes >= ok.payload_bytes);
    }

    #[test]
    fn namespaces_listing_is_name_ordered() {
        let mut store = open_memory_store();
        write_or_panic(&mut store, &Namespace::named("cloud:u1"), &[receipt("a", 10)]);
        write_or_panic(&mut store, &Namespace::anonymous(), &[receipt("b", 20)]);

        let listed = match store.namespaces() {
            Ok(listed) => listed,
            Err(err) => panic!("namespaces failed: {err}"),
        };
        let names: Vec<&str> = listed.iter().map(Namespace::as_str).collect();
        assert_eq!(names, vec!["cloud:u1", "receipts.local"]);
    }
}
