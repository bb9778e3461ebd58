//! Record storage trait and SQLite implementation.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::kind::StoreKind;
use super::record::RawRecord;

/// Identity and timing of a stored record, without its payload.
#[derive(Debug, Clone)]
pub struct RecordMeta {
  pub kind: StoreKind,
  pub key: String,
  pub created_at: DateTime<Utc>,
  pub associated_date: Option<NaiveDate>,
  pub expires_at: DateTime<Utc>,
}

/// Trait for record storage backends.
///
/// Every method is atomic with respect to a single `(kind, key)` pair; no
/// method spans more than one key except the listing helpers.
pub trait RecordStorage: Send + Sync {
  /// Insert or overwrite a record.
  fn put(&self, record: &RawRecord) -> Result<()>;

  /// Read a record without touching it.
  fn get(&self, kind: StoreKind, key: &str) -> Result<Option<RawRecord>>;

  /// Read a record and, when `should_evict` says so, delete it in the same step.
  /// Returns `None` if the record was absent or evicted.
  fn get_evicting(
    &self,
    kind: StoreKind,
    key: &str,
    should_evict: &dyn Fn(&RawRecord) -> bool,
  ) -> Result<Option<RawRecord>>;

  /// Delete a record unconditionally.
  fn delete(&self, kind: StoreKind, key: &str) -> Result<bool>;

  /// Delete a record only if it has not been rewritten since `created_at`.
  fn delete_if_unchanged(&self, kind: StoreKind, key: &str, created_at: DateTime<Utc>)
    -> Result<bool>;

  /// Delete every record of a kind.
  fn delete_kind(&self, kind: StoreKind) -> Result<usize>;

  /// All records of a kind.
  fn list(&self, kind: StoreKind) -> Result<Vec<RawRecord>>;

  /// Metadata of every record, for sweeps.
  fn list_meta(&self) -> Result<Vec<RecordMeta>>;

  /// Record count per kind (kinds without records are reported as zero).
  fn count_by_kind(&self) -> Result<BTreeMap<StoreKind, usize>>;

  /// Approximate on-disk size.
  fn size_bytes(&self) -> Result<u64>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the client mirror is disabled - all operations are no-ops.
pub struct NoopStorage;

impl RecordStorage for NoopStorage {
  fn put(&self, _record: &RawRecord) -> Result<()> {
    Ok(()) // Discard
  }

  fn get(&self, _kind: StoreKind, _key: &str) -> Result<Option<RawRecord>> {
    Ok(None) // Always miss
  }

  fn get_evicting(
    &self,
    _kind: StoreKind,
    _key: &str,
    _should_evict: &dyn Fn(&RawRecord) -> bool,
  ) -> Result<Option<RawRecord>> {
    Ok(None)
  }

  fn delete(&self, _kind: StoreKind, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn delete_if_unchanged(
    &self,
    _kind: StoreKind,
    _key: &str,
    _created_at: DateTime<Utc>,
  ) -> Result<bool> {
    Ok(false)
  }

  fn delete_kind(&self, _kind: StoreKind) -> Result<usize> {
    Ok(0)
  }

  fn list(&self, _kind: StoreKind) -> Result<Vec<RawRecord>> {
    Ok(Vec::new())
  }

  fn list_meta(&self) -> Result<Vec<RecordMeta>> {
    Ok(Vec::new())
  }

  fn count_by_kind(&self) -> Result<BTreeMap<StoreKind, usize>> {
    Ok(StoreKind::ALL.into_iter().map(|k| (k, 0)).collect())
  }

  fn size_bytes(&self) -> Result<u64> {
    Ok(0)
  }
}

/// SQLite-based record storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) a database file, creating parent directories as needed.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per (store kind, key); payload is serialized JSON
CREATE TABLE IF NOT EXISTS cache_records (
    store_kind TEXT NOT NULL,
    record_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    associated_date TEXT,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (store_kind, record_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_records_expiry
    ON cache_records(expires_at);

CREATE INDEX IF NOT EXISTS idx_cache_records_date
    ON cache_records(store_kind, associated_date);
"#;

const RECORD_COLUMNS: &str =
  "store_kind, record_key, payload, created_at, associated_date, expires_at";

impl RecordStorage for SqliteStorage {
  fn put(&self, record: &RawRecord) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_records (store_kind, record_key, payload, created_at, associated_date, expires_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          record.kind.as_str(),
          record.key,
          record.payload,
          record.created_at.timestamp_millis(),
          record.associated_date.map(|d| d.to_string()),
          record.expires_at.timestamp_millis(),
        ],
      )
      .map_err(|e| eyre!("Failed to store {} record {}: {}", record.kind, record.key, e))?;

    Ok(())
  }

  fn get(&self, kind: StoreKind, key: &str) -> Result<Option<RawRecord>> {
    let conn = self.lock()?;
    select_one(&conn, kind, key)
  }

  fn get_evicting(
    &self,
    kind: StoreKind,
    key: &str,
    should_evict: &dyn Fn(&RawRecord) -> bool,
  ) -> Result<Option<RawRecord>> {
    let conn = self.lock()?;

    let Some(record) = select_one(&conn, kind, key)? else {
      return Ok(None);
    };

    if !should_evict(&record) {
      return Ok(Some(record));
    }

    conn
      .execute(
        "DELETE FROM cache_records WHERE store_kind = ? AND record_key = ? AND created_at = ?",
        params![kind.as_str(), key, record.created_at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to evict {} record {}: {}", kind, key, e))?;

    Ok(None)
  }

  fn delete(&self, kind: StoreKind, key: &str) -> Result<bool> {
    let conn = self.lock()?;

    let deleted = conn
      .execute(
        "DELETE FROM cache_records WHERE store_kind = ? AND record_key = ?",
        params![kind.as_str(), key],
      )
      .map_err(|e| eyre!("Failed to delete {} record {}: {}", kind, key, e))?;

    Ok(deleted > 0)
  }

  fn delete_if_unchanged(
    &self,
    kind: StoreKind,
    key: &str,
    created_at: DateTime<Utc>,
  ) -> Result<bool> {
    let conn = self.lock()?;

    let deleted = conn
      .execute(
        "DELETE FROM cache_records WHERE store_kind = ? AND record_key = ? AND created_at = ?",
        params![kind.as_str(), key, created_at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to delete {} record {}: {}", kind, key, e))?;

    Ok(deleted > 0)
  }

  fn delete_kind(&self, kind: StoreKind) -> Result<usize> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM cache_records WHERE store_kind = ?",
        params![kind.as_str()],
      )
      .map_err(|e| eyre!("Failed to clear {} records: {}", kind, e))
  }

  fn list(&self, kind: StoreKind) -> Result<Vec<RawRecord>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM cache_records WHERE store_kind = ? ORDER BY record_key DESC",
        RECORD_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare listing query: {}", e))?;

    let records = stmt
      .query_map(params![kind.as_str()], read_record)
      .map_err(|e| eyre!("Failed to list {} records: {}", kind, e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(records)
  }

  fn list_meta(&self) -> Result<Vec<RecordMeta>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT store_kind, record_key, created_at, associated_date, expires_at FROM cache_records",
      )
      .map_err(|e| eyre!("Failed to prepare metadata query: {}", e))?;

    let metas = stmt
      .query_map([], |row| {
        Ok(RecordMeta {
          kind: read_kind(row, 0)?,
          key: row.get(1)?,
          created_at: read_millis(row, 2)?,
          associated_date: read_date(row, 3)?,
          expires_at: read_millis(row, 4)?,
        })
      })
      .map_err(|e| eyre!("Failed to list record metadata: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(metas)
  }

  fn count_by_kind(&self) -> Result<BTreeMap<StoreKind, usize>> {
    let conn = self.lock()?;

    let mut counts: BTreeMap<StoreKind, usize> =
      StoreKind::ALL.into_iter().map(|k| (k, 0)).collect();

    let mut stmt = conn
      .prepare("SELECT store_kind, COUNT(*) FROM cache_records GROUP BY store_kind")
      .map_err(|e| eyre!("Failed to prepare count query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((read_kind(row, 0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to count records: {}", e))?;

    for (kind, count) in rows.filter_map(|r| r.ok()) {
      counts.insert(kind, count as usize);
    }

    Ok(counts)
  }

  fn size_bytes(&self) -> Result<u64> {
    let conn = self.lock()?;

    let page_count: i64 = conn
      .query_row("PRAGMA page_count", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read page count: {}", e))?;
    let page_size: i64 = conn
      .query_row("PRAGMA page_size", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read page size: {}", e))?;

    Ok((page_count * page_size).max(0) as u64)
  }
}

fn select_one(conn: &Connection, kind: StoreKind, key: &str) -> Result<Option<RawRecord>> {
  conn
    .query_row(
      &format!(
        "SELECT {} FROM cache_records WHERE store_kind = ? AND record_key = ?",
        RECORD_COLUMNS
      ),
      params![kind.as_str(), key],
      read_record,
    )
    .optional()
    .map_err(|e| eyre!("Failed to read {} record {}: {}", kind, key, e))
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
  Ok(RawRecord {
    kind: read_kind(row, 0)?,
    key: row.get(1)?,
    payload: row.get(2)?,
    created_at: read_millis(row, 3)?,
    associated_date: read_date(row, 4)?,
    expires_at: read_millis(row, 5)?,
  })
}

fn read_kind(row: &Row<'_>, idx: usize) -> rusqlite::Result<StoreKind> {
  let s: String = row.get(idx)?;
  StoreKind::parse(&s).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      idx,
      rusqlite::types::Type::Text,
      format!("unknown store kind '{}'", s).into(),
    )
  })
}

fn read_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
  let millis: i64 = row.get(idx)?;
  Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      idx,
      rusqlite::types::Type::Integer,
      format!("invalid timestamp {}", millis).into(),
    )
  })
}

fn read_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
  let s: Option<String> = row.get(idx)?;
  s.map(|s| {
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| {
      rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
  })
  .transpose()
}
