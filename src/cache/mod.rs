//! Store-kind model and record storage shared by the server store and the client mirror.
//!
//! This module provides:
//! - The store-kind table (TTL per kind, retention window for date-partitioned kinds)
//! - One expiry predicate used by lazy eviction, bulk sweep and stale lookups
//! - SQLite-backed record storage with per-key atomic read-then-evict
//! - Per-key single-flight markers for coalescing concurrent misses

mod clock;
mod flight;
mod kind;
mod record;
mod storage;

#[cfg(test)]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use flight::SingleFlight;
pub use kind::{CachePolicy, Freshness, StoreKind};
pub use record::{CacheRecord, CacheResult, CacheSource, RawRecord};
pub use storage::{NoopStorage, RecordStorage, SqliteStorage};

use serde::Serialize;
use std::collections::BTreeMap;

/// Records deleted by one sweep, per store kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub deleted: BTreeMap<StoreKind, usize>,
}

impl SweepReport {
  pub fn total(&self) -> usize {
    self.deleted.values().sum()
  }

  fn record(&mut self, kind: StoreKind) {
    *self.deleted.entry(kind).or_default() += 1;
  }
}

/// Delete every evictable record, one record at a time.
///
/// Candidates are listed up front; each delete re-checks `created_at` so a
/// record rewritten since the listing is left alone. The task yields between
/// records and never holds the storage lock across more than one delete.
pub async fn sweep_storage(
  storage: &dyn RecordStorage,
  policy: &CachePolicy,
  clock: &dyn Clock,
) -> color_eyre::Result<SweepReport> {
  let (now, today) = (clock.now(), clock.today());
  let mut report = SweepReport {
    deleted: StoreKind::ALL.into_iter().map(|k| (k, 0)).collect(),
  };

  for meta in storage.list_meta()? {
    let freshness = policy.classify(meta.kind, meta.expires_at, meta.associated_date, now, today);
    if freshness == Freshness::Evictable
      && storage.delete_if_unchanged(meta.kind, &meta.key, meta.created_at)?
    {
      report.record(meta.kind);
    }
    tokio::task::yield_now().await;
  }

  Ok(report)
}
