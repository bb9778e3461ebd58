//! Durable cache store: the single authoritative copy of every record.

use chrono::{DateTime, NaiveDate, Utc};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
  sweep_storage, CachePolicy, CacheRecord, Clock, Freshness, RawRecord, RecordStorage,
  SingleFlight, StoreKind, SweepReport,
};

pub struct DurableStore {
  storage: Arc<dyn RecordStorage>,
  policy: CachePolicy,
  clock: Arc<dyn Clock>,
  flight: SingleFlight,
}

impl DurableStore {
  pub fn new(storage: Arc<dyn RecordStorage>, policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
    Self {
      storage,
      policy,
      clock,
      flight: SingleFlight::new(),
    }
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn today(&self) -> NaiveDate {
    self.clock.today()
  }

  pub fn flight(&self) -> &SingleFlight {
    &self.flight
  }

  /// Write or overwrite a record; `created_at` is reset to now.
  pub fn put<T: Serialize>(
    &self,
    kind: StoreKind,
    key: &str,
    payload: &T,
    associated_date: Option<NaiveDate>,
  ) -> Result<()> {
    let now = self.clock.now();
    let record = RawRecord::encode(
      kind,
      key,
      payload,
      now,
      associated_date,
      self.policy.expires_at(kind, now),
    )?;
    self.storage.put(&record)?;
    debug!(%kind, key, "stored record");
    Ok(())
  }

  /// Readable record or `None`. Records that are past eviction are deleted
  /// by this read.
  pub fn get<T: DeserializeOwned>(&self, kind: StoreKind, key: &str) -> Result<Option<CacheRecord<T>>> {
    let (now, today) = (self.clock.now(), self.clock.today());
    let classify =
      |r: &RawRecord| self.policy.classify(r.kind, r.expires_at, r.associated_date, now, today);

    let record = self
      .storage
      .get_evicting(kind, key, &|r| classify(r) == Freshness::Evictable)?;

    match record {
      Some(r) if classify(&r) == Freshness::Fresh => {
        debug!(%kind, key, "cache hit");
        Ok(Some(r.decode()?))
      }
      _ => {
        debug!(%kind, key, "cache miss");
        Ok(None)
      }
    }
  }

  /// Read a record regardless of age, reporting how fresh it is. Never evicts.
  pub fn lookup<T: DeserializeOwned>(
    &self,
    kind: StoreKind,
    key: &str,
  ) -> Result<Option<(CacheRecord<T>, Freshness)>> {
    let (now, today) = (self.clock.now(), self.clock.today());
    match self.storage.get(kind, key)? {
      Some(r) => {
        let freshness = self
          .policy
          .classify(r.kind, r.expires_at, r.associated_date, now, today);
        Ok(Some((r.decode()?, freshness)))
      }
      None => Ok(None),
    }
  }

  /// Readable records of `kind` matching `predicate`, newest key first.
  pub fn range_query<T: DeserializeOwned>(
    &self,
    kind: StoreKind,
    predicate: impl Fn(&CacheRecord<T>) -> bool,
  ) -> Result<Vec<CacheRecord<T>>> {
    let (now, today) = (self.clock.now(), self.clock.today());
    let mut matches = Vec::new();

    for raw in self.storage.list(kind)? {
      if self
        .policy
        .classify(raw.kind, raw.expires_at, raw.associated_date, now, today)
        != Freshness::Fresh
      {
        continue;
      }
      let key = raw.key.clone();
      match raw.decode::<T>() {
        Ok(record) if predicate(&record) => matches.push(record),
        Ok(_) => {}
        Err(e) => warn!(%kind, key = %key, error = %e, "skipping undecodable record"),
      }
    }

    Ok(matches)
  }

  /// Readable record, or compute, store and return a fresh one.
  ///
  /// Concurrent callers for the same key wait on one computation. A failed
  /// store write is logged and the computed value is still returned.
  pub async fn get_or_compute<T, F, Fut>(
    &self,
    kind: StoreKind,
    key: &str,
    associated_date: Option<NaiveDate>,
    compute: F,
  ) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(hit) = self.get::<T>(kind, key)? {
      return Ok(hit.payload);
    }

    let _flight = self.flight.acquire(&format!("{}:{}", kind, key)).await;

    // Another caller may have filled it while we waited
    if let Some(hit) = self.get::<T>(kind, key)? {
      return Ok(hit.payload);
    }

    let value = compute().await?;
    if let Err(e) = self.put(kind, key, &value, associated_date) {
      warn!(%kind, key, error = %e, "cache write failed");
    }
    Ok(value)
  }

  pub fn invalidate(&self, kind: StoreKind, key: &str) -> Result<bool> {
    self.storage.delete(kind, key)
  }

  pub fn invalidate_kind(&self, kind: StoreKind) -> Result<usize> {
    let deleted = self.storage.delete_kind(kind)?;
    if deleted > 0 {
      debug!(%kind, deleted, "invalidated partition");
    }
    Ok(deleted)
  }

  /// Bulk eviction with the same predicate `get` uses.
  pub async fn sweep(&self) -> Result<SweepReport> {
    let report = sweep_storage(self.storage.as_ref(), &self.policy, self.clock.as_ref()).await?;
    info!(deleted = report.total(), "sweep finished");
    Ok(report)
  }

  pub fn counts(&self) -> Result<BTreeMap<StoreKind, usize>> {
    self.storage.count_by_kind()
  }

  pub fn size_bytes(&self) -> Result<u64> {
    self.storage.size_bytes()
  }
}
