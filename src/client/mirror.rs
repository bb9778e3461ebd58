//! Device-local mirror of server records, evaluated against the local clock.

use chrono::{Duration, NaiveDate};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
  sweep_storage, CachePolicy, CacheRecord, Clock, Freshness, NoopStorage, RawRecord,
  RecordStorage, SqliteStorage, StoreKind, SweepReport,
};
use crate::config::Config;

pub struct MirrorStore {
  storage: Arc<dyn RecordStorage>,
  policy: CachePolicy,
  clock: Arc<dyn Clock>,
}

impl MirrorStore {
  /// Wrap `storage` and purge whatever expired while the client was not running.
  pub async fn open(
    storage: Arc<dyn RecordStorage>,
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let mirror = Self {
      storage,
      policy,
      clock,
    };
    let report = mirror.sweep().await?;
    if report.total() > 0 {
      info!(deleted = report.total(), "startup sweep purged mirror records");
    }
    Ok(mirror)
  }

  /// Open the mirror described by `config`; a disabled mirror stores nothing.
  pub async fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
    let storage: Arc<dyn RecordStorage> = if config.client.mirror_enabled {
      Arc::new(SqliteStorage::open(&config.client.mirror_path()?)?)
    } else {
      Arc::new(NoopStorage)
    };
    let policy = CachePolicy::from(&config.cache).with_response_ttl(
      Duration::hours(config.client.static_asset_max_age_hours),
      Duration::days(config.client.response_keep_days),
    );
    Self::open(storage, policy, clock).await
  }

  pub fn today(&self) -> NaiveDate {
    self.clock.today()
  }

  pub fn retention_days(&self) -> u64 {
    self.policy.retention_days()
  }

  /// Date-window check on the local clock, no network involved.
  pub fn is_within_retention(&self, date: NaiveDate) -> bool {
    self.policy.is_within_retention(date, self.clock.today())
  }

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
    debug!(%kind, key, "mirrored record");
    Ok(())
  }

  /// Readable record or `None`, evicting on read like the server store.
  pub fn get<T: DeserializeOwned>(&self, kind: StoreKind, key: &str) -> Result<Option<CacheRecord<T>>> {
    let classify = |r: &RawRecord| self.classify(r);

    match self
      .storage
      .get_evicting(kind, key, &|r| classify(r) == Freshness::Evictable)?
    {
      Some(r) if classify(&r) == Freshness::Fresh => Ok(Some(r.decode()?)),
      _ => Ok(None),
    }
  }

  /// Any stored record, however old, with its freshness. Never evicts.
  pub fn lookup<T: DeserializeOwned>(
    &self,
    kind: StoreKind,
    key: &str,
  ) -> Result<Option<(CacheRecord<T>, Freshness)>> {
    match self.storage.get(kind, key)? {
      Some(r) => {
        let freshness = self.classify(&r);
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
    let mut matches = Vec::new();

    for raw in self.storage.list(kind)? {
      if self.classify(&raw) != Freshness::Fresh {
        continue;
      }
      let key = raw.key.clone();
      match raw.decode::<T>() {
        Ok(record) if predicate(&record) => matches.push(record),
        Ok(_) => {}
        Err(e) => warn!(%kind, key = %key, error = %e, "skipping undecodable mirror record"),
      }
    }

    Ok(matches)
  }

  pub fn invalidate(&self, kind: StoreKind, key: &str) -> Result<bool> {
    let deleted = self.storage.delete(kind, key)?;
    if deleted {
      debug!(%kind, key, "dropped mirrored record");
    }
    Ok(deleted)
  }

  pub fn invalidate_kind(&self, kind: StoreKind) -> Result<usize> {
    let deleted = self.storage.delete_kind(kind)?;
    if deleted > 0 {
      info!(%kind, deleted, "cleared mirror partition");
    }
    Ok(deleted)
  }

  /// Record count per store kind.
  pub fn stats(&self) -> Result<BTreeMap<StoreKind, usize>> {
    self.storage.count_by_kind()
  }

  pub async fn sweep(&self) -> Result<SweepReport> {
    sweep_storage(self.storage.as_ref(), &self.policy, self.clock.as_ref()).await
  }

  fn classify(&self, r: &RawRecord) -> Freshness {
    self.policy.classify(
      r.kind,
      r.expires_at,
      r.associated_date,
      self.clock.now(),
      self.clock.today(),
    )
  }
}
