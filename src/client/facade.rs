//! The single read entry point used by the UI.
//!
//! Precedence, in order:
//! 1. A results date outside the retention window is rejected locally
//! 2. Offline with a mirrored record: serve the mirror, no network
//! 3. Today's results already mirrored and non-empty: serve the mirror
//!    (when `prefer_mirror_for_today` is on)
//! 4. Network through the arbiter, refreshing the mirror on success; on
//!    failure (including an unreadable body) the mirror, else an empty
//!    outcome flagged `fetch_failed`
//!
//! A server answer of "no results for this date" is authoritative: the
//! mirrored copy for that date is dropped and the read comes back empty.
//! With no mirrored date index, the dates of mirrored results stand in for it.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::arbiter::{Arbitrated, RequestArbiter};
use super::connectivity::{Connectivity, ConnectivityState};
use super::mirror::MirrorStore;
use super::transport::HttpResponse;
use crate::cache::{CacheRecord, CacheResult, CacheSource, StoreKind};
use crate::error::ReadError;
use crate::server::{DATE_INDEX_KEY, STATISTICS_KEY};
use crate::types::{Envelope, SearchQuery};

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceRequest {
  Dates,
  Results(NaiveDate),
  Statistics,
  Search(SearchQuery),
}

impl ResourceRequest {
  pub fn kind(&self) -> StoreKind {
    match self {
      ResourceRequest::Dates => StoreKind::DateIndex,
      ResourceRequest::Results(_) => StoreKind::Results,
      ResourceRequest::Statistics => StoreKind::Statistics,
      ResourceRequest::Search(_) => StoreKind::Search,
    }
  }

  /// Mirror key, matching the server's key for the same record.
  pub fn key(&self) -> String {
    match self {
      ResourceRequest::Dates => DATE_INDEX_KEY.to_string(),
      ResourceRequest::Results(date) => date.to_string(),
      ResourceRequest::Statistics => STATISTICS_KEY.to_string(),
      ResourceRequest::Search(query) => query.cache_key(),
    }
  }

  pub fn date(&self) -> Option<NaiveDate> {
    match self {
      ResourceRequest::Results(date) => Some(*date),
      _ => None,
    }
  }

  /// Path relative to the API root.
  pub fn path(&self) -> String {
    match self {
      ResourceRequest::Dates => "dates".to_string(),
      ResourceRequest::Results(date) => format!("results/{}", date),
      ResourceRequest::Statistics => "statistics".to_string(),
      ResourceRequest::Search(query) => format!("search?{}", query.to_query_string()),
    }
  }
}

/// What a read produced. Absence of data is not an error.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
  Served(CacheResult<Value>),
  /// Nothing known; `fetch_failed` separates "could not fetch" from "no data exists"
  Empty { fetch_failed: bool },
}

impl ReadOutcome {
  /// Whether this outcome reflects a successful network answer.
  fn is_from_network(&self) -> bool {
    match self {
      ReadOutcome::Served(result) => result.source == CacheSource::Network,
      ReadOutcome::Empty { fetch_failed } => !fetch_failed,
    }
  }
}

pub struct ReadFacade {
  mirror: Arc<MirrorStore>,
  arbiter: Arc<RequestArbiter>,
  connectivity: Arc<ConnectivityState>,
  prefer_mirror_for_today: bool,
}

impl ReadFacade {
  pub fn new(
    mirror: Arc<MirrorStore>,
    arbiter: Arc<RequestArbiter>,
    prefer_mirror_for_today: bool,
  ) -> Self {
    let connectivity = Arc::clone(arbiter.connectivity());
    Self {
      mirror,
      arbiter,
      connectivity,
      prefer_mirror_for_today,
    }
  }

  #[cfg(test)]
  pub fn mirror(&self) -> &Arc<MirrorStore> {
    &self.mirror
  }

  pub fn arbiter(&self) -> &Arc<RequestArbiter> {
    &self.arbiter
  }

  pub async fn read(&self, request: &ResourceRequest) -> Result<ReadOutcome, ReadError> {
    let kind = request.kind();
    let key = request.key();

    if let Some(date) = request.date() {
      if !self.mirror.is_within_retention(date) {
        return Err(ReadError::OutOfRange {
          date,
          retention_days: self.mirror.retention_days(),
        });
      }
    }

    if !self.connectivity.is_online() {
      if let Some((payload, cached_at)) = self.mirrored(kind, &key) {
        debug!(%kind, key = %key, "offline, serving mirror");
        return Ok(ReadOutcome::Served(CacheResult::offline(payload, cached_at)));
      }
    }

    if self.prefer_mirror_for_today && request.date() == Some(self.mirror.today()) {
      if let Some(record) = self.mirror_get(kind, &key) {
        if !is_empty(&record.payload) {
          debug!(%kind, key = %key, "serving today's mirrored results");
          return Ok(ReadOutcome::Served(CacheResult::from_cache(
            record.payload,
            record.created_at,
            false,
          )));
        }
      }
    }

    match self.arbiter.fetch(&request.path()).await {
      Arbitrated::Network(response) => self.from_network(request, response),
      Arbitrated::Cached {
        response,
        fetched_at,
        fallback,
      } => match parse_envelope(&response) {
        Ok(Ok(data)) => Ok(ReadOutcome::Served(if fallback {
          self.stale(data, fetched_at)
        } else {
          CacheResult::from_cache(data, fetched_at, false)
        })),
        Ok(Err(message)) => self.or_fallback(kind, &key, ReadError::Server(message)),
        Err(e) => self.or_fallback(kind, &key, e),
      },
      Arbitrated::ServiceUnavailable | Arbitrated::Failed { .. } => Ok(self.fallback(kind, &key)),
    }
  }

  /// Re-fetch the date index and the most recent result set from the
  /// network, refreshing the mirror. Returns the paths that were refreshed.
  pub async fn refresh_latest(&self) -> Vec<String> {
    let mut refreshed = Vec::new();

    let dates = ResourceRequest::Dates;
    let latest = match self.refresh(&dates).await {
      Some(ReadOutcome::Served(result)) if result.source == CacheSource::Network => {
        refreshed.push(dates.path());
        serde_json::from_value::<Vec<NaiveDate>>(result.data)
          .ok()
          .and_then(|dates| dates.into_iter().next())
      }
      _ => return refreshed,
    };

    if let Some(date) = latest {
      let results = ResourceRequest::Results(date);
      if self.refresh(&results).await.is_some() {
        refreshed.push(results.path());
      }
    }

    refreshed
  }

  /// Refresh in the background on every offline to online transition.
  pub fn spawn_reconnect_refresh(self: &Arc<Self>) -> JoinHandle<()> {
    let facade = Arc::clone(self);
    let mut rx = self.connectivity.subscribe();
    let mut previous = *rx.borrow_and_update();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let current = *rx.borrow_and_update();
        if previous == Connectivity::Offline && current == Connectivity::Online {
          let refreshed = facade.refresh_latest().await;
          info!(?refreshed, "reconnect refresh");
        }
        previous = current;
      }
    })
  }

  /// Network read that skips the mirror-first rules. `None` unless the
  /// server answered.
  async fn refresh(&self, request: &ResourceRequest) -> Option<ReadOutcome> {
    match self.arbiter.fetch(&request.path()).await {
      Arbitrated::Network(response) => self
        .from_network(request, response)
        .ok()
        .filter(ReadOutcome::is_from_network),
      _ => None,
    }
  }

  fn from_network(
    &self,
    request: &ResourceRequest,
    response: HttpResponse,
  ) -> Result<ReadOutcome, ReadError> {
    let kind = request.kind();
    let key = request.key();

    match parse_envelope(&response) {
      Ok(Ok(data)) if is_empty(&data) && kind == StoreKind::Results => {
        if let Err(e) = self.mirror.invalidate(kind, &key) {
          warn!(%kind, key = %key, error = %e, "failed to drop mirrored results");
        }
        Ok(ReadOutcome::Empty {
          fetch_failed: false,
        })
      }
      Ok(Ok(data)) => {
        if let Err(e) = self.mirror.put(kind, &key, &data, request.date()) {
          warn!(%kind, key = %key, error = %e, "mirror write failed");
        }
        Ok(ReadOutcome::Served(CacheResult::from_network(data)))
      }
      Ok(Err(message)) => self.or_fallback(kind, &key, ReadError::Server(message)),
      Err(e) => self.or_fallback(kind, &key, e),
    }
  }

  /// Mirror copy flagged stale, else `err`.
  fn or_fallback(
    &self,
    kind: StoreKind,
    key: &str,
    err: ReadError,
  ) -> Result<ReadOutcome, ReadError> {
    match self.fallback(kind, key) {
      ReadOutcome::Empty { .. } => Err(err),
      served => {
        debug!(%kind, key, error = %err, "unusable response, serving mirror");
        Ok(served)
      }
    }
  }

  /// Mirror copy flagged stale, else an empty outcome.
  fn fallback(&self, kind: StoreKind, key: &str) -> ReadOutcome {
    match self.mirrored(kind, key) {
      Some((payload, cached_at)) => {
        debug!(%kind, key, "serving mirror after failed fetch");
        ReadOutcome::Served(self.stale(payload, cached_at))
      }
      None => ReadOutcome::Empty { fetch_failed: true },
    }
  }

  fn stale(&self, data: Value, cached_at: DateTime<Utc>) -> CacheResult<Value> {
    if self.connectivity.is_online() {
      CacheResult::from_cache(data, cached_at, true)
    } else {
      CacheResult::offline(data, cached_at)
    }
  }

  /// Any usable mirrored payload for `(kind, key)`, however old.
  fn mirrored(&self, kind: StoreKind, key: &str) -> Option<(Value, DateTime<Utc>)> {
    let found = self.mirror.lookup::<Value>(kind, key).unwrap_or_else(|e| {
      warn!(%kind, key, error = %e, "mirror read failed, treating as miss");
      None
    });
    match found {
      Some((record, _)) => Some((record.payload, record.created_at)),
      None if kind == StoreKind::DateIndex => self.mirrored_dates(),
      None => None,
    }
  }

  /// Dates of mirrored results, newest first, dated by the newest record.
  fn mirrored_dates(&self) -> Option<(Value, DateTime<Utc>)> {
    let records = self
      .mirror
      .range_query::<Value>(StoreKind::Results, |r| !is_empty(&r.payload))
      .unwrap_or_else(|e| {
        warn!(error = %e, "mirror listing failed");
        Vec::new()
      });
    let cached_at = records.iter().map(|r| r.created_at).max()?;
    let dates: Vec<String> = records.into_iter().map(|r| r.key).collect();
    Some((Value::from(dates), cached_at))
  }

  fn mirror_get(&self, kind: StoreKind, key: &str) -> Option<CacheRecord<Value>> {
    self.mirror.get(kind, key).unwrap_or_else(|e| {
      warn!(%kind, key, error = %e, "mirror read failed, treating as miss");
      None
    })
  }
}

/// `Ok(data)` for an ok envelope, `Err(message)` for an error envelope.
fn parse_envelope(response: &HttpResponse) -> Result<Result<Value, String>, ReadError> {
  match serde_json::from_slice::<Envelope<Value>>(&response.body) {
    Ok(Envelope::Ok { data }) => Ok(Ok(data)),
    Ok(Envelope::Error { message }) => Ok(Err(message)),
    Err(e) => Err(ReadError::Malformed(format!(
      "status {}: {}",
      response.status, e
    ))),
  }
}

fn is_empty(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::Array(items) => items.is_empty(),
    Value::Object(fields) => fields.is_empty(),
    _ => false,
  }
}
