//! Cache records and the result wrapper that tells callers where data came from.

use chrono::{DateTime, NaiveDate, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::kind::StoreKind;

/// One stored entry. Owned by exactly one store; copies are made by
/// serialising, never by sharing.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord<T> {
  pub key: String,
  pub kind: StoreKind,
  pub payload: T,
  pub created_at: DateTime<Utc>,
  pub associated_date: Option<NaiveDate>,
  pub expires_at: DateTime<Utc>,
}

/// A record as it sits in storage: JSON bytes.
pub type RawRecord = CacheRecord<Vec<u8>>;

impl RawRecord {
  /// Build a raw record by serialising `payload`.
  pub fn encode<T: Serialize>(
    kind: StoreKind,
    key: &str,
    payload: &T,
    created_at: DateTime<Utc>,
    associated_date: Option<NaiveDate>,
    expires_at: DateTime<Utc>,
  ) -> Result<Self> {
    let payload =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize {} record: {}", kind, e))?;
    Ok(Self {
      key: key.to_string(),
      kind,
      payload,
      created_at,
      associated_date,
      expires_at,
    })
  }

  pub fn decode<T: DeserializeOwned>(self) -> Result<CacheRecord<T>> {
    let payload = serde_json::from_slice(&self.payload)
      .map_err(|e| eyre!("Failed to deserialize {} record {}: {}", self.kind, self.key, e))?;
    Ok(CacheRecord {
      key: self.key,
      kind: self.kind,
      payload,
      created_at: self.created_at,
      associated_date: self.associated_date,
      expires_at: self.expires_at,
    })
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, Serialize)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network or provider data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Served from a fallback path; the UI must mark it.
  pub fn is_stale(&self) -> bool {
    matches!(self.source, CacheSource::CacheStale | CacheSource::Offline)
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
  /// Fresh data from network or an upstream provider
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its TTL, served because nothing fresher could be fetched
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
