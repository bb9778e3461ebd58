//! Market-cap snapshots: provider fallback in front of the durable store,
//! with grace fallback to an expired snapshot when every provider is down.

use chrono::NaiveDate;
use color_eyre::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::store::DurableStore;
use crate::cache::{CacheRecord, CacheResult, Freshness, StoreKind};
use crate::error::{FetchError, ReadError};
use crate::providers::FallbackFetcher;
use crate::types::{MarketCap, SelectionEntry, StockDetail};

/// Outcome of a batch prefetch over one date's selection results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
  pub date: NaiveDate,
  pub codes: usize,
  pub fetched: usize,
  /// Snapshots that were still fresh
  pub skipped: usize,
  pub failed: usize,
}

pub struct MarketCapService {
  store: Arc<DurableStore>,
  fetcher: FallbackFetcher<f64>,
}

impl MarketCapService {
  pub fn new(store: Arc<DurableStore>, fetcher: FallbackFetcher<f64>) -> Self {
    Self { store, fetcher }
  }

  /// Fresh snapshot from the store, else from the first working provider,
  /// else the expired snapshot flagged stale.
  ///
  /// Store failures are treated as misses; only a provider exhaustion with
  /// nothing to fall back on is an error.
  pub async fn get(&self, code: &str) -> Result<CacheResult<MarketCap>, ReadError> {
    if let Some(fresh) = self.fresh(code) {
      return Ok(fresh);
    }

    let _flight = self
      .store
      .flight()
      .acquire(&format!("{}:{}", StoreKind::MarketCap, code))
      .await;

    // Filled by a concurrent caller while we waited
    if let Some(fresh) = self.fresh(code) {
      return Ok(fresh);
    }

    match self.refresh(code).await {
      Ok(snapshot) => Ok(CacheResult::from_network(snapshot)),
      Err(e) => match self.lookup(code) {
        // Never re-stored: a stale value must not look fresh later
        Some((record, Freshness::Expired)) => {
          warn!(code, error = %e, "providers exhausted, serving expired snapshot");
          Ok(CacheResult::from_cache(record.payload, record.created_at, true))
        }
        _ => {
          warn!(code, error = %e, "providers exhausted, nothing cached");
          Err(e.into_read_error(format!("market-cap {}", code)))
        }
      },
    }
  }

  /// Fetch market caps for every stock selected on `date`.
  ///
  /// Codes with a fresh snapshot are skipped unless `force` is set. A code
  /// whose providers all fail is counted and the batch carries on.
  pub async fn prefetch_for(&self, date: NaiveDate, force: bool) -> Result<PrefetchReport> {
    let mut report = PrefetchReport {
      date,
      codes: 0,
      fetched: 0,
      skipped: 0,
      failed: 0,
    };

    let Some(record) = self
      .store
      .get::<Vec<SelectionEntry>>(StoreKind::Results, &date.to_string())?
    else {
      warn!(%date, "no selection results to prefetch market caps for");
      return Ok(report);
    };

    let codes: BTreeSet<String> = record
      .payload
      .into_iter()
      .flat_map(|entry| entry.stocks)
      .collect();
    report.codes = codes.len();
    info!(%date, codes = report.codes, "prefetching market caps");

    for code in &codes {
      if !force && self.fresh(code).is_some() {
        report.skipped += 1;
        continue;
      }

      let _flight = self
        .store
        .flight()
        .acquire(&format!("{}:{}", StoreKind::MarketCap, code))
        .await;
      match self.refresh(code).await {
        Ok(_) => report.fetched += 1,
        Err(e) => {
          warn!(code = %code, error = %e, "prefetch failed");
          report.failed += 1;
        }
      }
    }

    info!(
      %date,
      fetched = report.fetched,
      skipped = report.skipped,
      failed = report.failed,
      "market-cap prefetch finished"
    );
    Ok(report)
  }

  /// Cached snapshot without contacting providers. Expired snapshots inside
  /// the grace horizon are returned flagged stale.
  pub fn peek(&self, code: &str) -> Option<(MarketCap, bool)> {
    match self.lookup(code)? {
      (record, Freshness::Fresh) => Some((record.payload, false)),
      (record, Freshness::Expired) => Some((record.payload, true)),
      (_, Freshness::Evictable) => None,
    }
  }

  /// Attach cached market caps to each entry's `stocks_detail`.
  pub fn attach_details(&self, entries: &mut [SelectionEntry]) {
    for entry in entries {
      entry.stocks_detail = entry
        .stocks
        .iter()
        .map(|code| match self.peek(code) {
          Some((snapshot, stale)) => StockDetail {
            code: code.clone(),
            market_cap: Some(snapshot.market_cap),
            stale,
          },
          None => StockDetail {
            code: code.clone(),
            market_cap: None,
            stale: false,
          },
        })
        .collect();
    }
  }

  /// Fetch from the provider chain and store the snapshot.
  async fn refresh(&self, code: &str) -> Result<MarketCap, FetchError> {
    let fetched = self.fetcher.fetch(code).await?;
    let snapshot = MarketCap {
      code: code.to_string(),
      market_cap: fetched.value,
      provider: fetched.provider,
      fetched_at: self.store.now(),
    };
    if let Err(e) = self.store.put(StoreKind::MarketCap, code, &snapshot, None) {
      warn!(code, error = %e, "cache write failed");
    }
    Ok(snapshot)
  }

  fn fresh(&self, code: &str) -> Option<CacheResult<MarketCap>> {
    match self.store.get::<MarketCap>(StoreKind::MarketCap, code) {
      Ok(Some(record)) => {
        debug!(code, "market cap served from cache");
        Some(CacheResult::from_cache(record.payload, record.created_at, false))
      }
      Ok(None) => None,
      Err(e) => {
        warn!(code, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  fn lookup(&self, code: &str) -> Option<(CacheRecord<MarketCap>, Freshness)> {
    self
      .store
      .lookup::<MarketCap>(StoreKind::MarketCap, code)
      .unwrap_or_else(|e| {
        warn!(code, error = %e, "cache read failed, treating as miss");
        None
      })
  }
}
