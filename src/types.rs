//! Wire types shared by the server API and the client.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::cache::StoreKind;

/// Response envelope: `{status: "ok", data}` or `{status: "error", message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope<T> {
  Ok { data: T },
  Error { message: String },
}

impl<T> Envelope<T> {
  pub fn ok(data: T) -> Self {
    Envelope::Ok { data }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Envelope::Error {
      message: message.into(),
    }
  }
}

/// One selector's picks for one trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionEntry {
  pub selector_name: String,
  pub stocks: Vec<String>,
  #[serde(default)]
  pub stock_count: usize,
  #[serde(default)]
  pub execution_time: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub selector_config: Option<serde_json::Value>,
  /// Cached market data for each pick, attached when serving
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub stocks_detail: Vec<StockDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockDetail {
  pub code: String,
  pub market_cap: Option<f64>,
  #[serde(default)]
  pub stale: bool,
}

/// Market capitalisation snapshot for one stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketCap {
  pub code: String,
  pub market_cap: f64,
  pub provider: String,
  pub fetched_at: DateTime<Utc>,
}

/// GET /market-cap/{code} payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketCapView {
  #[serde(flatten)]
  pub snapshot: MarketCap,
  pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSelection {
  pub date: NaiveDate,
  pub selector_name: String,
  pub total_stocks: usize,
}

/// Search hits for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
  pub stock_code: String,
  pub selections: Vec<SearchSelection>,
  pub selection_count: usize,
}

/// Default look-back for ticker search.
pub const DEFAULT_SEARCH_DAYS: u32 = 7;

/// Normalized `(tickers, windowDays)` search key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
  /// Valid 6-digit codes, sorted and deduplicated
  pub tickers: Vec<String>,
  pub days: u32,
}

impl SearchQuery {
  /// Parse a comma list of codes. Anything that is not a 6-digit code is
  /// dropped; returns `None` if nothing valid remains.
  pub fn parse(stocks: &str, days: Option<u32>) -> Option<Self> {
    let tickers: BTreeSet<String> = stocks
      .split(',')
      .map(str::trim)
      .filter(|code| is_stock_code(code))
      .map(String::from)
      .collect();

    if tickers.is_empty() {
      return None;
    }

    Some(Self {
      tickers: tickers.into_iter().collect(),
      days: days.unwrap_or(DEFAULT_SEARCH_DAYS),
    })
  }

  /// Stable, fixed-length key for the search partition.
  pub fn cache_key(&self) -> String {
    let input = format!("search:{}:{}", self.tickers.join(","), self.days);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Query-string form understood by GET /search.
  pub fn to_query_string(&self) -> String {
    format!("stocks={}&days={}", self.tickers.join(","), self.days)
  }
}

pub fn is_stock_code(code: &str) -> bool {
  code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorPerformance {
  pub selector_name: String,
  pub execution_count: usize,
  pub avg_stocks: f64,
  pub max_stocks: usize,
  pub last_execution: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
  pub date: NaiveDate,
  pub selector_count: usize,
  pub total_stocks: usize,
  pub avg_execution_time: f64,
}

/// Aggregate counts and sizes served by GET /statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
  pub records_by_kind: BTreeMap<StoreKind, usize>,
  pub total_records: usize,
  pub unique_dates: usize,
  pub unique_selectors: usize,
  pub earliest_date: Option<NaiveDate>,
  pub latest_date: Option<NaiveDate>,
  pub database_size_mb: f64,
  pub max_retention_days: u64,
  pub selector_performance: Vec<SelectorPerformance>,
  pub execution_summary: Vec<DailySummary>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn envelope_shape() {
    let ok = serde_json::to_value(Envelope::ok(vec!["2024-01-15"])).unwrap();
    assert_eq!(ok, serde_json::json!({"status": "ok", "data": ["2024-01-15"]}));

    let err = serde_json::to_value(Envelope::<()>::error("boom")).unwrap();
    assert_eq!(err, serde_json::json!({"status": "error", "message": "boom"}));
  }

  #[test]
  fn search_query_normalizes_codes() {
    let q = SearchQuery::parse(" 600000, 000001,abc,600000,12345 ", None).unwrap();
    assert_eq!(q.tickers, vec!["000001", "600000"]);
    assert_eq!(q.days, DEFAULT_SEARCH_DAYS);
    assert_eq!(q.to_query_string(), "stocks=000001,600000&days=7");
    assert!(SearchQuery::parse("abc, 1234567", Some(3)).is_none());
  }

  #[test]
  fn search_key_depends_on_days() {
    let a = SearchQuery::parse("600000", Some(7)).unwrap();
    let b = SearchQuery::parse("600000", Some(8)).unwrap();
    assert_ne!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key().len(), 64);
  }

  proptest::proptest! {
    #[test]
    fn search_key_ignores_order_and_duplicates(
      codes in proptest::collection::vec("[0-9]{6}", 1..6),
      days in 1u32..60,
    ) {
      let forward = codes.join(",");
      let mut reversed = codes.clone();
      reversed.reverse();
      reversed.push(codes[0].clone());
      let backward = reversed.join(" , ");

      let a = SearchQuery::parse(&forward, Some(days)).unwrap();
      let b = SearchQuery::parse(&backward, Some(days)).unwrap();
      proptest::prop_assert_eq!(a.cache_key(), b.cache_key());
    }
  }

  #[test]
  fn entry_defaults_missing_fields() {
    let entry: SelectionEntry =
      serde_json::from_str(r#"{"selector_name": "breakout", "stocks": ["600000"]}"#).unwrap();
    assert_eq!(entry.stock_count, 0);
    assert!(entry.stocks_detail.is_empty());
  }
}
