//! Store kinds and the TTL/retention policy shared by every store.

use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;

/// A named partition of the cache with its own TTL and validity rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
  Results,
  MarketCap,
  Statistics,
  Search,
  DateIndex,
  /// Raw HTTP responses kept by the client's request arbiter, keyed by path
  Response,
}

impl StoreKind {
  pub const ALL: [StoreKind; 6] = [
    StoreKind::Results,
    StoreKind::MarketCap,
    StoreKind::Statistics,
    StoreKind::Search,
    StoreKind::DateIndex,
    StoreKind::Response,
  ];

  /// Name used as the partition column in SQLite.
  pub fn as_str(&self) -> &'static str {
    match self {
      StoreKind::Results => "results",
      StoreKind::MarketCap => "market-cap",
      StoreKind::Statistics => "statistics",
      StoreKind::Search => "search",
      StoreKind::DateIndex => "date-index",
      StoreKind::Response => "response",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|k| k.as_str() == s)
  }

  /// Records of this kind carry an associated date that must stay inside the
  /// retention window.
  pub fn is_date_partitioned(&self) -> bool {
    matches!(self, StoreKind::Results)
  }
}

impl std::fmt::Display for StoreKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How a stored record relates to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Readable: not expired and inside the retention window.
  Fresh,
  /// Past its TTL but still inside the grace horizon. Not readable through
  /// `get`, but kept so a grace fallback can serve it.
  Expired,
  /// Must be deleted by lazy eviction or sweep.
  Evictable,
}

/// TTL table plus retention window, evaluated against a caller-supplied clock.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
  retention_days: u64,
  results_ttl: Duration,
  market_cap_ttl: Duration,
  market_cap_grace: Duration,
  statistics_ttl: Duration,
  search_ttl: Duration,
  date_index_ttl: Duration,
  response_ttl: Duration,
  response_grace: Duration,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self::from(&CacheConfig::default())
  }
}

impl From<&CacheConfig> for CachePolicy {
  fn from(config: &CacheConfig) -> Self {
    Self {
      retention_days: config.retention_days,
      results_ttl: Duration::days(config.results_ttl_days),
      market_cap_ttl: Duration::days(config.market_cap_ttl_days),
      market_cap_grace: Duration::days(config.market_cap_grace_days),
      statistics_ttl: Duration::minutes(config.statistics_ttl_minutes),
      search_ttl: Duration::minutes(config.search_ttl_minutes),
      date_index_ttl: Duration::minutes(config.date_index_ttl_minutes),
      response_ttl: Duration::hours(24),
      response_grace: Duration::days(30),
    }
  }
}

impl CachePolicy {
  /// Override how long arbiter responses stay fresh and how long past that
  /// they are kept as a fallback.
  pub fn with_response_ttl(mut self, ttl: Duration, grace: Duration) -> Self {
    self.response_ttl = ttl;
    self.response_grace = grace;
    self
  }

  pub fn ttl(&self, kind: StoreKind) -> Duration {
    match kind {
      StoreKind::Results => self.results_ttl,
      StoreKind::MarketCap => self.market_cap_ttl,
      StoreKind::Statistics => self.statistics_ttl,
      StoreKind::Search => self.search_ttl,
      StoreKind::DateIndex => self.date_index_ttl,
      StoreKind::Response => self.response_ttl,
    }
  }

  /// Extra time an expired record is kept around for grace fallback.
  pub fn grace(&self, kind: StoreKind) -> Duration {
    match kind {
      StoreKind::MarketCap => self.market_cap_grace,
      StoreKind::Response => self.response_grace,
      _ => Duration::zero(),
    }
  }

  pub fn retention_days(&self) -> u64 {
    self.retention_days
  }

  pub fn expires_at(&self, kind: StoreKind, created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + self.ttl(kind)
  }

  /// Oldest date still inside the retention window.
  pub fn retention_cutoff(&self, today: NaiveDate) -> NaiveDate {
    today
      .checked_sub_days(Days::new(self.retention_days))
      .unwrap_or(NaiveDate::MIN)
  }

  /// Whether `date` falls within the last `retention_days` calendar days.
  pub fn is_within_retention(&self, date: NaiveDate, today: NaiveDate) -> bool {
    date >= self.retention_cutoff(today) && date <= today
  }

  /// The single expiry predicate used by lazy eviction, sweep and lookups.
  ///
  /// `now` is compared with `expires_at`; `today` is the local calendar date
  /// the retention window is anchored on.
  pub fn classify(
    &self,
    kind: StoreKind,
    expires_at: DateTime<Utc>,
    associated_date: Option<NaiveDate>,
    now: DateTime<Utc>,
    today: NaiveDate,
  ) -> Freshness {
    if kind.is_date_partitioned() {
      let cutoff = self.retention_cutoff(today);
      if associated_date.map_or(false, |d| d < cutoff) {
        return Freshness::Evictable;
      }
    }

    if now <= expires_at {
      Freshness::Fresh
    } else if now > expires_at + self.grace(kind) {
      Freshness::Evictable
    } else {
      Freshness::Expired
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
  }

  #[test]
  fn ttl_table_matches_defaults() {
    let policy = CachePolicy::default();
    assert_eq!(policy.ttl(StoreKind::Results), Duration::days(30));
    assert_eq!(policy.ttl(StoreKind::MarketCap), Duration::days(7));
    assert_eq!(policy.ttl(StoreKind::Statistics), Duration::minutes(10));
    assert_eq!(policy.ttl(StoreKind::Search), Duration::minutes(5));
    assert_eq!(policy.grace(StoreKind::Statistics), Duration::zero());

    let tuned = policy.with_response_ttl(Duration::hours(2), Duration::days(3));
    assert_eq!(tuned.ttl(StoreKind::Response), Duration::hours(2));
    assert_eq!(tuned.grace(StoreKind::Response), Duration::days(3));
  }

  #[test]
  fn kind_names_round_trip() {
    for kind in StoreKind::ALL {
      assert_eq!(StoreKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(StoreKind::parse("nope"), None);
  }

  #[test]
  fn retention_window_edges() {
    let policy = CachePolicy::default();
    let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
    let cutoff = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

    assert_eq!(policy.retention_cutoff(today), cutoff);
    assert!(policy.is_within_retention(cutoff, today));
    assert!(policy.is_within_retention(today, today));
    assert!(!policy.is_within_retention(cutoff.pred_opt().unwrap(), today));
    assert!(!policy.is_within_retention(today.succ_opt().unwrap(), today));
  }

  #[test]
  fn expired_boundary_is_exclusive() {
    let policy = CachePolicy::default();
    let now = at(2024, 3, 31);

    let today = now.date_naive();
    let classify =
      |expires_at| policy.classify(StoreKind::Statistics, expires_at, None, now, today);
    assert_eq!(classify(now - Duration::seconds(1)), Freshness::Evictable);
    assert_eq!(classify(now), Freshness::Fresh);
    assert_eq!(classify(now + Duration::seconds(1)), Freshness::Fresh);
  }

  #[test]
  fn out_of_window_results_are_evictable_before_ttl() {
    let policy = CachePolicy::default();
    let now = at(2024, 3, 31);
    let old = NaiveDate::from_ymd_opt(2024, 2, 20).unwrap();

    assert_eq!(
      policy.classify(
        StoreKind::Results,
        now + Duration::days(5),
        Some(old),
        now,
        now.date_naive()
      ),
      Freshness::Evictable
    );
  }

  #[test]
  fn retention_cutoff_follows_local_date_not_utc() {
    let policy = CachePolicy::default();
    // UTC is still on the 30th, the local calendar already reads the 31st
    let now = Utc.with_ymd_and_hms(2024, 3, 30, 20, 0, 0).unwrap();
    let local_today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
    let feb_29 = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    let expires_at = now + Duration::days(1);

    assert_eq!(
      policy.classify(StoreKind::Results, expires_at, Some(feb_29), now, now.date_naive()),
      Freshness::Fresh
    );
    assert_eq!(
      policy.classify(StoreKind::Results, expires_at, Some(feb_29), now, local_today),
      Freshness::Evictable
    );
  }

  #[test]
  fn market_cap_keeps_expired_records_inside_grace() {
    let policy = CachePolicy::default();
    let written = at(2024, 3, 1);
    let expires_at = policy.expires_at(StoreKind::MarketCap, written);

    let eight_days = written + Duration::days(8);
    assert_eq!(
      policy.classify(
        StoreKind::MarketCap,
        expires_at,
        None,
        eight_days,
        eight_days.date_naive()
      ),
      Freshness::Expired
    );

    let way_later = written + Duration::days(40);
    assert_eq!(
      policy.classify(
        StoreKind::MarketCap,
        expires_at,
        None,
        way_later,
        way_later.date_naive()
      ),
      Freshness::Evictable
    );
  }
}
