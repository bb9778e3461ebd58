//! Selection results, the date index, statistics and ticker search, all
//! served out of the durable store.

use chrono::{Days, NaiveDate};
use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use super::store::DurableStore;
use crate::cache::{CacheRecord, StoreKind, SweepReport};
use crate::types::{
  DailySummary, SearchMatch, SearchQuery, SearchSelection, SelectionEntry, SelectorPerformance,
  Statistics,
};

/// Singleton key of the date index.
pub const DATE_INDEX_KEY: &str = "dates";
/// Singleton key of the statistics record.
pub const STATISTICS_KEY: &str = "all";

pub struct ResultsService {
  store: Arc<DurableStore>,
  recent_dates_limit: usize,
}

impl ResultsService {
  pub fn new(store: Arc<DurableStore>, recent_dates_limit: usize) -> Self {
    Self {
      store,
      recent_dates_limit,
    }
  }

  #[cfg(test)]
  pub fn store(&self) -> &Arc<DurableStore> {
    &self.store
  }

  /// Store the outcome of a selection run for `date`.
  ///
  /// Replaces the date index wholesale and drops derived statistics and
  /// search records, which were computed without this date.
  pub fn record(&self, date: NaiveDate, mut entries: Vec<SelectionEntry>) -> Result<()> {
    let policy = self.store.policy();
    if !policy.is_within_retention(date, self.store.today()) {
      return Err(eyre!(
        "Refusing to store results for {}: outside the {}-day retention window",
        date,
        policy.retention_days()
      ));
    }

    for entry in &mut entries {
      entry.stock_count = entry.stocks.len();
      entry.stocks_detail.clear();
    }
    entries.sort_by(|a, b| b.stock_count.cmp(&a.stock_count));

    self
      .store
      .put(StoreKind::Results, &date.to_string(), &entries, Some(date))?;
    info!(%date, selectors = entries.len(), "stored selection results");

    self.rebuild_date_index()?;
    self.store.invalidate(StoreKind::Statistics, STATISTICS_KEY)?;
    self.store.invalidate_kind(StoreKind::Search)?;
    Ok(())
  }

  /// Entries for `date`; empty when nothing is known or the date is outside
  /// the retention window.
  pub fn results_for(&self, date: NaiveDate) -> Result<Vec<SelectionEntry>> {
    Ok(
      self
        .store
        .get::<Vec<SelectionEntry>>(StoreKind::Results, &date.to_string())?
        .map(|r| r.payload)
        .unwrap_or_default(),
    )
  }

  /// Known result dates, most recent first.
  pub async fn dates(&self) -> Result<Vec<NaiveDate>> {
    self
      .store
      .get_or_compute(StoreKind::DateIndex, DATE_INDEX_KEY, None, || async {
        self.scan_dates()
      })
      .await
  }

  pub async fn statistics(&self) -> Result<Statistics> {
    self
      .store
      .get_or_compute(StoreKind::Statistics, STATISTICS_KEY, None, || async {
        self.compute_statistics()
      })
      .await
  }

  pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchMatch>> {
    self
      .store
      .get_or_compute(StoreKind::Search, &query.cache_key(), None, || async {
        self.compute_search(query)
      })
      .await
  }

  /// Sweep the store now. Derived records are refreshed if results went away.
  pub async fn cleanup(&self) -> Result<SweepReport> {
    let report = self.store.sweep().await?;

    if report.deleted.get(&StoreKind::Results).copied().unwrap_or(0) > 0 {
      if let Err(e) = self.rebuild_date_index() {
        warn!(error = %e, "failed to rebuild date index after sweep");
      }
      self.store.invalidate(StoreKind::Statistics, STATISTICS_KEY)?;
      self.store.invalidate_kind(StoreKind::Search)?;
    }

    Ok(report)
  }

  fn rebuild_date_index(&self) -> Result<()> {
    let dates = self.scan_dates()?;
    self
      .store
      .put(StoreKind::DateIndex, DATE_INDEX_KEY, &dates, None)
  }

  fn scan_dates(&self) -> Result<Vec<NaiveDate>> {
    let mut dates: Vec<NaiveDate> = self
      .readable_results(|_| true)?
      .into_iter()
      .filter_map(|r| r.associated_date)
      .collect();
    dates.sort_unstable_by(|a, b| b.cmp(a));
    dates.truncate(self.recent_dates_limit);
    Ok(dates)
  }

  fn readable_results(
    &self,
    predicate: impl Fn(&CacheRecord<Vec<SelectionEntry>>) -> bool,
  ) -> Result<Vec<CacheRecord<Vec<SelectionEntry>>>> {
    self.store.range_query(StoreKind::Results, predicate)
  }

  fn compute_search(&self, query: &SearchQuery) -> Result<Vec<SearchMatch>> {
    let today = self.store.today();
    let cutoff = today
      .checked_sub_days(Days::new(u64::from(query.days)))
      .unwrap_or(NaiveDate::MIN);
    let wanted: BTreeSet<&str> = query.tickers.iter().map(String::as_str).collect();

    let records = self.readable_results(|r| {
      r.associated_date.map_or(false, |d| d >= cutoff)
        && r
          .payload
          .iter()
          .any(|e| e.stocks.iter().any(|s| wanted.contains(s.as_str())))
    })?;

    let matches = query
      .tickers
      .iter()
      .map(|code| {
        let selections: Vec<SearchSelection> = records
          .iter()
          .filter_map(|r| r.associated_date.map(|d| (d, &r.payload)))
          .flat_map(|(date, entries)| {
            entries
              .iter()
              .filter(|e| e.stocks.iter().any(|s| s == code))
              .map(move |e| SearchSelection {
                date,
                selector_name: e.selector_name.clone(),
                total_stocks: e.stock_count,
              })
          })
          .collect();

        SearchMatch {
          stock_code: code.clone(),
          selection_count: selections.len(),
          selections,
        }
      })
      .collect();

    Ok(matches)
  }

  fn compute_statistics(&self) -> Result<Statistics> {
    let records = self.readable_results(|_| true)?;

    let mut dates: Vec<NaiveDate> = records.iter().filter_map(|r| r.associated_date).collect();
    dates.sort_unstable();

    let mut selectors: BTreeMap<&str, Vec<(NaiveDate, usize)>> = BTreeMap::new();
    let mut execution_summary = Vec::with_capacity(records.len());
    let mut total_records = 0;

    for record in &records {
      let Some(date) = record.associated_date else {
        continue;
      };
      let entries = &record.payload;
      total_records += entries.len();

      for entry in entries {
        selectors
          .entry(entry.selector_name.as_str())
          .or_default()
          .push((date, entry.stock_count));
      }

      let avg_execution_time = if entries.is_empty() {
        0.0
      } else {
        entries.iter().map(|e| e.execution_time).sum::<f64>() / entries.len() as f64
      };
      execution_summary.push(DailySummary {
        date,
        selector_count: entries.len(),
        total_stocks: entries.iter().map(|e| e.stock_count).sum(),
        avg_execution_time,
      });
    }
    execution_summary.sort_by(|a, b| b.date.cmp(&a.date));

    let mut selector_performance: Vec<SelectorPerformance> = selectors
      .iter()
      .filter_map(|(name, runs)| {
        let last_execution = runs.iter().map(|(d, _)| *d).max()?;
        Some(SelectorPerformance {
          selector_name: name.to_string(),
          execution_count: runs.len(),
          avg_stocks: runs.iter().map(|(_, n)| *n as f64).sum::<f64>() / runs.len() as f64,
          max_stocks: runs.iter().map(|(_, n)| *n).max().unwrap_or(0),
          last_execution,
        })
      })
      .collect();
    selector_performance.sort_by(|a, b| b.avg_stocks.total_cmp(&a.avg_stocks));

    let size_bytes = self.store.size_bytes()?;

    Ok(Statistics {
      records_by_kind: self.store.counts()?,
      total_records,
      unique_dates: dates.len(),
      unique_selectors: selectors.len(),
      earliest_date: dates.first().copied(),
      latest_date: dates.last().copied(),
      database_size_mb: (size_bytes as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0,
      max_retention_days: self.store.policy().retention_days(),
      selector_performance,
      execution_summary,
    })
  }
}
