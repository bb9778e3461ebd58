//! HTTP read API.
//!
//! Every response uses the `{status, data|message}` envelope:
//! - GET  /dates              - known result dates, most recent first
//! - GET  /results/{date}     - selection entries for a date (empty if none)
//! - GET  /statistics         - aggregate counts and sizes
//! - GET  /search             - ticker matches within the last `days`
//! - GET  /market-cap/{code}  - market-cap snapshot via provider fallback
//! - POST /cleanup            - immediate sweep, deleted counts per store kind

use axum::{
  extract::{Path, Query, State},
  http::StatusCode,
  routing::{get, post},
  Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::market_cap::MarketCapService;
use super::results::ResultsService;
use crate::cache::SweepReport;
use crate::error::ReadError;
use crate::types::{
  is_stock_code, Envelope, MarketCapView, SearchMatch, SearchQuery, SelectionEntry, Statistics,
};

// ============================================================================
// STATE
// ============================================================================

#[derive(Clone)]
pub struct AppState {
  pub results: Arc<ResultsService>,
  pub market_caps: Arc<MarketCapService>,
}

type ApiResponse<T> = (StatusCode, Json<Envelope<T>>);

fn ok<T>(data: T) -> ApiResponse<T> {
  (StatusCode::OK, Json(Envelope::ok(data)))
}

fn fail<T>(status: StatusCode, message: impl Into<String>) -> ApiResponse<T> {
  (status, Json(Envelope::error(message)))
}

fn internal<T>(err: color_eyre::Report) -> ApiResponse<T> {
  error!(error = %err, "request failed");
  fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

// ============================================================================
// ROUTER
// ============================================================================

/// Routes without a prefix.
pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/dates", get(dates))
    .route("/results/:date", get(results))
    .route("/statistics", get(statistics))
    .route("/search", get(search))
    .route("/market-cap/:code", get(market_cap))
    .route("/cleanup", post(cleanup))
    .with_state(state)
}

/// Full application: API under `/api` with request tracing.
pub fn app(state: AppState) -> Router {
  Router::new()
    .nest("/api", router(state))
    .layer(TraceLayer::new_for_http())
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn dates(State(state): State<AppState>) -> ApiResponse<Vec<NaiveDate>> {
  match state.results.dates().await {
    Ok(dates) => ok(dates),
    Err(e) => internal(e),
  }
}

async fn results(
  State(state): State<AppState>,
  Path(date): Path<String>,
) -> ApiResponse<Vec<SelectionEntry>> {
  let Ok(date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
    return fail(StatusCode::BAD_REQUEST, "date must be formatted YYYY-MM-DD");
  };

  match state.results.results_for(date) {
    Ok(mut entries) => {
      state.market_caps.attach_details(&mut entries);
      ok(entries)
    }
    Err(e) => internal(e),
  }
}

async fn statistics(State(state): State<AppState>) -> ApiResponse<Statistics> {
  match state.results.statistics().await {
    Ok(stats) => ok(stats),
    Err(e) => internal(e),
  }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
  stocks: Option<String>,
  days: Option<String>,
}

async fn search(
  State(state): State<AppState>,
  Query(params): Query<SearchParams>,
) -> ApiResponse<Vec<SearchMatch>> {
  let stocks = params.stocks.unwrap_or_default();
  if stocks.trim().is_empty() {
    return fail(StatusCode::BAD_REQUEST, "stocks parameter is required");
  }

  let days = match params.days.as_deref().map(str::parse::<u32>) {
    None => None,
    Some(Ok(days)) if days > 0 => Some(days),
    Some(_) => return fail(StatusCode::BAD_REQUEST, "days must be a positive integer"),
  };

  let Some(query) = SearchQuery::parse(&stocks, days) else {
    return fail(StatusCode::BAD_REQUEST, "no valid 6-digit stock codes given");
  };

  match state.results.search(&query).await {
    Ok(matches) => ok(matches),
    Err(e) => internal(e),
  }
}

async fn market_cap(
  State(state): State<AppState>,
  Path(code): Path<String>,
) -> ApiResponse<MarketCapView> {
  if !is_stock_code(&code) {
    return fail(StatusCode::BAD_REQUEST, "code must be a 6-digit stock code");
  }

  match state.market_caps.get(&code).await {
    Ok(result) => {
      let stale = result.is_stale();
      ok(MarketCapView {
        snapshot: result.data,
        stale,
      })
    }
    Err(e @ ReadError::ProviderExhausted { .. }) => {
      fail(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
    Err(e) => fail(StatusCode::BAD_GATEWAY, e.to_string()),
  }
}

#[derive(Debug, Serialize)]
struct CleanupReport {
  #[serde(flatten)]
  report: SweepReport,
  total: usize,
}

async fn cleanup(State(state): State<AppState>) -> ApiResponse<CleanupReport> {
  match state.results.cleanup().await {
    Ok(report) => ok(CleanupReport::from(report)),
    Err(e) => internal(e),
  }
}

impl From<SweepReport> for CleanupReport {
  fn from(report: SweepReport) -> Self {
    let total = report.total();
    Self { report, total }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachePolicy, ManualClock, SqliteStorage};
  use crate::providers::testing::{fetcher, ScriptedProvider};
  use crate::server::store::DurableStore;
  use axum::body::{to_bytes, Body};
  use axum::http::Request;
  use serde_json::{json, Value};
  use tower::ServiceExt;

  fn state(clock: Arc<ManualClock>, providers: &[Arc<ScriptedProvider>]) -> AppState {
    let store = Arc::new(DurableStore::new(
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      CachePolicy::default(),
      clock,
    ));
    AppState {
      results: Arc::new(ResultsService::new(Arc::clone(&store), 100)),
      market_caps: Arc::new(MarketCapService::new(store, fetcher(providers))),
    }
  }

  async fn call(state: &AppState, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app(state.clone())
      .oneshot(
        Request::builder()
          .method(method)
          .uri(uri)
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
  }

  fn seed(state: &AppState) {
    state
      .results
      .record(
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        vec![SelectionEntry {
          selector_name: "breakout".into(),
          stocks: vec!["600000".into(), "000001".into()],
          stock_count: 0,
          execution_time: 0.5,
          selector_config: None,
          stocks_detail: Vec::new(),
        }],
      )
      .unwrap();
  }

  #[tokio::test]
  async fn dates_and_results_use_the_envelope() {
    let state = state(Arc::new(ManualClock::at_date(2024, 1, 16)), &[]);
    seed(&state);

    let (status, body) = call(&state, "GET", "/api/dates").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "data": ["2024-01-15"]}));

    let (status, body) = call(&state, "GET", "/api/results/2024-01-15").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["selector_name"], "breakout");
    assert_eq!(body["data"][0]["stock_count"], 2);
    assert_eq!(body["data"][0]["stocks_detail"][0]["market_cap"], Value::Null);
  }

  #[tokio::test]
  async fn unknown_date_is_an_empty_list() {
    let state = state(Arc::new(ManualClock::at_date(2024, 1, 16)), &[]);

    let (status, body) = call(&state, "GET", "/api/results/2024-01-10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "data": []}));

    let (status, body) = call(&state, "GET", "/api/results/15-01-2024").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
  }

  #[tokio::test]
  async fn search_validates_codes() {
    let state = state(Arc::new(ManualClock::at_date(2024, 1, 16)), &[]);
    seed(&state);

    let (status, body) = call(&state, "GET", "/api/search?stocks=600000,bogus&days=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["stock_code"], "600000");
    assert_eq!(body["data"][0]["selection_count"], 1);

    let (status, _) = call(&state, "GET", "/api/search?stocks=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&state, "GET", "/api/search?stocks=600000&days=x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&state, "GET", "/api/search").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn statistics_report_counts() {
    let state = state(Arc::new(ManualClock::at_date(2024, 1, 16)), &[]);
    seed(&state);

    let (status, body) = call(&state, "GET", "/api/statistics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["unique_dates"], 1);
    assert_eq!(body["data"]["records_by_kind"]["results"], 1);
  }

  #[tokio::test]
  async fn cleanup_reports_counts_per_kind() {
    let clock = Arc::new(ManualClock::at_date(2024, 1, 16));
    let state = state(clock.clone(), &[]);
    seed(&state);
    clock.advance(chrono::Duration::days(40));

    let (status, body) = call(&state, "POST", "/api/cleanup").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted"]["results"], 1);
    assert_eq!(body["data"]["deleted"]["search"], 0);
    assert!(body["data"]["total"].as_u64().unwrap() >= 1);
  }

  #[tokio::test]
  async fn market_cap_maps_exhaustion_to_503() {
    let state = state(
      Arc::new(ManualClock::at_date(2024, 1, 16)),
      &[ScriptedProvider::failing("p1")],
    );

    let (status, body) = call(&state, "GET", "/api/market-cap/600000").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "error");
  }

  #[tokio::test]
  async fn market_cap_reports_provider_and_freshness() {
    let state = state(
      Arc::new(ManualClock::at_date(2024, 1, 16)),
      &[ScriptedProvider::failing("p1"), ScriptedProvider::ok("p2", 1.0e9)],
    );

    let (status, body) = call(&state, "GET", "/api/market-cap/600000").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["provider"], "p2");
    assert_eq!(body["data"]["stale"], false);
  }
}
