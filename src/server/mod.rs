//! Server side: durable cache store, the services built on it, and the HTTP API.

pub mod api;
mod market_cap;
mod results;
mod store;

pub use api::AppState;
pub use market_cap::MarketCapService;
pub use results::{ResultsService, DATE_INDEX_KEY, STATISTICS_KEY};
pub use store::DurableStore;

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{CachePolicy, SqliteStorage, SystemClock};
use crate::config::Config;
use crate::providers::FallbackFetcher;

impl AppState {
  /// Open the durable store from config and wire the services to it.
  pub fn open(config: &Config) -> Result<Self> {
    let path = config.server.database_path()?;
    let storage = SqliteStorage::open(&path)?;
    info!(path = %path.display(), "opened durable store");

    let store = Arc::new(DurableStore::new(
      Arc::new(storage),
      CachePolicy::from(&config.cache),
      Arc::new(SystemClock),
    ));
    let fetcher = FallbackFetcher::market_cap(&config.providers.market_cap)?;
    if fetcher.provider_names().is_empty() {
      warn!("no market-cap providers configured; only cached snapshots can be served");
    }

    Ok(Self {
      results: Arc::new(ResultsService::new(
        Arc::clone(&store),
        config.server.recent_dates_limit,
      )),
      market_caps: Arc::new(MarketCapService::new(store, fetcher)),
    })
  }
}

/// Run the HTTP server until it fails.
pub async fn serve(config: &Config) -> Result<()> {
  let state = AppState::open(config)?;

  if config.server.sweep_interval_minutes > 0 {
    spawn_periodic_sweep(
      Arc::clone(&state.results),
      Duration::from_secs(config.server.sweep_interval_minutes * 60),
    );
  }

  let addr = format!("{}:{}", config.server.host, config.server.port);
  let listener = tokio::net::TcpListener::bind(&addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;
  info!(%addr, "serving API under /api");

  axum::serve(listener, api::app(state))
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  Ok(())
}

fn spawn_periodic_sweep(results: Arc<ResultsService>, every: Duration) {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately
    ticker.tick().await;
    loop {
      ticker.tick().await;
      match results.cleanup().await {
        Ok(report) => info!(deleted = report.total(), "periodic sweep"),
        Err(e) => warn!(error = %e, "periodic sweep failed"),
      }
    }
  });
}
