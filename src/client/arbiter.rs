//! Request arbitration between the client and the network.
//!
//! Every outgoing request is classified and served with one of two strategies:
//! - Static assets: cache-first, refetched once the cached copy is past the
//!   response TTL
//! - API resources: network-first, falling back to the last cached response
//!
//! Cached responses live in the mirror's `response` partition, so they
//! survive restarts. A transport failure downgrades connectivity; any
//! response upgrades it.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connectivity::ConnectivityState;
use super::mirror::MirrorStore;
use super::transport::{HttpResponse, Transport};
use crate::cache::{Freshness, StoreKind};

const STATIC_EXTENSIONS: &[&str] = &[
  "html", "htm", "css", "js", "png", "jpg", "jpeg", "svg", "ico", "webmanifest", "woff", "woff2",
];

/// Path used to check reachability while offline.
const REACHABILITY_PATH: &str = "dates";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  StaticAsset,
  Api,
}

impl RequestClass {
  pub fn classify(path: &str) -> Self {
    let path = path.split('?').next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    if path.is_empty() || path.ends_with('/') {
      return RequestClass::StaticAsset;
    }
    match last.rsplit_once('.') {
      Some((_, ext)) if STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {
        RequestClass::StaticAsset
      }
      _ => RequestClass::Api,
    }
  }
}

/// Outcome of one arbitrated request.
#[derive(Debug, Clone, PartialEq)]
pub enum Arbitrated {
  /// Straight from the network
  Network(HttpResponse),
  /// Cached copy; `fallback` is set when it was served because the network failed
  Cached {
    response: HttpResponse,
    fetched_at: DateTime<Utc>,
    fallback: bool,
  },
  /// Static asset with no cached copy and no network
  ServiceUnavailable,
  /// API request with no cached copy and no network
  Failed { reason: String },
}

/// Stored form of a response; the body is hex so binary assets survive JSON.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
  status: u16,
  body: String,
}

impl StoredResponse {
  fn encode(response: &HttpResponse) -> Self {
    Self {
      status: response.status,
      body: hex::encode(&response.body),
    }
  }

  fn decode(self) -> Result<HttpResponse> {
    let body = hex::decode(&self.body).map_err(|e| eyre!("Corrupt cached body: {}", e))?;
    Ok(HttpResponse {
      status: self.status,
      body,
    })
  }
}

struct CachedResponse {
  response: HttpResponse,
  fetched_at: DateTime<Utc>,
  freshness: Freshness,
}

pub struct RequestArbiter {
  transport: Arc<dyn Transport>,
  connectivity: Arc<ConnectivityState>,
  mirror: Arc<MirrorStore>,
}

impl RequestArbiter {
  pub fn new(
    transport: Arc<dyn Transport>,
    connectivity: Arc<ConnectivityState>,
    mirror: Arc<MirrorStore>,
  ) -> Self {
    Self {
      transport,
      connectivity,
      mirror,
    }
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityState> {
    &self.connectivity
  }

  pub async fn fetch(&self, path: &str) -> Arbitrated {
    match RequestClass::classify(path) {
      RequestClass::StaticAsset => self.cache_first(path).await,
      RequestClass::Api => self.network_first(path).await,
    }
  }

  async fn cache_first(&self, path: &str) -> Arbitrated {
    let cached = self.cached(path);
    if let Some(c) = &cached {
      if c.freshness == Freshness::Fresh {
        debug!(path, "static asset served from cache");
        return Arbitrated::Cached {
          response: c.response.clone(),
          fetched_at: c.fetched_at,
          fallback: false,
        };
      }
    }

    match self.attempt(path).await {
      Ok(response) => {
        self.remember(path, &response);
        Arbitrated::Network(response)
      }
      Err(reason) => match cached {
        Some(c) => {
          debug!(path, %reason, "serving expired static asset");
          Arbitrated::Cached {
            response: c.response,
            fetched_at: c.fetched_at,
            fallback: true,
          }
        }
        None => Arbitrated::ServiceUnavailable,
      },
    }
  }

  async fn network_first(&self, path: &str) -> Arbitrated {
    match self.attempt(path).await {
      Ok(response) => {
        self.remember(path, &response);
        Arbitrated::Network(response)
      }
      Err(reason) => match self.cached(path) {
        Some(c) => {
          debug!(path, %reason, "network failed, serving cached response");
          Arbitrated::Cached {
            response: c.response,
            fetched_at: c.fetched_at,
            fallback: true,
          }
        }
        None => Arbitrated::Failed { reason },
      },
    }
  }

  /// One network call. Transport errors and 5xx responses are failures.
  async fn attempt(&self, path: &str) -> Result<HttpResponse, String> {
    match self.transport.get(path).await {
      Ok(response) => {
        self.connectivity.set_online();
        if response.is_server_error() {
          warn!(path, status = response.status, "server error");
          Err(format!("server returned {}", response.status))
        } else {
          Ok(response)
        }
      }
      Err(e) => {
        warn!(path, error = %e, "request failed");
        self.connectivity.set_offline();
        Err(e.to_string())
      }
    }
  }

  /// Stored response for `path`, unless it is past its keep horizon.
  fn cached(&self, path: &str) -> Option<CachedResponse> {
    let found = self
      .mirror
      .lookup::<StoredResponse>(StoreKind::Response, path)
      .unwrap_or_else(|e| {
        warn!(path, error = %e, "cached response unreadable, treating as miss");
        None
      });
    let (record, freshness) = found.filter(|(_, f)| *f != Freshness::Evictable)?;

    match record.payload.decode() {
      Ok(response) => Some(CachedResponse {
        response,
        fetched_at: record.created_at,
        freshness,
      }),
      Err(e) => {
        warn!(path, error = %e, "cached response unreadable, treating as miss");
        None
      }
    }
  }

  fn remember(&self, path: &str, response: &HttpResponse) {
    if !response.is_success() {
      return;
    }
    let stored = StoredResponse::encode(response);
    if let Err(e) = self.mirror.put(StoreKind::Response, path, &stored, None) {
      warn!(path, error = %e, "failed to cache response");
    }
  }

  /// One reachability check. Any response flips connectivity back online.
  pub async fn check_reachability(&self) -> bool {
    let _ = self.attempt(REACHABILITY_PATH).await;
    self.connectivity.is_online()
  }

  /// While offline, check reachability every `every` so a reconnect is
  /// noticed even when every read is served from the mirror.
  pub fn spawn_reachability_checks(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
    let arbiter = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if !arbiter.connectivity.is_online() && arbiter.check_reachability().await {
          debug!("reachability check reached the server");
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachePolicy, ManualClock, RecordStorage, SqliteStorage};
  use crate::client::transport::testing::FakeTransport;
  use chrono::Duration as ChronoDuration;
  use serde_json::json;

  async fn arbiter_over(
    storage: Arc<dyn RecordStorage>,
    transport: Arc<FakeTransport>,
    clock: Arc<ManualClock>,
  ) -> Arc<RequestArbiter> {
    let policy = CachePolicy::default()
      .with_response_ttl(ChronoDuration::hours(24), ChronoDuration::days(30));
    let mirror = MirrorStore::open(storage, policy, clock).await.unwrap();
    Arc::new(RequestArbiter::new(
      transport,
      Arc::new(ConnectivityState::default()),
      Arc::new(mirror),
    ))
  }

  async fn arbiter(transport: Arc<FakeTransport>, clock: Arc<ManualClock>) -> Arc<RequestArbiter> {
    arbiter_over(
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      transport,
      clock,
    )
    .await
  }

  #[test]
  fn classifies_static_assets_by_extension() {
    assert_eq!(RequestClass::classify(""), RequestClass::StaticAsset);
    assert_eq!(RequestClass::classify("static/app.JS"), RequestClass::StaticAsset);
    assert_eq!(RequestClass::classify("index.html?v=2"), RequestClass::StaticAsset);
    assert_eq!(RequestClass::classify("dates"), RequestClass::Api);
    assert_eq!(RequestClass::classify("results/2024-01-15"), RequestClass::Api);
    assert_eq!(
      RequestClass::classify("search?stocks=600000&days=7"),
      RequestClass::Api
    );
  }

  #[tokio::test]
  async fn static_assets_are_cache_first() {
    let transport = Arc::new(FakeTransport::new());
    transport.respond_raw("app.css", 200, b"body{}".to_vec());
    let clock = Arc::new(ManualClock::at_date(2024, 1, 15));
    let arbiter = arbiter(transport.clone(), clock.clone()).await;

    assert!(matches!(arbiter.fetch("app.css").await, Arbitrated::Network(_)));
    assert!(matches!(
      arbiter.fetch("app.css").await,
      Arbitrated::Cached { fallback: false, .. }
    ));
    assert_eq!(transport.calls(), 1);

    // Past max age: refetched, and an expired copy still beats nothing
    clock.advance(ChronoDuration::hours(25));
    transport.set_down(true);
    match arbiter.fetch("app.css").await {
      Arbitrated::Cached {
        response, fallback, ..
      } => {
        assert!(fallback);
        assert_eq!(response.body, b"body{}".to_vec());
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(transport.calls(), 2);

    assert_eq!(
      arbiter.fetch("logo.png").await,
      Arbitrated::ServiceUnavailable
    );
  }

  #[tokio::test]
  async fn cached_responses_survive_a_restart() {
    let storage: Arc<dyn RecordStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::at_date(2024, 1, 15));
    let transport = Arc::new(FakeTransport::new());
    transport.respond_raw("app.css", 200, vec![0x00, 0xff, b'{']);
    transport.respond("dates", 200, json!({"status": "ok", "data": ["2024-01-15"]}));

    let first = arbiter_over(Arc::clone(&storage), transport.clone(), clock.clone()).await;
    assert!(matches!(first.fetch("app.css").await, Arbitrated::Network(_)));
    assert!(matches!(first.fetch("dates").await, Arbitrated::Network(_)));
    drop(first);

    let down = Arc::new(FakeTransport::new());
    down.set_down(true);
    let second = arbiter_over(storage, down.clone(), clock).await;

    match second.fetch("app.css").await {
      Arbitrated::Cached { response, fallback, .. } => {
        assert!(!fallback);
        assert_eq!(response.body, vec![0x00, 0xff, b'{']);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(down.calls(), 0);
    assert!(matches!(
      second.fetch("dates").await,
      Arbitrated::Cached { fallback: true, .. }
    ));
  }

  #[tokio::test]
  async fn responses_past_keep_horizon_are_dropped() {
    let transport = Arc::new(FakeTransport::new());
    transport.respond_raw("app.css", 200, b"body{}".to_vec());
    let clock = Arc::new(ManualClock::at_date(2024, 1, 15));
    let arbiter = arbiter(transport.clone(), clock.clone()).await;
    arbiter.fetch("app.css").await;

    let keep = ChronoDuration::hours(24) + ChronoDuration::days(30);
    clock.advance(keep + ChronoDuration::seconds(1));
    transport.set_down(true);
    assert_eq!(arbiter.fetch("app.css").await, Arbitrated::ServiceUnavailable);
  }

  #[tokio::test]
  async fn api_requests_are_network_first_with_fallback() {
    let transport = Arc::new(FakeTransport::new());
    transport.respond("dates", 200, json!({"status": "ok", "data": ["2024-01-15"]}));
    let clock = Arc::new(ManualClock::at_date(2024, 1, 15));
    let arbiter = arbiter(transport.clone(), clock).await;

    assert!(matches!(arbiter.fetch("dates").await, Arbitrated::Network(_)));
    assert!(matches!(arbiter.fetch("dates").await, Arbitrated::Network(_)));
    assert_eq!(transport.calls(), 2);

    transport.set_down(true);
    assert!(matches!(
      arbiter.fetch("dates").await,
      Arbitrated::Cached { fallback: true, .. }
    ));
    assert!(!arbiter.connectivity().is_online());

    assert!(matches!(
      arbiter.fetch("statistics").await,
      Arbitrated::Failed { .. }
    ));
  }

  #[tokio::test]
  async fn server_errors_fall_back_without_going_offline() {
    let transport = Arc::new(FakeTransport::new());
    transport.respond("statistics", 200, json!({"status": "ok", "data": {"n": 1}}));
    let arbiter = arbiter(transport.clone(), Arc::new(ManualClock::at_date(2024, 1, 15))).await;
    arbiter.fetch("statistics").await;

    transport.respond("statistics", 503, json!({"status": "error", "message": "busy"}));
    assert!(matches!(
      arbiter.fetch("statistics").await,
      Arbitrated::Cached { fallback: true, .. }
    ));
    assert!(arbiter.connectivity().is_online());
  }

  #[tokio::test]
  async fn error_responses_are_not_cached() {
    let transport = Arc::new(FakeTransport::new());
    let arbiter = arbiter(transport.clone(), Arc::new(ManualClock::at_date(2024, 1, 15))).await;

    match arbiter.fetch("results/2024-01-15").await {
      Arbitrated::Network(r) => assert_eq!(r.status, 404),
      other => panic!("unexpected {:?}", other),
    }
    transport.set_down(true);
    assert!(matches!(
      arbiter.fetch("results/2024-01-15").await,
      Arbitrated::Failed { .. }
    ));
  }

  #[tokio::test]
  async fn reachability_check_flips_connectivity_back_online() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_down(true);
    let arbiter = arbiter(transport.clone(), Arc::new(ManualClock::at_date(2024, 1, 15))).await;

    assert!(!arbiter.check_reachability().await);
    assert!(!arbiter.connectivity().is_online());

    transport.set_down(false);
    assert!(arbiter.check_reachability().await);
    assert!(arbiter.connectivity().is_online());
    assert_eq!(transport.calls_to(REACHABILITY_PATH), 2);
  }
}
