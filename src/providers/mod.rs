//! Ordered provider fallback for upstream market data.
//!
//! Providers are tried strictly in configured order. Each attempt is bounded
//! by the provider's own timeout; the first success wins and later providers
//! are never contacted. The fetcher never touches a cache: persisting a
//! successful value is the caller's job.

mod http;

pub use http::HttpProvider;

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{FetchError, ProviderError, ProviderFailure};

/// One upstream source for values of type `T`.
#[async_trait]
pub trait Provider<T>: Send + Sync {
  /// Name reported as `provider_used`
  fn name(&self) -> &str;

  /// Upper bound for a single attempt
  fn timeout(&self) -> Duration;

  async fn fetch(&self, key: &str) -> Result<T, ProviderError>;
}

/// A value together with the provider that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
  pub value: T,
  pub provider: String,
}

pub struct FallbackFetcher<T> {
  providers: Vec<Arc<dyn Provider<T>>>,
}

impl<T> Clone for FallbackFetcher<T> {
  fn clone(&self) -> Self {
    Self {
      providers: self.providers.clone(),
    }
  }
}

impl<T: Send + 'static> FallbackFetcher<T> {
  pub fn new(providers: Vec<Arc<dyn Provider<T>>>) -> Self {
    Self { providers }
  }

  pub fn provider_names(&self) -> Vec<&str> {
    self.providers.iter().map(|p| p.name()).collect()
  }

  pub async fn fetch(&self, key: &str) -> Result<Fetched<T>, FetchError> {
    let mut attempts = Vec::with_capacity(self.providers.len());

    for provider in &self.providers {
      let limit = provider.timeout();
      let outcome = match tokio::time::timeout(limit, provider.fetch(key)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProviderError::Timeout(limit)),
      };

      match outcome {
        Ok(value) => {
          debug!(provider = provider.name(), key, "provider fetch succeeded");
          return Ok(Fetched {
            value,
            provider: provider.name().to_string(),
          });
        }
        Err(error) => {
          warn!(provider = provider.name(), key, %error, "provider fetch failed, trying next");
          attempts.push(ProviderFailure {
            provider: provider.name().to_string(),
            error,
          });
        }
      }
    }

    Err(FetchError::Exhausted { attempts })
  }
}

impl FallbackFetcher<f64> {
  /// Build the market-cap fetcher from the configured provider list.
  pub fn market_cap(configs: &[ProviderConfig]) -> Result<Self> {
    let providers = configs
      .iter()
      .map(|c| HttpProvider::new(c).map(|p| Arc::new(p) as Arc<dyn Provider<f64>>))
      .collect::<Result<Vec<_>>>()?;
    Ok(Self::new(providers))
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Scripted provider for tests.
  pub struct ScriptedProvider {
    pub name: String,
    pub outcome: Result<f64, ProviderError>,
    pub delay: Duration,
    pub timeout: Duration,
    pub calls: AtomicUsize,
  }

  impl ScriptedProvider {
    pub fn ok(name: &str, value: f64) -> Arc<Self> {
      Self::build(name, Ok(value), Duration::ZERO)
    }

    pub fn failing(name: &str) -> Arc<Self> {
      Self::build(
        name,
        Err(ProviderError::Transport("connection refused".into())),
        Duration::ZERO,
      )
    }

    pub fn slow(name: &str, value: f64, delay: Duration) -> Arc<Self> {
      Self::build(name, Ok(value), delay)
    }

    fn build(name: &str, outcome: Result<f64, ProviderError>, delay: Duration) -> Arc<Self> {
      Arc::new(Self {
        name: name.to_string(),
        outcome,
        delay,
        timeout: Duration::from_millis(50),
        calls: AtomicUsize::new(0),
      })
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Provider<f64> for ScriptedProvider {
    fn name(&self) -> &str {
      &self.name
    }

    fn timeout(&self) -> Duration {
      self.timeout
    }

    async fn fetch(&self, _key: &str) -> Result<f64, ProviderError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      self.outcome.clone()
    }
  }

  pub fn fetcher(providers: &[Arc<ScriptedProvider>]) -> FallbackFetcher<f64> {
    FallbackFetcher::new(
      providers
        .iter()
        .map(|p| Arc::clone(p) as Arc<dyn Provider<f64>>)
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::testing::{fetcher, ScriptedProvider};
  use super::*;

  #[tokio::test]
  async fn first_success_wins_and_stops() {
    let p1 = ScriptedProvider::ok("p1", 1.0);
    let p2 = ScriptedProvider::ok("p2", 2.0);

    let got = fetcher(&[p1.clone(), p2.clone()]).fetch("600000").await.unwrap();

    assert_eq!(got.value, 1.0);
    assert_eq!(got.provider, "p1");
    assert_eq!(p2.calls(), 0);
  }

  #[tokio::test]
  async fn falls_through_to_next_provider() {
    let p1 = ScriptedProvider::failing("p1");
    let p2 = ScriptedProvider::ok("p2", 42.0);

    let got = fetcher(&[p1.clone(), p2.clone()]).fetch("600000").await.unwrap();

    assert_eq!(got, Fetched { value: 42.0, provider: "p2".into() });
    assert_eq!(p1.calls(), 1);
  }

  #[tokio::test]
  async fn slow_provider_is_timed_out() {
    let p1 = ScriptedProvider::slow("p1", 1.0, Duration::from_secs(5));
    let p2 = ScriptedProvider::ok("p2", 2.0);

    let got = fetcher(&[p1, p2]).fetch("600000").await.unwrap();
    assert_eq!(got.provider, "p2");
  }

  #[tokio::test]
  async fn all_failing_reports_every_attempt() {
    let err = fetcher(&[ScriptedProvider::failing("a"), ScriptedProvider::failing("b")])
      .fetch("600000")
      .await
      .unwrap_err();

    let FetchError::Exhausted { attempts } = err;
    let names: Vec<&str> = attempts.iter().map(|a| a.provider.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
  }

  #[tokio::test]
  async fn empty_provider_list_is_exhausted() {
    let err = fetcher(&[]).fetch("600000").await.unwrap_err();
    assert!(matches!(err, FetchError::Exhausted { attempts } if attempts.is_empty()));
  }
}
