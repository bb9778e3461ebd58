//! Typed failures that callers are expected to branch on.
//!
//! Infrastructure errors (SQLite, config, I/O) stay as `color_eyre::Report`.

use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the read path to the UI.
#[derive(Debug, Error)]
pub enum ReadError {
  #[error("date {date} is outside the {retention_days}-day retention window")]
  OutOfRange { date: NaiveDate, retention_days: u64 },

  #[error("all {attempts} providers failed for {resource}")]
  ProviderExhausted { resource: String, attempts: usize },

  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("server error: {0}")]
  Server(String),

  #[error("malformed response: {0}")]
  Malformed(String),
}

/// One failed provider attempt.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
  #[error("timed out after {0:?}")]
  Timeout(Duration),

  #[error("transport error: {0}")]
  Transport(String),

  #[error("unexpected status {0}")]
  Status(u16),

  #[error("malformed response: {0}")]
  Malformed(String),
}

#[derive(Debug, Clone)]
pub struct ProviderFailure {
  pub provider: String,
  pub error: ProviderError,
}

/// Result of a fallback fetch that found no working provider.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
  #[error("all providers exhausted ({} attempted)", attempts.len())]
  Exhausted { attempts: Vec<ProviderFailure> },
}

impl FetchError {
  pub fn into_read_error(self, resource: impl Into<String>) -> ReadError {
    match self {
      FetchError::Exhausted { attempts } => ReadError::ProviderExhausted {
        resource: resource.into(),
        attempts: attempts.len(),
      },
    }
  }
}

/// Client transport failures. Any of these downgrades connectivity.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
  #[error("request timed out")]
  Timeout,

  #[error("connection failed: {0}")]
  Connect(String),

  #[error("invalid request url: {0}")]
  InvalidUrl(String),
}
