//! Client network transport.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use url::Url;

use crate::config::ClientConfig;
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_server_error(&self) -> bool {
    self.status >= 500
  }
}

/// Issues GET requests for paths relative to the server API root.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn get(&self, path: &str) -> Result<HttpResponse, TransportError>;
}

pub struct HttpTransport {
  client: reqwest::Client,
  base: Url,
}

impl HttpTransport {
  pub fn new(config: &ClientConfig) -> Result<Self> {
    let mut base = Url::parse(&config.server_url)
      .map_err(|e| eyre!("Failed to parse server url {}: {}", config.server_url, e))?;
    // join() drops the last segment unless the base ends with a slash
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base })
  }

  fn url_for(&self, path: &str) -> Result<Url, TransportError> {
    self
      .base
      .join(path.trim_start_matches('/'))
      .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", path, e)))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
    let url = self.url_for(path)?;
    let response = self.client.get(url).send().await.map_err(map_reqwest)?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(map_reqwest)?;
    Ok(HttpResponse {
      status,
      body: body.to_vec(),
    })
  }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Connect(e.to_string())
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// In-memory transport that counts every request it sees.
  #[derive(Default)]
  pub struct FakeTransport {
    routes: Mutex<HashMap<String, HttpResponse>>,
    calls: Mutex<Vec<String>>,
    total: AtomicUsize,
    down: AtomicBool,
  }

  impl FakeTransport {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn respond(&self, path: &str, status: u16, body: serde_json::Value) {
      self.respond_raw(path, status, body.to_string().into_bytes());
    }

    pub fn respond_raw(&self, path: &str, status: u16, body: Vec<u8>) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(path.to_string(), HttpResponse { status, body });
    }

    /// Fail every request with a connection error.
    pub fn set_down(&self, down: bool) {
      self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
      self.total.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, path: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.as_str() == path)
        .count()
    }
  }

  #[async_trait]
  impl Transport for FakeTransport {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
      self.total.fetch_add(1, Ordering::SeqCst);
      self.calls.lock().unwrap().push(path.to_string());

      if self.down.load(Ordering::SeqCst) {
        return Err(TransportError::Connect("connection refused".into()));
      }
      Ok(
        self
          .routes
          .lock()
          .unwrap()
          .get(path)
          .cloned()
          .unwrap_or(HttpResponse {
            status: 404,
            body: br#"{"status":"error","message":"not found"}"#.to_vec(),
          }),
      )
    }
  }
}
