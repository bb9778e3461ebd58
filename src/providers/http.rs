use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;

use super::Provider;
use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// Market-cap provider backed by a JSON HTTP endpoint.
#[derive(Clone)]
pub struct HttpProvider {
  name: String,
  url_template: String,
  field: String,
  timeout: Duration,
  client: reqwest::Client,
}

impl HttpProvider {
  pub fn new(config: &ProviderConfig) -> Result<Self> {
    if !config.url.contains("{code}") {
      return Err(eyre!(
        "Provider {} url must contain a {{code}} placeholder",
        config.name
      ));
    }

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client for {}: {}", config.name, e))?;

    Ok(Self {
      name: config.name.clone(),
      url_template: config.url.clone(),
      field: config.field.clone(),
      timeout: Duration::from_secs(config.timeout_secs),
      client,
    })
  }

  fn url_for(&self, code: &str) -> String {
    self.url_template.replace("{code}", code)
  }
}

#[async_trait]
impl Provider<f64> for HttpProvider {
  fn name(&self) -> &str {
    &self.name
  }

  fn timeout(&self) -> Duration {
    self.timeout
  }

  async fn fetch(&self, code: &str) -> Result<f64, ProviderError> {
    let response = self
      .client
      .get(self.url_for(code))
      .send()
      .await
      .map_err(|e| ProviderError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(ProviderError::Status(status.as_u16()));
    }

    let body: Value = response
      .json()
      .await
      .map_err(|e| ProviderError::Malformed(e.to_string()))?;

    extract_number(&body, &self.field)
  }
}

/// Walk a dot-separated path and read a positive number.
///
/// Providers often report numbers as strings with thousands separators, so
/// `"1,234.5"` is accepted.
fn extract_number(body: &Value, path: &str) -> Result<f64, ProviderError> {
  let mut node = body;
  for segment in path.split('.').filter(|s| !s.is_empty()) {
    node = match node {
      Value::Object(map) => map.get(segment),
      Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
      _ => None,
    }
    .ok_or_else(|| ProviderError::Malformed(format!("missing field '{}'", path)))?;
  }

  let value = match node {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
    _ => None,
  }
  .ok_or_else(|| ProviderError::Malformed(format!("field '{}' is not a number", path)))?;

  if value.is_finite() && value > 0.0 {
    Ok(value)
  } else {
    Err(ProviderError::Malformed(format!(
      "field '{}' has implausible value {}",
      path, value
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn reads_nested_numbers_and_strings() {
    let body = json!({"data": {"f116": 1.5e11, "list": [{"cap": "2,500.5"}]}});
    assert_eq!(extract_number(&body, "data.f116").unwrap(), 1.5e11);
    assert_eq!(extract_number(&body, "data.list.0.cap").unwrap(), 2500.5);
  }

  #[test]
  fn rejects_missing_and_non_numeric_fields() {
    let body = json!({"data": {"cap": "-", "zero": 0}});
    assert!(matches!(
      extract_number(&body, "data.other"),
      Err(ProviderError::Malformed(_))
    ));
    assert!(matches!(
      extract_number(&body, "data.cap"),
      Err(ProviderError::Malformed(_))
    ));
    assert!(matches!(
      extract_number(&body, "data.zero"),
      Err(ProviderError::Malformed(_))
    ));
  }

  #[test]
  fn url_template_requires_placeholder() {
    let config = ProviderConfig {
      name: "bad".into(),
      url: "https://example.test/quote".into(),
      field: "cap".into(),
      timeout_secs: 1,
    };
    assert!(HttpProvider::new(&config).is_err());

    let config = ProviderConfig {
      url: "https://example.test/quote/{code}".into(),
      ..config
    };
    let provider = HttpProvider::new(&config).unwrap();
    assert_eq!(provider.url_for("600000"), "https://example.test/quote/600000");
  }
}
