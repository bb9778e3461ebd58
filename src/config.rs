use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub providers: ProvidersConfig,
  #[serde(default)]
  pub client: ClientConfig,
  /// Directory for rolling log files (defaults under the data directory)
  pub log_dir: Option<PathBuf>,
}

/// TTL table and retention window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub retention_days: u64,
  pub results_ttl_days: i64,
  pub market_cap_ttl_days: i64,
  /// How long past its TTL a market-cap record is kept for grace fallback
  pub market_cap_grace_days: i64,
  pub statistics_ttl_minutes: i64,
  pub search_ttl_minutes: i64,
  pub date_index_ttl_minutes: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      retention_days: 30,
      results_ttl_days: 30,
      market_cap_ttl_days: 7,
      market_cap_grace_days: 30,
      statistics_ttl_minutes: 10,
      search_ttl_minutes: 5,
      date_index_ttl_minutes: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub host: String,
  pub port: u16,
  /// SQLite file for the durable store
  pub database: Option<PathBuf>,
  /// Minutes between background sweeps; 0 disables them
  pub sweep_interval_minutes: u64,
  /// Maximum number of dates returned by GET /dates
  pub recent_dates_limit: usize,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host: "0.0.0.0".to_string(),
      port: 8080,
      database: None,
      sweep_interval_minutes: 60,
      recent_dates_limit: 100,
    }
  }
}

impl ServerConfig {
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => data_path("results.db"),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
  /// Market-cap providers, tried in order
  #[serde(default)]
  pub market_cap: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
  pub name: String,
  /// Request URL; `{code}` is replaced with the stock code
  pub url: String,
  /// Dot-separated path to the market-cap value in the JSON response
  pub field: String,
  #[serde(default = "default_provider_timeout")]
  pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
  5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  /// Base URL of the server API (must end with a slash)
  pub server_url: String,
  /// Upper bound on every client network call
  pub request_timeout_secs: u64,
  /// SQLite file for the client mirror
  pub mirror: Option<PathBuf>,
  pub mirror_enabled: bool,
  /// Prefer a non-empty mirrored result for today's date over the network
  pub prefer_mirror_for_today: bool,
  /// Cached static assets older than this are refetched
  pub static_asset_max_age_hours: i64,
  /// Days past that age a cached response is kept for offline fallback
  pub response_keep_days: i64,
  /// Seconds between reachability checks while offline; 0 disables them
  pub reachability_check_secs: u64,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      server_url: "http://127.0.0.1:8080/api/".to_string(),
      request_timeout_secs: 10,
      mirror: None,
      mirror_enabled: true,
      prefer_mirror_for_today: true,
      static_asset_max_age_hours: 24,
      response_keep_days: 30,
      reachability_check_secs: 30,
    }
  }
}

impl ClientConfig {
  pub fn mirror_path(&self) -> Result<PathBuf> {
    match &self.mirror {
      Some(p) => Ok(p.clone()),
      None => data_path("mirror.db"),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stockpick.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stockpick/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stockpick.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stockpick").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log_dir {
      Some(p) => Ok(p.clone()),
      None => data_path("logs"),
    }
  }
}

/// Default location for databases and logs under the user's data directory.
pub fn data_path(file_name: &str) -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("stockpick").join(file_name))
}
