mod cache;
mod client;
mod config;
mod error;
mod logging;
mod providers;
mod server;
mod types;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

use crate::cache::StoreKind;
use crate::client::{Arbitrated, Connectivity, ReadFacade, ReadOutcome, ResourceRequest};
use crate::error::ReadError;
use crate::types::{SearchQuery, SelectionEntry};

#[derive(Parser, Debug)]
#[command(name = "stockpick")]
#[command(about = "Serve and browse daily stock-selection results with offline-tolerant caching")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./stockpick.yaml or $XDG_CONFIG_HOME/stockpick/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Server port
  #[arg(long, global = true)]
  port: Option<u16>,

  /// Server database file
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  /// Server API base URL used by client commands
  #[arg(long, global = true)]
  server_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the HTTP API
  Serve,
  /// Sweep expired records from the server store
  Cleanup,
  /// Store selection results for a date from a JSON file
  Ingest {
    /// Trading date, YYYY-MM-DD
    #[arg(long)]
    date: String,
    /// JSON array of selection entries
    #[arg(long)]
    file: PathBuf,
    /// Fetch market caps for the stored stocks afterwards
    #[arg(long)]
    prefetch: bool,
  },
  /// Fetch market caps for every stock selected on a date
  Prefetch {
    /// Trading date, YYYY-MM-DD
    #[arg(long)]
    date: String,
    /// Refetch snapshots that are still fresh
    #[arg(long)]
    force: bool,
  },
  /// Show server store statistics
  Info,
  /// Read a resource through the client mirror and the network
  Read {
    /// Start in offline mode
    #[arg(long)]
    offline: bool,
    #[command(subcommand)]
    resource: Resource,
  },
  /// Show record counts in the client mirror
  MirrorStats,
  /// Drop mirrored records, one store kind or all of them
  MirrorClear {
    /// Store kind, e.g. results, statistics, response
    #[arg(long)]
    kind: Option<String>,
  },
}

#[derive(Subcommand, Debug)]
enum Resource {
  Dates,
  Results { date: String },
  Statistics,
  Search {
    /// Comma-separated 6-digit codes
    stocks: String,
    #[arg(long)]
    days: Option<u32>,
  },
  /// Static asset path relative to the API base URL
  Asset { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command-line overrides
  if let Some(port) = args.port {
    config.server.port = port;
  }
  if let Some(database) = args.database {
    config.server.database = Some(database);
  }
  if let Some(server_url) = args.server_url {
    config.client.server_url = server_url;
  }

  let _log_guard = logging::init(&config.log_dir()?)?;

  match args.command {
    Command::Serve => server::serve(&config).await?,
    Command::Cleanup => {
      let state = server::AppState::open(&config)?;
      let report = state.results.cleanup().await?;
      print_json(&json!({"deleted": report.deleted, "total": report.total()}))?;
    }
    Command::Ingest {
      date,
      file,
      prefetch,
    } => {
      let date = parse_date(&date)?;
      let contents = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let entries: Vec<SelectionEntry> = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Failed to parse {}: {}", file.display(), e))?;

      let state = server::AppState::open(&config)?;
      let count = entries.len();
      state.results.record(date, entries)?;
      println!("Stored {} selection entries for {}", count, date);

      if prefetch {
        print_json(&state.market_caps.prefetch_for(date, false).await?)?;
      }
    }
    Command::Prefetch { date, force } => {
      let date = parse_date(&date)?;
      let state = server::AppState::open(&config)?;
      print_json(&state.market_caps.prefetch_for(date, force).await?)?;
    }
    Command::Info => {
      let state = server::AppState::open(&config)?;
      let stats = state.results.statistics().await?;
      print_json(&stats)?;
    }
    Command::Read { offline, resource } => {
      let initial = if offline {
        Connectivity::Offline
      } else {
        Connectivity::Online
      };
      let facade = ReadFacade::open(&config, initial).await?;
      read(&facade, resource).await?;
    }
    Command::MirrorStats => {
      let mirror =
        client::MirrorStore::from_config(&config, std::sync::Arc::new(cache::SystemClock)).await?;
      print_json(&mirror.stats()?)?;
    }
    Command::MirrorClear { kind } => {
      let kinds = match kind {
        Some(name) => {
          vec![StoreKind::parse(&name).ok_or_else(|| eyre!("Unknown store kind: {}", name))?]
        }
        None => StoreKind::ALL.to_vec(),
      };
      let mirror =
        client::MirrorStore::from_config(&config, std::sync::Arc::new(cache::SystemClock)).await?;
      let mut cleared = std::collections::BTreeMap::new();
      for kind in kinds {
        cleared.insert(kind, mirror.invalidate_kind(kind)?);
      }
      print_json(&cleared)?;
    }
  }

  Ok(())
}

async fn read(facade: &ReadFacade, resource: Resource) -> Result<()> {
  let request = match resource {
    Resource::Dates => ResourceRequest::Dates,
    Resource::Results { date } => ResourceRequest::Results(parse_date(&date)?),
    Resource::Statistics => ResourceRequest::Statistics,
    Resource::Search { stocks, days } => ResourceRequest::Search(
      SearchQuery::parse(&stocks, days).ok_or_else(|| eyre!("No valid 6-digit stock codes"))?,
    ),
    Resource::Asset { path } => {
      return match facade.arbiter().fetch(&path).await {
        Arbitrated::Network(response) | Arbitrated::Cached { response, .. } => {
          std::io::stdout()
            .write_all(&response.body)
            .map_err(|e| eyre!("Failed to write asset: {}", e))?;
          Ok(())
        }
        Arbitrated::ServiceUnavailable => Err(eyre!("Service unavailable: {}", path)),
        Arbitrated::Failed { reason } => Err(ReadError::NetworkUnavailable(reason).into()),
      };
    }
  };

  match facade.read(&request).await? {
    ReadOutcome::Served(result) => print_json(&json!({
      "source": result.source,
      "cached_at": result.cached_at,
      "stale": result.is_stale(),
      "data": result.data,
    })),
    ReadOutcome::Empty { fetch_failed } => {
      if fetch_failed {
        eprintln!("No data available: could not reach the server and nothing is cached");
      } else {
        eprintln!("No data for this request");
      }
      Ok(())
    }
  }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| eyre!("Invalid date {}: {}", s, e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", text);
  Ok(())
}
