//! Client side: local mirror, connectivity, request arbitration and the read facade.

mod arbiter;
mod connectivity;
mod facade;
mod mirror;
mod transport;

pub use arbiter::{Arbitrated, RequestArbiter};
pub use connectivity::{Connectivity, ConnectivityState};
pub use facade::{ReadFacade, ReadOutcome, ResourceRequest};
pub use mirror::MirrorStore;
pub use transport::HttpTransport;

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::SystemClock;
use crate::config::Config;

impl ReadFacade {
  /// Build the client stack from config and start the background tasks:
  /// the reconnect refresh and, while offline, periodic reachability checks.
  pub async fn open(config: &Config, initial: Connectivity) -> Result<Arc<Self>> {
    let mirror = Arc::new(MirrorStore::from_config(config, Arc::new(SystemClock)).await?);
    let arbiter = Arc::new(RequestArbiter::new(
      Arc::new(HttpTransport::new(&config.client)?),
      Arc::new(ConnectivityState::new(initial)),
      Arc::clone(&mirror),
    ));
    if config.client.reachability_check_secs > 0 {
      let every = Duration::from_secs(config.client.reachability_check_secs);
      arbiter.spawn_reachability_checks(every);
    }

    let facade = Arc::new(Self::new(
      mirror,
      arbiter,
      config.client.prefer_mirror_for_today,
    ));
    facade.spawn_reconnect_refresh();
    Ok(facade)
  }
}
