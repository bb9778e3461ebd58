//! Online/offline state with change notification.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
  Online,
  Offline,
}

/// Shared connectivity value. Components read it directly or subscribe to
/// transitions.
#[derive(Debug)]
pub struct ConnectivityState {
  tx: watch::Sender<Connectivity>,
}

impl ConnectivityState {
  pub fn new(initial: Connectivity) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx }
  }

  pub fn current(&self) -> Connectivity {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current() == Connectivity::Online
  }

  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.tx.subscribe()
  }

  /// Returns true on an offline to online transition.
  pub fn set_online(&self) -> bool {
    let changed = self.set(Connectivity::Online);
    if changed {
      info!("connectivity restored");
    }
    changed
  }

  /// Returns true on an online to offline transition.
  pub fn set_offline(&self) -> bool {
    let changed = self.set(Connectivity::Offline);
    if changed {
      warn!("connectivity lost, switching to offline reads");
    }
    changed
  }

  fn set(&self, next: Connectivity) -> bool {
    self.tx.send_if_modified(|current| {
      if *current == next {
        false
      } else {
        *current = next;
        true
      }
    })
  }
}

impl Default for ConnectivityState {
  fn default() -> Self {
    Self::new(Connectivity::Online)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn subscribers_see_transitions_only() {
    let state = ConnectivityState::default();
    let mut rx = state.subscribe();

    assert!(!state.set_online());
    assert!(!rx.has_changed().unwrap());

    assert!(state.set_offline());
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), Connectivity::Offline);
    assert!(!state.is_online());

    assert!(!state.set_offline());
    assert!(state.set_online());
    assert!(state.is_online());
  }
}
