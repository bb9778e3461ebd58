//! Per-key in-flight markers.
//!
//! Callers take the marker for a key before running an upstream fetch and
//! re-check the cache once they hold it, so N concurrent misses for the same
//! key produce one fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct SingleFlight {
  inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a fetch for `key` is in progress.
pub struct FlightGuard<'a> {
  flight: &'a SingleFlight,
  key: String,
  marker: Arc<AsyncMutex<()>>,
  _held: OwnedMutexGuard<()>,
}

impl SingleFlight {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait until no other caller holds `key`, then hold it.
  pub async fn acquire(&self, key: &str) -> FlightGuard<'_> {
    let marker = {
      let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
      Arc::clone(inflight.entry(key.to_string()).or_default())
    };

    let held = Arc::clone(&marker).lock_owned().await;

    FlightGuard {
      flight: self,
      key: key.to_string(),
      marker,
      _held: held,
    }
  }

  /// Number of keys with a fetch in progress or waiters queued.
  #[cfg(test)]
  pub fn in_flight(&self) -> usize {
    self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
  }
}

impl Drop for FlightGuard<'_> {
  fn drop(&mut self) {
    let mut inflight = self
      .flight
      .inflight
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    // map entry, our handle and the held lock; any other clone is a waiter
    if Arc::strong_count(&self.marker) <= 3 {
      inflight.remove(&self.key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn same_key_is_serialized() {
    let flight = Arc::new(SingleFlight::new());
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
      .map(|_| {
        let flight = Arc::clone(&flight);
        let active = Arc::clone(&active);
        let max_seen = Arc::clone(&max_seen);
        tokio::spawn(async move {
          let _guard = flight.acquire("statistics").await;
          let now = active.fetch_add(1, Ordering::SeqCst) + 1;
          max_seen.fetch_max(now, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(2)).await;
          active.fetch_sub(1, Ordering::SeqCst);
        })
      })
      .collect();

    for task in tasks {
      task.await.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(flight.in_flight(), 0);
  }

  #[tokio::test]
  async fn different_keys_do_not_block() {
    let flight = SingleFlight::new();
    let _a = flight.acquire("a").await;
    let b = tokio::time::timeout(Duration::from_millis(100), flight.acquire("b")).await;
    assert!(b.is_ok());
  }
}
