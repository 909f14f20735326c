//! Request coalescing.
//!
//! [`RequestCoordinator`] guarantees at most one outstanding fetch per cache
//! key. The first caller for a key runs the fetcher; every caller that arrives
//! while it is in flight waits on the same outcome.

use color_eyre::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::event::{EventBus, StoreEvent};

type InFlight<T> = Arc<Mutex<HashMap<String, broadcast::Sender<Option<T>>>>>;

pub struct RequestCoordinator<T> {
  in_flight: InFlight<T>,
  events: Option<EventBus>,
}

impl<T: Clone + Send + 'static> RequestCoordinator<T> {
  pub fn new() -> Self {
    Self {
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      events: None,
    }
  }

  /// Publish a `Ready` event on `events` whenever a fetch completes.
  pub fn with_events(mut self, events: EventBus) -> Self {
    self.events = Some(events);
    self
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    self
      .in_flight
      .lock()
      .map(|map| map.contains_key(key))
      .unwrap_or(false)
  }

  /// Resolve `key`, running `fetcher` only if no fetch for `key` is in flight.
  ///
  /// Fetch errors are logged and resolve to `None` for every waiter.
  pub async fn resolve<F, Fut>(&self, key: &str, fetcher: F) -> Option<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
  {
    let waiter = {
      let Ok(mut map) = self.in_flight.lock() else {
        return None;
      };
      match map.get(key) {
        Some(sender) => Some(sender.subscribe()),
        None => {
          let (sender, _) = broadcast::channel(1);
          map.insert(key.to_string(), sender);
          None
        }
      }
    };

    if let Some(mut rx) = waiter {
      debug!(key = %key, "Joining in-flight fetch");
      // A closed channel means the leading fetch was abandoned.
      return rx.recv().await.ok().flatten();
    }

    let guard = InFlightGuard {
      key: key.to_string(),
      in_flight: Arc::clone(&self.in_flight),
      armed: true,
    };

    let result = match fetcher().await {
      Ok(value) => value,
      Err(e) => {
        warn!(key = %key, error = %e, "Fetch failed");
        None
      }
    };

    guard.complete(result.clone());
    if let Some(events) = &self.events {
      events.publish(StoreEvent::Ready {
        key: key.to_string(),
        found: result.is_some(),
      });
    }
    result
  }
}

impl<T: Clone + Send + 'static> Default for RequestCoordinator<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Clears the in-flight mark for a key, even if the leading future is dropped.
struct InFlightGuard<T> {
  key: String,
  in_flight: InFlight<T>,
  armed: bool,
}

impl<T> InFlightGuard<T> {
  fn take_sender(&self) -> Option<broadcast::Sender<Option<T>>> {
    self.in_flight.lock().ok()?.remove(&self.key)
  }

  fn complete(mut self, result: Option<T>) {
    self.armed = false;
    if let Some(sender) = self.take_sender() {
      // No receivers is fine: nobody else was waiting.
      let _ = sender.send(result);
    }
  }
}

impl<T> Drop for InFlightGuard<T> {
  fn drop(&mut self) {
    if self.armed {
      // Dropping the sender releases waiters with `None`.
      drop(self.take_sender());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_concurrent_resolves_fetch_once() {
    let coordinator = Arc::new(RequestCoordinator::<String>::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
      .map(|_| {
        let coordinator = Arc::clone(&coordinator);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
          coordinator
            .resolve("k", || async move {
              calls.fetch_add(1, Ordering::SeqCst);
              tokio::time::sleep(Duration::from_millis(30)).await;
              Ok(Some("value".to_string()))
            })
            .await
        })
      })
      .collect();

    for task in tasks {
      assert_eq!(task.await.unwrap().as_deref(), Some("value"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!coordinator.is_in_flight("k"));
  }

  #[tokio::test]
  async fn test_errors_resolve_to_none_for_all_waiters() {
    let coordinator = Arc::new(RequestCoordinator::<u32>::new());

    let leader = {
      let coordinator = Arc::clone(&coordinator);
      tokio::spawn(async move {
        coordinator
          .resolve("k", || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(eyre!("503 Service Unavailable"))
          })
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let follower = coordinator
      .resolve("k", || async { Ok(Some(1)) })
      .await;

    assert_eq!(follower, None);
    assert_eq!(leader.await.unwrap(), None);

    // The key is free again afterwards.
    assert_eq!(coordinator.resolve("k", || async { Ok(Some(2)) }).await, Some(2));
  }

  #[tokio::test]
  async fn test_abandoned_fetch_releases_waiters() {
    let coordinator = Arc::new(RequestCoordinator::<u32>::new());

    let leader = {
      let coordinator = Arc::clone(&coordinator);
      tokio::spawn(async move {
        coordinator
          .resolve("k", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(1))
          })
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(coordinator.is_in_flight("k"));

    let follower = {
      let coordinator = Arc::clone(&coordinator);
      tokio::spawn(async move { coordinator.resolve("k", || async { Ok(Some(2)) }).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    leader.abort();

    assert_eq!(follower.await.unwrap(), None);
    assert!(!coordinator.is_in_flight("k"));
  }

  #[tokio::test]
  async fn test_ready_event_published_once() {
    let events = EventBus::new();
    let mut rx = events.subscribe("k");
    let coordinator = RequestCoordinator::<u32>::new().with_events(events);

    coordinator.resolve("k", || async { Ok(Some(7)) }).await;
    assert_eq!(
      rx.drain(),
      vec![StoreEvent::Ready {
        key: "k".to_string(),
        found: true
      }]
    );
  }
}
