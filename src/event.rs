use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Store events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  /// A coalesced fetch for `key` completed
  Ready { key: String, found: bool },
  /// The resource `id` changed and should be re-read
  Changed { id: String },
}

impl StoreEvent {
  pub fn id(&self) -> &str {
    match self {
      StoreEvent::Ready { key, .. } => key,
      StoreEvent::Changed { id } => id,
    }
  }
}

struct Subscriber {
  /// Only events for this id are delivered; `None` receives everything
  filter: Option<String>,
  tx: mpsc::UnboundedSender<StoreEvent>,
}

/// Event bus that fans store events out to any number of receivers.
///
/// Each receiver owns an unbounded queue, so no event is dropped for a live
/// receiver. Dropping the receiver unsubscribes it.
#[derive(Clone, Default)]
pub struct EventBus {
  subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Deliver `event` to every matching receiver
  pub fn publish(&self, event: StoreEvent) {
    let Ok(mut subscribers) = self.subscribers.lock() else {
      return;
    };
    subscribers.retain(|sub| {
      if sub.tx.is_closed() {
        return false;
      }
      if let Some(filter) = &sub.filter {
        if filter != event.id() {
          return true;
        }
      }
      sub.tx.send(event.clone()).is_ok()
    });
  }

  /// Receive events concerning `id`
  pub fn subscribe(&self, id: &str) -> EventReceiver {
    self.add(Some(id.to_string()))
  }

  /// Receive every event
  pub fn subscribe_all(&self) -> EventReceiver {
    self.add(None)
  }

  /// Run `handler` for each event concerning `id` until the returned
  /// listener is unsubscribed or dropped.
  pub fn listen<F>(&self, id: &str, mut handler: F) -> Listener
  where
    F: FnMut(StoreEvent) + Send + 'static,
  {
    let mut rx = self.subscribe(id);
    let task = tokio::spawn(async move {
      while let Some(event) = rx.next().await {
        handler(event);
      }
    });
    Listener { task }
  }

  fn add(&self, filter: Option<String>) -> EventReceiver {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.push(Subscriber { filter, tx });
    }
    EventReceiver { rx }
  }

  #[cfg(test)]
  fn subscriber_count(&self) -> usize {
    self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
  }
}

/// Receiving end of a bus subscription
pub struct EventReceiver {
  rx: mpsc::UnboundedReceiver<StoreEvent>,
}

impl EventReceiver {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<StoreEvent> {
    self.rx.recv().await
  }

  /// Receive an already queued event without waiting
  pub fn try_next(&mut self) -> Option<StoreEvent> {
    self.rx.try_recv().ok()
  }

  /// Drain every queued event
  pub fn drain(&mut self) -> Vec<StoreEvent> {
    std::iter::from_fn(|| self.try_next()).collect()
  }
}

/// Handler-based subscription created by [`EventBus::listen`]
pub struct Listener {
  task: JoinHandle<()>,
}

impl Listener {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Listener {
  fn drop(&mut self) {
    self.task.abort();
  }
}
