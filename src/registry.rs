//! Named store instances.
//!
//! Applications that talk to several backends register one [`Store`] per
//! backend. Lookups for an unknown name fall back to the default store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::store::Store;

pub const DEFAULT_STORE_NAME: &str = "default";

#[derive(Clone, Default)]
pub struct StoreRegistry {
  stores: Arc<RwLock<HashMap<String, Store>>>,
}

impl StoreRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `store` under `name`, replacing any previous one.
  pub fn register(&self, name: &str, store: Store) {
    if let Ok(mut stores) = self.stores.write() {
      if stores.insert(name.to_string(), store).is_some() {
        debug!(name = %name, "Replaced registered store");
      }
    }
  }

  /// The store named `name`, or the default store when there is none.
  pub fn get(&self, name: &str) -> Option<Store> {
    let stores = self.stores.read().ok()?;
    stores
      .get(name)
      .or_else(|| stores.get(DEFAULT_STORE_NAME))
      .cloned()
  }

  pub fn default_store(&self) -> Option<Store> {
    self.get(DEFAULT_STORE_NAME)
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .stores
      .read()
      .map(|s| s.keys().cloned().collect())
      .unwrap_or_default();
    names.sort();
    names
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::tests::{store_for, FakeServer};
  use crate::store::GetDataOptions;
  use serde_json::json;

  #[tokio::test]
  async fn test_named_stores_are_isolated() {
    let main = Arc::new(FakeServer::with(vec![("a", json!({ "@id": "a", "name": "main" }))]));
    let other = Arc::new(FakeServer::with(vec![("a", json!({ "@id": "a", "name": "other" }))]));

    let registry = StoreRegistry::new();
    registry.register(DEFAULT_STORE_NAME, store_for(&main));
    registry.register("catalogue", store_for(&other));

    let from_other = registry
      .get("catalogue")
      .unwrap()
      .get_data("a", GetDataOptions::default())
      .await
      .unwrap();
    assert_eq!(from_other.get("name").await.unwrap().as_str(), Some("other"));
    assert!(registry.default_store().unwrap().get("a").is_none());
    assert_eq!(registry.names(), vec!["catalogue", "default"]);
  }

  #[test]
  fn test_unknown_name_falls_back_to_default() {
    let registry = StoreRegistry::new();
    assert!(registry.get("anything").is_none());

    let server = Arc::new(FakeServer::default());
    let store = store_for(&server);
    store.ensure_stub("marker");
    registry.register(DEFAULT_STORE_NAME, store);

    assert!(registry.get("anything").unwrap().get("marker").is_some());
  }
}
