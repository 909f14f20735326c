//! Federated catalogue support.
//!
//! This module materializes a remote self-description catalogue into the
//! store as one container:
//! - Lists remote items on every sync, fetching only new or changed bodies
//! - Keeps a per-collection snapshot of hashes and change timestamps
//! - Falls back to a full fetch when the snapshot is unusable or a delta fails

mod catalog;
mod engine;
mod persist;
mod snapshot;

pub use catalog::{map_item, parse_listing, CatalogSource, HttpCatalogSource};
pub use engine::{DeltaSyncEngine, SyncMode, SyncReport};
pub use persist::{new_session_token, MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
pub use snapshot::{
  dedup_listing, ItemMetadata, ListedItem, SnapshotDiff, SyncSnapshot, SNAPSHOT_VERSION,
};

use chrono::Duration;
use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, FederatedConfig};
use crate::coordinator::RequestCoordinator;
use crate::handle::ResourceHandle;
use crate::store::Store;

/// A store whose collection is filled by delta sync instead of LDP fetches.
pub struct FederatedCatalog {
  store: Store,
  engine: Arc<DeltaSyncEngine>,
  syncs: RequestCoordinator<SyncReport>,
}

impl FederatedCatalog {
  pub fn new(store: Store, engine: DeltaSyncEngine) -> Self {
    let syncs = RequestCoordinator::new().with_events(store.events().clone());
    Self {
      store,
      engine: Arc::new(engine),
      syncs,
    }
  }

  /// Wire up the HTTP catalogue and the SQLite snapshot store from config.
  ///
  /// A missing catalogue token is a configuration error.
  pub fn from_config(store: Store, config: &FederatedConfig) -> Result<Self> {
    let token = Config::get_catalog_token()?;
    let source = HttpCatalogSource::new(&config.endpoint, &token)?;

    let path = match &config.snapshot_path {
      Some(path) => path.clone(),
      None => Config::default_snapshot_path()?,
    };
    let snapshots = SqliteSnapshotStore::open(&path, &new_session_token())?;

    let engine = DeltaSyncEngine::new(source, snapshots, config.collection_id.clone())
      .with_cache_enabled(config.enable_cache)
      .with_ttl(Duration::seconds(config.cache_ttl_secs as i64));
    Ok(Self::new(store, engine))
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn engine(&self) -> &DeltaSyncEngine {
    &self.engine
  }

  /// Sync the collection. Concurrent calls share one sync; failures are
  /// logged and resolve to `None`.
  pub async fn sync(&self, force_full: bool) -> Option<SyncReport> {
    let collection_id = self.engine.collection_id().to_string();
    let engine = Arc::clone(&self.engine);
    let store = self.store.clone();

    let report = self
      .syncs
      .resolve(&collection_id, || async move {
        engine.sync(&store, force_full).await.map(Some)
      })
      .await?;

    info!(
      collection = %collection_id,
      mode = ?report.mode,
      listed = report.listed,
      fetched = report.fetched,
      "Catalogue synced"
    );
    self.store.notify(&[collection_id]);
    Some(report)
  }

  /// The synced collection container.
  pub async fn get_data(&self, force_full: bool) -> Option<ResourceHandle> {
    self.sync(force_full).await?;
    self.store.get(self.engine.collection_id())
  }
}

#[cfg(test)]
mod tests {
  use super::engine::tests::{FakeCatalog, CATALOG};
  use super::*;
  use crate::event::StoreEvent;
  use crate::store::tests::{store_for, FakeServer};
  use futures::future::join_all;
  use std::sync::atomic::Ordering;

  fn catalog_with(items: &[(&str, &str)]) -> (Arc<FakeCatalog>, FederatedCatalog) {
    let source = Arc::new(FakeCatalog::default());
    for (hash, name) in items {
      source.publish(hash, 1, &format!("https://data.example.org/{}", hash), name);
    }
    let store = store_for(&Arc::new(FakeServer::default()));
    let engine = DeltaSyncEngine::new(Arc::clone(&source), MemorySnapshotStore::new(), CATALOG);
    (source, FederatedCatalog::new(store, engine))
  }

  #[tokio::test]
  async fn test_get_data_returns_synced_container() {
    let (_, catalog) = catalog_with(&[("a", "Alpha"), ("b", "Beta")]);
    let mut events = catalog.store().events().subscribe(CATALOG);

    let container = catalog.get_data(false).await.unwrap();
    assert!(container.is_container());
    let mut names = Vec::new();
    for child in container.children() {
      names.push(child.get("name").await.unwrap().as_str().unwrap().to_string());
    }
    assert_eq!(names, vec!["Alpha", "Beta"]);
    assert!(events
      .drain()
      .contains(&StoreEvent::Changed { id: CATALOG.to_string() }));
  }

  #[tokio::test]
  async fn test_concurrent_syncs_share_one_listing() {
    let (source, catalog) = catalog_with(&[("a", "Alpha")]);
    source.delay_ms.store(20, Ordering::SeqCst);
    let reports = join_all((0..4).map(|_| catalog.sync(false))).await;
    assert!(reports.iter().all(|r| r.is_some()));
    assert_eq!(source.list_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failed_full_fetch_resolves_none() {
    let (source, catalog) = catalog_with(&[("a", "Alpha")]);
    source.failing_lists.store(1, Ordering::SeqCst);
    assert!(catalog.sync(false).await.is_none());
    assert_eq!(catalog.sync(false).await.unwrap().mode, SyncMode::Full);
  }
}
