//! Delta synchronisation of a remote catalogue into the store.
//!
//! Every sync lists the remote items. With a valid snapshot only new and
//! changed items have their bodies fetched; otherwise everything is fetched
//! and the container rebuilt. A delta attempt that fails for any reason is
//! discarded and replaced by a full fetch.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::catalog::{map_item, CatalogSource};
use super::persist::SnapshotStore;
use super::snapshot::{dedup_listing, ListedItem, SyncSnapshot};
use crate::resource::{reference_id, LDP_CONTAINS};
use crate::store::Store;

/// How a sync was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  Full,
  Delta,
}

/// Outcome of one sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub mode: SyncMode,
  /// Items in the remote listing
  pub listed: usize,
  /// Item bodies fetched
  pub fetched: usize,
  pub unchanged: usize,
  /// Hashes dropped from the snapshot
  pub deleted: usize,
}

pub struct DeltaSyncEngine {
  source: Arc<dyn CatalogSource>,
  snapshots: Arc<dyn SnapshotStore>,
  collection_id: String,
  enable_cache: bool,
  ttl: Duration,
}

impl DeltaSyncEngine {
  pub fn new(
    source: impl CatalogSource + 'static,
    snapshots: impl SnapshotStore + 'static,
    collection_id: impl Into<String>,
  ) -> Self {
    Self {
      source: Arc::new(source),
      snapshots: Arc::new(snapshots),
      collection_id: collection_id.into(),
      enable_cache: true,
      ttl: Duration::hours(1),
    }
  }

  /// With caching disabled every sync is a full fetch and no snapshot is kept.
  pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
    self.enable_cache = enabled;
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn collection_id(&self) -> &str {
    &self.collection_id
  }

  /// The persisted snapshot, if readable.
  pub fn snapshot(&self) -> Option<SyncSnapshot> {
    match self.snapshots.load(&self.collection_id) {
      Ok(snapshot) => snapshot,
      Err(e) => {
        warn!(collection = %self.collection_id, error = %e, "Failed to load sync snapshot");
        None
      }
    }
  }

  /// The snapshot a delta can be computed against, or `None` when only a
  /// full fetch will do.
  fn delta_base(&self, store: &Store) -> Option<SyncSnapshot> {
    if !self.enable_cache {
      return None;
    }
    let snapshot = self.snapshot()?;
    if snapshot.is_expired(Utc::now()) {
      debug!(collection = %self.collection_id, "Sync snapshot expired");
      return None;
    }
    let materialized = store
      .cache()
      .lookup(&self.collection_id)
      .map(|c| c.is_full())
      .unwrap_or(false);
    if !materialized {
      debug!(collection = %self.collection_id, "No cached container to apply a delta to");
      return None;
    }
    Some(snapshot)
  }

  pub fn should_full_fetch(&self, store: &Store) -> bool {
    self.delta_base(store).is_none()
  }

  /// Bring the cached container up to date with the remote listing.
  pub async fn sync(&self, store: &Store, force_full: bool) -> Result<SyncReport> {
    let base = if force_full { None } else { self.delta_base(store) };
    let Some(snapshot) = base else {
      return self.full_fetch(store).await;
    };

    match self.delta_fetch(store, &snapshot).await {
      Ok(report) => Ok(report),
      Err(e) => {
        warn!(collection = %self.collection_id, error = %e, "Delta sync failed, falling back to full fetch");
        self.full_fetch(store).await
      }
    }
  }

  /// Fetch every item and rebuild the container and the snapshot.
  pub async fn full_fetch(&self, store: &Store) -> Result<SyncReport> {
    let listing = dedup_listing(self.source.list_items().await?);
    let items = self.fetch_mapped(listing.iter()).await?;

    let cache = store.cache();
    if let Some(previous) = cache.lookup(&self.collection_id) {
      for child in previous.children() {
        cache.delete(&child);
      }
    }
    cache.delete(&self.collection_id);

    let container = json!({
      "@id": self.collection_id,
      "@type": "ldp:Container",
      "ldp:contains": items,
    });
    store.ingest(&container)?;

    if self.enable_cache {
      self.save(&SyncSnapshot::from_listing(&listing, self.ttl));
    }

    let report = SyncReport {
      mode: SyncMode::Full,
      listed: listing.len(),
      fetched: items.len(),
      unchanged: 0,
      deleted: 0,
    };
    info!(collection = %self.collection_id, fetched = report.fetched, "Full catalogue fetch");
    Ok(report)
  }

  /// Apply the difference between `snapshot` and a fresh listing.
  ///
  /// Everything that can fail runs before the cache is touched.
  async fn delta_fetch(&self, store: &Store, snapshot: &SyncSnapshot) -> Result<SyncReport> {
    let listing = dedup_listing(self.source.list_items().await?);
    let diff = snapshot.diff(&listing);
    let items = self.fetch_mapped(diff.to_fetch()).await?;

    let cache = store.cache();
    let container = cache
      .lookup(&self.collection_id)
      .ok_or_else(|| eyre!("Container {} left the cache during sync", self.collection_id))?;
    let ids = items
      .iter()
      .map(|item| {
        reference_id(item)
          .map(String::from)
          .ok_or_else(|| eyre!("Mapped catalogue item without @id"))
      })
      .collect::<Result<Vec<_>>>()?;

    let mut refetched: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut members = container.children();
    members.retain(|member| !refetched.contains(member.as_str()));
    for (id, item) in ids.iter().zip(&items) {
      cache.delete(id);
      store.ingest(item)?;
      if refetched.remove(id.as_str()) {
        members.push(id.clone());
      }
    }

    let mut updated = container;
    updated.insert(
      LDP_CONTAINS,
      Value::Array(members.iter().map(|id| json!({ "@id": id })).collect()),
    );
    cache.set(&self.collection_id, updated);

    self.save(&snapshot.advanced(&listing));

    let report = SyncReport {
      mode: SyncMode::Delta,
      listed: listing.len(),
      fetched: items.len(),
      unchanged: diff.unchanged.len(),
      deleted: diff.deleted.len(),
    };
    info!(
      collection = %self.collection_id,
      new = diff.new.len(),
      updated = diff.updated.len(),
      unchanged = report.unchanged,
      deleted = report.deleted,
      "Delta catalogue sync"
    );
    Ok(report)
  }

  async fn fetch_mapped<'a>(&self, items: impl Iterator<Item = &'a ListedItem>) -> Result<Vec<Value>> {
    try_join_all(items.map(|item| async move {
      let body = self.source.fetch_item(&item.hash).await?;
      map_item(&item.hash, &body)
    }))
    .await
  }

  fn save(&self, snapshot: &SyncSnapshot) {
    if let Err(e) = self.snapshots.save(&self.collection_id, snapshot) {
      warn!(collection = %self.collection_id, error = %e, "Failed to save sync snapshot");
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::federated::catalog::tests::presentation;
  use crate::federated::persist::MemorySnapshotStore;
  use crate::federated::snapshot::tests::listed;
  use crate::store::tests::{store_for, FakeServer};
  use async_trait::async_trait;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
  use std::sync::Mutex;

  pub(crate) const CATALOG: &str = "https://fc.example.org/catalog";

  /// In-memory catalogue: serves a listing and bodies by hash, counting calls.
  #[derive(Default)]
  pub(crate) struct FakeCatalog {
    pub listing: Mutex<Vec<ListedItem>>,
    pub bodies: Mutex<HashMap<String, Value>>,
    pub list_calls: AtomicUsize,
    pub fetched: Mutex<Vec<String>>,
    /// Number of upcoming listing calls that fail
    pub failing_lists: AtomicUsize,
    pub delay_ms: AtomicU64,
  }

  impl FakeCatalog {
    pub fn publish(&self, hash: &str, day: u32, id: &str, name: &str) {
      let mut listing = self.listing.lock().unwrap();
      listing.retain(|item| item.hash != hash);
      listing.push(listed(hash, day));
      self
        .bodies
        .lock()
        .unwrap()
        .insert(hash.to_string(), presentation(id, name));
    }

    pub fn retract(&self, hash: &str) {
      self.listing.lock().unwrap().retain(|item| item.hash != hash);
    }

    pub fn fetch_count(&self, hash: &str) -> usize {
      self.fetched.lock().unwrap().iter().filter(|h| *h == hash).count()
    }
  }

  #[async_trait]
  impl CatalogSource for Arc<FakeCatalog> {
    async fn list_items(&self) -> Result<Vec<ListedItem>> {
      self.list_calls.fetch_add(1, Ordering::SeqCst);
      let delay = self.delay_ms.load(Ordering::SeqCst);
      if delay > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
      }
      let failing = self.failing_lists.load(Ordering::SeqCst);
      if failing > 0 {
        self.failing_lists.store(failing - 1, Ordering::SeqCst);
        return Err(eyre!("503 Service Unavailable"));
      }
      Ok(self.listing.lock().unwrap().clone())
    }

    async fn fetch_item(&self, hash: &str) -> Result<Value> {
      self.fetched.lock().unwrap().push(hash.to_string());
      self
        .bodies
        .lock()
        .unwrap()
        .get(hash)
        .cloned()
        .ok_or_else(|| eyre!("404 {}", hash))
    }
  }

  fn setup() -> (Arc<FakeCatalog>, Store, DeltaSyncEngine) {
    let catalog = Arc::new(FakeCatalog::default());
    let store = store_for(&Arc::new(FakeServer::default()));
    let engine = DeltaSyncEngine::new(Arc::clone(&catalog), MemorySnapshotStore::new(), CATALOG);
    (catalog, store, engine)
  }

  fn members(store: &Store) -> Vec<String> {
    store
      .cache()
      .get(CATALOG)
      .map(|c| c.children())
      .unwrap_or_default()
  }

  async fn name_of(store: &Store, id: &str) -> Option<String> {
    store.get(id)?.get("name").await?.as_str().map(String::from)
  }

  #[tokio::test]
  async fn test_first_sync_is_a_full_fetch() {
    let (catalog, store, engine) = setup();
    catalog.publish("h1", 1, "https://data.example.org/1", "One");
    catalog.publish("h2", 1, "https://data.example.org/2", "Two");
    catalog.publish("h3", 1, "https://data.example.org/3", "Three");
    assert!(engine.should_full_fetch(&store));

    let report = engine.sync(&store, false).await.unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.fetched, 3);
    assert_eq!(catalog.list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(catalog.fetched.lock().unwrap().len(), 3);

    let snapshot = engine.snapshot().unwrap();
    assert_eq!(snapshot.items.keys().collect::<Vec<_>>(), vec!["h1", "h2", "h3"]);
    assert!(snapshot.expires_at > Utc::now());
    assert_eq!(members(&store).len(), 3);
    assert_eq!(name_of(&store, "https://data.example.org/2").await.as_deref(), Some("Two"));
    assert!(!engine.should_full_fetch(&store));
  }

  #[tokio::test]
  async fn test_new_item_fetches_only_its_body() {
    let (catalog, store, engine) = setup();
    catalog.publish("hash-existing", 1, "https://data.example.org/old", "Existing");
    engine.sync(&store, false).await.unwrap();

    catalog.publish("hash-new", 2, "https://data.example.org/new", "New");
    let report = engine.sync(&store, false).await.unwrap();

    assert_eq!(report.mode, SyncMode::Delta);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(catalog.fetch_count("hash-existing"), 1);
    assert_eq!(catalog.fetch_count("hash-new"), 1);
    assert_eq!(
      members(&store),
      vec!["https://data.example.org/old", "https://data.example.org/new"]
    );
  }

  #[tokio::test]
  async fn test_updated_item_replaces_its_entry() {
    let (catalog, store, engine) = setup();
    catalog.publish("hash-1", 1, "https://data.example.org/1", "Old");
    engine.sync(&store, false).await.unwrap();

    catalog.publish("hash-1", 2, "https://data.example.org/1", "New");
    let report = engine.sync(&store, false).await.unwrap();

    assert_eq!(report.mode, SyncMode::Delta);
    assert_eq!(catalog.fetch_count("hash-1"), 2);
    assert_eq!(members(&store), vec!["https://data.example.org/1"]);
    assert_eq!(name_of(&store, "https://data.example.org/1").await.as_deref(), Some("New"));
    let snapshot = engine.snapshot().unwrap();
    assert_eq!(snapshot.items["hash-1"].first_change, listed("hash-1", 2).first_change);
  }

  #[tokio::test]
  async fn test_deleted_items_leave_snapshot_but_stay_in_container() {
    let (catalog, store, engine) = setup();
    catalog.publish("a", 1, "https://data.example.org/a", "A");
    catalog.publish("b", 1, "https://data.example.org/b", "B");
    catalog.publish("c", 1, "https://data.example.org/c", "C");
    engine.sync(&store, false).await.unwrap();

    catalog.retract("b");
    catalog.retract("c");
    let report = engine.sync(&store, false).await.unwrap();

    assert_eq!(report.mode, SyncMode::Delta);
    assert_eq!(report.fetched, 0);
    assert_eq!(report.deleted, 2);
    assert_eq!(engine.snapshot().unwrap().items.keys().collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(members(&store).len(), 3);
  }

  #[tokio::test]
  async fn test_repeated_listing_entries_fetch_once() {
    let (catalog, store, engine) = setup();
    catalog.publish("a", 1, "https://data.example.org/a", "A");
    catalog.listing.lock().unwrap().push(listed("a", 1));
    let report = engine.sync(&store, false).await.unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.listed, 1);
    assert_eq!(catalog.fetch_count("a"), 1);
    assert_eq!(members(&store), vec!["https://data.example.org/a"]);

    catalog.publish("b", 2, "https://data.example.org/b", "B");
    catalog.listing.lock().unwrap().push(listed("b", 2));
    let report = engine.sync(&store, false).await.unwrap();
    assert_eq!(report.mode, SyncMode::Delta);
    assert_eq!(report.fetched, 1);
    assert_eq!(catalog.fetch_count("b"), 1);
    assert_eq!(
      members(&store),
      vec!["https://data.example.org/a", "https://data.example.org/b"]
    );
  }

  #[tokio::test]
  async fn test_failed_listing_falls_back_to_full_fetch() {
    let (catalog, store, engine) = setup();
    catalog.publish("a", 1, "https://data.example.org/a", "A");
    engine.sync(&store, false).await.unwrap();

    catalog.publish("b", 2, "https://data.example.org/b", "B");
    catalog.failing_lists.store(1, Ordering::SeqCst);
    let report = engine.sync(&store, false).await.unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(catalog.list_calls.load(Ordering::SeqCst), 3);

    // Same listing, fresh store: the containers match.
    let fresh_store = store_for(&Arc::new(FakeServer::default()));
    let fresh_engine = DeltaSyncEngine::new(Arc::clone(&catalog), MemorySnapshotStore::new(), CATALOG);
    fresh_engine.sync(&fresh_store, false).await.unwrap();
    assert_eq!(members(&store), members(&fresh_store));
  }

  #[tokio::test]
  async fn test_malformed_body_leaves_state_untouched() {
    let (catalog, store, engine) = setup();
    catalog.publish("a", 1, "https://data.example.org/a", "A");
    engine.sync(&store, false).await.unwrap();
    let before = engine.snapshot().unwrap();

    catalog.listing.lock().unwrap().push(listed("broken", 2));
    catalog
      .bodies
      .lock()
      .unwrap()
      .insert("broken".to_string(), json!({ "verifiableCredential": {} }));

    assert!(engine.sync(&store, false).await.is_err());
    assert_eq!(engine.snapshot(), Some(before));
    assert_eq!(members(&store), vec!["https://data.example.org/a"]);
  }

  #[tokio::test]
  async fn test_disabled_or_expired_cache_always_fetches_everything() {
    let catalog = Arc::new(FakeCatalog::default());
    catalog.publish("a", 1, "https://data.example.org/a", "A");
    let store = store_for(&Arc::new(FakeServer::default()));

    let disabled = DeltaSyncEngine::new(Arc::clone(&catalog), MemorySnapshotStore::new(), CATALOG)
      .with_cache_enabled(false);
    disabled.sync(&store, false).await.unwrap();
    assert_eq!(disabled.sync(&store, false).await.unwrap().mode, SyncMode::Full);
    assert!(disabled.snapshot().is_none());

    let expired = DeltaSyncEngine::new(Arc::clone(&catalog), MemorySnapshotStore::new(), CATALOG)
      .with_ttl(Duration::zero());
    expired.sync(&store, false).await.unwrap();
    assert!(expired.snapshot().is_some());
    assert_eq!(expired.sync(&store, false).await.unwrap().mode, SyncMode::Full);
  }

  #[tokio::test]
  async fn test_missing_container_forces_full_fetch() {
    let (catalog, store, engine) = setup();
    catalog.publish("a", 1, "https://data.example.org/a", "A");
    engine.sync(&store, false).await.unwrap();

    store.clear_cache(CATALOG);
    assert!(engine.should_full_fetch(&store));
    assert_eq!(engine.sync(&store, false).await.unwrap().mode, SyncMode::Full);
    assert_eq!(engine.sync(&store, true).await.unwrap().mode, SyncMode::Full);
  }
}
