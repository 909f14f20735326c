//! Cache store over a pluggable backend.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use super::traits::{CacheBackend, CacheEntry, MemoryBackend};
use crate::resource::{is_local_id, Resource};

/// Key/value store of resolved resources.
///
/// Every public operation is infallible: backend errors are logged and
/// treated as a miss (reads) or a no-op (writes).
pub struct CacheStore {
  backend: Box<dyn CacheBackend>,
  /// Held across read-merge-write so overlapping writes to one key both land
  writes: Mutex<()>,
  /// URL -> canonical id
  aliases: Mutex<HashMap<String, String>>,
  /// Expanded type IRIs that mark a resource as a container
  container_types: Vec<String>,
  /// How long before an entry is considered stale; `None` never expires
  stale_after: Option<Duration>,
}

impl CacheStore {
  pub fn new(backend: impl CacheBackend + 'static) -> Self {
    Self {
      backend: Box::new(backend),
      writes: Mutex::new(()),
      aliases: Mutex::new(HashMap::new()),
      container_types: Vec::new(),
      stale_after: None,
    }
  }

  pub fn in_memory() -> Self {
    Self::new(MemoryBackend::new())
  }

  /// Set the (expanded) container types used for cascading deletes.
  pub fn with_container_types(mut self, types: Vec<String>) -> Self {
    self.container_types = types;
    self
  }

  /// Set the stale time for cached entries.
  pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
    self.stale_after = stale_after;
    self
  }

  pub fn container_types(&self) -> &[String] {
    &self.container_types
  }

  /// Exact-key lookup.
  pub fn get(&self, key: &str) -> Option<Resource> {
    self.get_entry(key).map(|entry| entry.resource)
  }

  pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
    match self.backend.get(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
        None
      }
    }
  }

  /// Resolve a fetch URL to its recorded id, then look the id up.
  pub fn get_by_url(&self, url: &str) -> Option<Resource> {
    let id = self.alias(url)?;
    self.get(&id)
  }

  /// Exact key first, then URL alias.
  pub fn lookup(&self, key: &str) -> Option<Resource> {
    self.get(key).or_else(|| self.get_by_url(key))
  }

  /// Insert `resource` under `key`, merging into any existing entry.
  pub fn set(&self, key: &str, resource: Resource) {
    let _write = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
    let entry = match self.get_entry(key) {
      Some(mut existing) => {
        existing.resource.merge_from(&resource);
        existing.cached_at = Utc::now();
        existing
      }
      None => CacheEntry::new(resource),
    };
    if let Err(e) = self.backend.put(key, entry) {
      warn!(key = %key, error = %e, "Cache write failed");
    }
  }

  /// Record that `url` serves the resource `id`.
  ///
  /// No-op when `url` already is the canonical id or is not a URL.
  pub fn link_url_with_id(&self, url: &str, id: &str) {
    if url == id || is_local_id(url) || !looks_like_url(url) {
      return;
    }
    if let Ok(mut aliases) = self.aliases.lock() {
      aliases.insert(url.to_string(), id.to_string());
    }
    let _write = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(mut entry) = self.get_entry(id) {
      entry.url = Some(url.to_string());
      if let Err(e) = self.backend.put(id, entry) {
        warn!(key = %id, error = %e, "Cache write failed");
      }
    }
    debug!(url = %url, id = %id, "Linked URL to id");
  }

  fn alias(&self, url: &str) -> Option<String> {
    self.aliases.lock().ok()?.get(url).cloned()
  }

  pub fn has(&self, key: &str) -> bool {
    match self.backend.contains(key) {
      Ok(found) => found,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
        false
      }
    }
  }

  /// Evict `key`. Child containers of an evicted container are evicted too,
  /// one level deep. Returns whether anything was removed.
  pub fn delete(&self, key: &str) -> bool {
    let removed = match self.backend.remove(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache delete failed");
        None
      }
    };
    if let Ok(mut aliases) = self.aliases.lock() {
      aliases.retain(|url, id| url != key && id != key);
    }

    let Some(entry) = removed else {
      return false;
    };

    if self.is_container(&entry.resource) {
      for child in entry.resource.children() {
        let child_is_container = self
          .get(&child)
          .map(|r| self.is_container(&r))
          .unwrap_or(false);
        if child_is_container {
          debug!(parent = %key, child = %child, "Evicting child container");
          if let Err(e) = self.backend.remove(&child) {
            warn!(key = %child, error = %e, "Cache delete failed");
          }
        }
      }
    }
    true
  }

  pub fn len(&self) -> usize {
    self.backend.len().unwrap_or_else(|e| {
      warn!(error = %e, "Cache length failed");
      0
    })
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn clear(&self) {
    if let Err(e) = self.backend.clear() {
      warn!(error = %e, "Cache clear failed");
    }
    if let Ok(mut aliases) = self.aliases.lock() {
      aliases.clear();
    }
  }

  pub fn is_container(&self, resource: &Resource) -> bool {
    resource
      .types()
      .iter()
      .any(|t| self.container_types.iter().any(|c| c == t))
  }

  /// Check if a cached entry is stale based on its cached_at timestamp.
  pub fn is_stale(&self, entry: &CacheEntry) -> bool {
    is_stale_at(entry.cached_at, self.stale_after, Utc::now())
  }
}

fn is_stale_at(cached_at: DateTime<Utc>, stale_after: Option<Duration>, now: DateTime<Utc>) -> bool {
  match stale_after {
    Some(limit) => now - cached_at > limit,
    None => false,
  }
}

fn looks_like_url(value: &str) -> bool {
  value.contains("://") || value.starts_with('/') || value.starts_with("./") || value.starts_with("../")
}
