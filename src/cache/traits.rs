//! Cache backend trait and the in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::resource::Resource;

/// A single cached resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub resource: Resource,
  /// URL the resource was fetched from, when it differs from its id
  pub url: Option<String>,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(resource: Resource) -> Self {
    Self {
      resource,
      url: None,
      cached_at: Utc::now(),
    }
  }
}

/// Trait for pluggable cache backends.
///
/// Backends may fail; [`CacheStore`](super::CacheStore) is responsible for
/// downgrading those failures to misses.
pub trait CacheBackend: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

  fn put(&self, key: &str, entry: CacheEntry) -> Result<()>;

  fn remove(&self, key: &str) -> Result<Option<CacheEntry>>;

  fn contains(&self, key: &str) -> Result<bool>;

  fn len(&self) -> Result<usize>;

  fn clear(&self) -> Result<()>;
}

/// Backend that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopBackend;

impl CacheBackend for NoopBackend {
  fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _entry: CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None)
  }

  fn contains(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn len(&self) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// HashMap-backed cache, the default backend.
#[derive(Default)]
pub struct MemoryBackend {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
    self.lock()?.insert(key.to_string(), entry);
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<Option<CacheEntry>> {
    Ok(self.lock()?.remove(key))
  }

  fn contains(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.contains_key(key))
  }

  fn len(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }

  fn clear(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }
}
