//! Resource cache.
//!
//! This module provides the in-process store of resolved resources that:
//! - Keys resources by canonical id, with URL aliases for fetch locations
//! - Merges incoming resources into existing entries (stub enrichment)
//! - Cascades container eviction one level down to child containers
//! - Swallows backend failures, treating them as misses

mod store;
mod traits;

pub use store::CacheStore;
pub use traits::{CacheBackend, CacheEntry, MemoryBackend, NoopBackend};
