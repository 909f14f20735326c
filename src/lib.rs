//! Client-side data layer for Linked Data Platform (JSON-LD) servers.
//!
//! A [`Store`] caches resources by id, coalesces concurrent fetches, hands out
//! lazy [`ResourceHandle`]s for path traversal, and keeps dependent resources
//! fresh after writes. [`federated`] adds delta synchronisation of a remote
//! catalogue into the same cache.

pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod federated;
pub mod graph;
pub mod handle;
pub mod polling;
pub mod registry;
pub mod resource;
pub mod store;
pub mod subscription;

pub use client::{Fetcher, HttpFetcher, WriteMethod, WriteResponse};
pub use config::Config;
pub use context::{JsonLdContext, TermResolver};
pub use error::WriteError;
pub use event::{EventBus, StoreEvent};
pub use handle::{PathValue, ResourceHandle};
pub use registry::{StoreRegistry, DEFAULT_STORE_NAME};
pub use resource::Resource;
pub use store::{GetDataOptions, Store, StoreOptions};
