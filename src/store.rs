//! The store: top-level entry point of the data layer.
//!
//! Reads go cache-first through the [`RequestCoordinator`]; writes go to the
//! server and then run the invalidation sequence: evict and re-fetch the
//! written resource, refresh everything that depends on it, and only then
//! publish change notifications.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::cache::{CacheBackend, CacheStore, MemoryBackend};
use crate::client::{Fetcher, HttpFetcher, WriteMethod, WriteResponse};
use crate::config::Config;
use crate::context::{base_context, JsonLdContext, TermResolver, DEFAULT_CONTAINER_TYPES};
use crate::coordinator::RequestCoordinator;
use crate::event::{EventBus, StoreEvent};
use crate::graph::{expand_node, flatten};
use crate::handle::{ResourceHandle, DEFAULT_LOCALE};
use crate::resource::{is_local_id, reference_id, values_of, Resource};
use crate::subscription::SubscriptionGraph;

/// Construction options for a [`Store`].
#[derive(Clone)]
pub struct StoreOptions {
  pub locale: String,
  /// Container types, compact or expanded
  pub container_types: Vec<String>,
  pub stale_after: Option<Duration>,
  /// Client context every request starts from
  pub context: JsonLdContext,
  /// Term resolver for handles and container types; `None` resolves with
  /// the JSON-LD contexts
  pub resolver: Option<Arc<dyn TermResolver>>,
}

impl StoreOptions {
  pub fn with_resolver(mut self, resolver: impl TermResolver + 'static) -> Self {
    self.resolver = Some(Arc::new(resolver));
    self
  }
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      locale: DEFAULT_LOCALE.to_string(),
      container_types: DEFAULT_CONTAINER_TYPES.iter().map(|t| t.to_string()).collect(),
      stale_after: None,
      context: base_context(),
      resolver: None,
    }
  }
}

impl fmt::Debug for StoreOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StoreOptions")
      .field("locale", &self.locale)
      .field("container_types", &self.container_types)
      .field("stale_after", &self.stale_after)
      .field("context", &self.context)
      .field("resolver", &self.resolver.is_some())
      .finish()
  }
}

/// Server-side pagination of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
  pub limit: u32,
  pub offset: u32,
}

/// Options for [`Store::get_data`].
#[derive(Debug, Clone, Default)]
pub struct GetDataOptions {
  /// Extra `@context` layered over the store context for this request
  pub context: Option<Value>,
  pub parent_id: Option<String>,
  /// Data for local ids, used instead of a fetch
  pub local_data: Option<Value>,
  /// Skip the cache-first short-circuit
  pub force_fetch: bool,
  pub page: Option<Page>,
  /// `(field, value)` server-side search filters
  pub search: Vec<(String, String)>,
}

impl GetDataOptions {
  pub fn force() -> Self {
    Self {
      force_fetch: true,
      ..Self::default()
    }
  }

  pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
    self.parent_id = Some(parent_id.into());
    self
  }

  pub fn with_context(mut self, context: Value) -> Self {
    self.context = Some(context);
    self
  }

  pub fn with_local_data(mut self, data: Value) -> Self {
    self.local_data = Some(data);
    self
  }

  pub fn with_page(mut self, limit: u32, offset: u32) -> Self {
    self.page = Some(Page { limit, offset });
    self
  }

  pub fn with_search(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.search.push((field.into(), value.into()));
    self
  }
}

/// Cache key of `id` under the pagination/search variant in `options`.
pub fn cache_key(id: &str, options: &GetDataOptions) -> String {
  if options.page.is_none() && options.search.is_empty() {
    return id.to_string();
  }

  let mut query = form_urlencoded::Serializer::new(String::new());
  if let Some(page) = options.page {
    query.append_pair("limit", &page.limit.to_string());
    query.append_pair("offset", &page.offset.to_string());
  }
  for (field, value) in &options.search {
    query.append_pair("search-fields", field);
    query.append_pair("search-value", value);
  }
  let separator = if id.contains('?') { '&' } else { '?' };
  format!("{}{}{}", id, separator, query.finish())
}

struct StoreInner {
  cache: CacheStore,
  coordinator: RequestCoordinator<Resource>,
  subscriptions: SubscriptionGraph,
  events: EventBus,
  fetcher: Arc<dyn Fetcher>,
  context: Arc<JsonLdContext>,
  resolver: Option<Arc<dyn TermResolver>>,
  /// Context each fetched document was expanded with, by root id
  server_contexts: Mutex<HashMap<String, JsonLdContext>>,
  locale: String,
}

/// Client-side data layer over one backend.
///
/// Cloning is cheap and shares all state. Separate `Store` values built with
/// `new` never share caches, subscriptions or events.
#[derive(Clone)]
pub struct Store {
  inner: Arc<StoreInner>,
}

impl Store {
  pub fn new(fetcher: impl Fetcher + 'static, options: StoreOptions) -> Self {
    Self::with_backend(fetcher, MemoryBackend::new(), options)
  }

  pub fn with_backend(
    fetcher: impl Fetcher + 'static,
    backend: impl CacheBackend + 'static,
    options: StoreOptions,
  ) -> Self {
    let container_types = options
      .container_types
      .iter()
      .map(|t| match &options.resolver {
        Some(resolver) => resolver.expand(t),
        None => options.context.expand(t),
      })
      .collect();
    let cache = CacheStore::new(backend)
      .with_container_types(container_types)
      .with_stale_after(options.stale_after);
    let events = EventBus::new();

    Self {
      inner: Arc::new(StoreInner {
        cache,
        coordinator: RequestCoordinator::new().with_events(events.clone()),
        subscriptions: SubscriptionGraph::new(),
        events,
        fetcher: Arc::new(fetcher),
        context: Arc::new(options.context),
        resolver: options.resolver,
        server_contexts: Mutex::new(HashMap::new()),
        locale: options.locale,
      }),
    }
  }

  /// Build a store talking HTTP to the configured endpoint.
  pub fn from_config(config: &Config) -> Result<Self> {
    let token = Config::get_api_token();
    let fetcher = HttpFetcher::new(config.endpoint.as_deref(), token.as_deref())?;

    let mut options = StoreOptions {
      locale: config.locale.clone(),
      stale_after: config
        .cache
        .stale_after_secs
        .map(|s| Duration::seconds(s as i64)),
      ..StoreOptions::default()
    };
    if !config.container_types.is_empty() {
      options.container_types = config.container_types.clone();
    }
    Ok(Self::new(fetcher, options))
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn events(&self) -> &EventBus {
    &self.inner.events
  }

  pub fn subscriptions(&self) -> &SubscriptionGraph {
    &self.inner.subscriptions
  }

  pub fn context(&self) -> &JsonLdContext {
    &self.inner.context
  }

  /// The injected term resolver, when one replaces the JSON-LD contexts.
  pub fn resolver(&self) -> Option<&dyn TermResolver> {
    self.inner.resolver.as_deref()
  }

  pub fn locale(&self) -> &str {
    &self.inner.locale
  }

  pub fn server_context(&self, id: &str) -> Option<JsonLdContext> {
    self.inner.server_contexts.lock().ok()?.get(id).cloned()
  }

  fn client_context(&self, extra: Option<&Value>) -> Arc<JsonLdContext> {
    match extra {
      Some(extra) => Arc::new(self.inner.context.merged_with_value(extra)),
      None => Arc::clone(&self.inner.context),
    }
  }

  pub(crate) fn handle(
    &self,
    id: &str,
    context: Arc<JsonLdContext>,
    parent_id: Option<String>,
  ) -> ResourceHandle {
    ResourceHandle::new(id.to_string(), self.clone(), context, parent_id)
  }

  /// Primary read entry point.
  ///
  /// Returns the cached resource when it is full, fresh and not being
  /// fetched; otherwise joins or starts the single fetch for its cache key.
  /// Failures resolve to `None`.
  pub async fn get_data(&self, id: &str, options: GetDataOptions) -> Option<ResourceHandle> {
    let context = self.client_context(options.context.as_ref());
    self.get_data_in(id, options, context).await
  }

  pub(crate) async fn get_data_in(
    &self,
    id: &str,
    options: GetDataOptions,
    context: Arc<JsonLdContext>,
  ) -> Option<ResourceHandle> {
    let key = cache_key(id, &options);
    let parent_id = options.parent_id.clone();

    if is_local_id(id) {
      if let Some(data) = &options.local_data {
        if let Err(e) = self.cache_local(data, &key, &context) {
          warn!(id = %id, error = %e, "Ignoring invalid local data");
        }
      }
      return self
        .inner
        .cache
        .lookup(&key)
        .map(|r| self.handle(r.id(), context, parent_id));
    }

    if !options.force_fetch && !self.inner.coordinator.is_in_flight(&key) {
      if let Some(hit) = self.cached_full(&key) {
        return Some(self.handle(&hit, context, parent_id));
      }
    }

    let store = self.clone();
    let fetch_key = key.clone();
    let fetch_context = Arc::clone(&context);
    let resource = self
      .inner
      .coordinator
      .resolve(&key, || async move {
        store.fetch_into_cache(&fetch_key, &fetch_context).await
      })
      .await?;
    Some(self.handle(resource.id(), context, parent_id))
  }

  /// Id of the cached, full and fresh resource behind `key`, if any.
  fn cached_full(&self, key: &str) -> Option<String> {
    let cache = &self.inner.cache;
    let entry = cache
      .get_entry(key)
      .or_else(|| cache.get_by_url(key).and_then(|r| cache.get_entry(r.id())))?;
    if entry.resource.is_full() && !cache.is_stale(&entry) {
      Some(entry.resource.id().to_string())
    } else {
      None
    }
  }

  async fn fetch_into_cache(&self, key: &str, context: &JsonLdContext) -> Result<Option<Resource>> {
    let Some(document) = self.inner.fetcher.fetch(key).await? else {
      debug!(key = %key, "Server returned no document");
      return Ok(None);
    };
    let id = self.ingest_document(&document, Some(key), context)?;
    Ok(id.and_then(|id| self.inner.cache.get(&id)))
  }

  /// Flatten a JSON-LD document into the cache using the store context.
  /// Returns the id the document's root was cached under.
  pub fn ingest(&self, document: &Value) -> Result<Option<String>> {
    let context = Arc::clone(&self.inner.context);
    self.ingest_document(document, None, &context)
  }

  fn ingest_document(
    &self,
    document: &Value,
    key: Option<&str>,
    context: &JsonLdContext,
  ) -> Result<Option<String>> {
    let graph = flatten(document, context)?;
    let Some(root_id) = graph.root_id.clone() else {
      return Ok(None);
    };
    let cache = &self.inner.cache;

    // Pagination/search variants are distinct entries and must not
    // overwrite the canonical container.
    let variant = key.filter(|k| *k != root_id && k.contains('?') && !root_id.contains('?'));

    for resource in &graph.resources {
      if variant.is_some() && resource.id() == root_id {
        continue;
      }
      cache.set(resource.id(), resource.clone());
    }

    let cache_id = match variant {
      Some(variant) => {
        let root = graph
          .root()
          .cloned()
          .unwrap_or_else(|| Resource::stub(&root_id));
        cache.set(variant, root.with_id(variant));
        variant.to_string()
      }
      None => {
        if !cache.has(&root_id) {
          cache.set(&root_id, Resource::stub(&root_id));
        }
        if let Some(key) = key {
          cache.link_url_with_id(key, &root_id);
        }
        root_id
      }
    };

    if let Ok(mut contexts) = self.inner.server_contexts.lock() {
      contexts.insert(cache_id.clone(), graph.context.clone());
    }

    if let Some(root) = cache.get(&cache_id) {
      if cache.is_container(&root) {
        for child in root.children() {
          self.ensure_stub(&child);
        }
      }
    }
    Ok(Some(cache_id))
  }

  fn cache_local(&self, data: &Value, id: &str, context: &JsonLdContext) -> Result<Resource> {
    let map = data
      .as_object()
      .ok_or_else(|| eyre!("Local data for {} must be a JSON object", id))?;
    let mut body = expand_node(map, context);
    body.insert("@id".to_string(), Value::String(id.to_string()));
    let resource = Resource::from_map(body)?;
    self.inner.cache.set(id, resource.clone());
    Ok(resource)
  }

  /// Cache-only lookup, never touches the network.
  pub fn get(&self, id: &str) -> Option<ResourceHandle> {
    let resource = self.inner.cache.lookup(id)?;
    Some(self.handle(resource.id(), Arc::clone(&self.inner.context), None))
  }

  /// Make sure `id` has at least a stub entry.
  pub fn ensure_stub(&self, id: &str) {
    if self.inner.cache.lookup(id).is_none() {
      self.inner.cache.set(id, Resource::stub(id));
    }
  }

  /// Handles for the members of container `id`, stubbed when not cached.
  pub fn container_children(&self, id: &str) -> Vec<ResourceHandle> {
    let Some(container) = self.inner.cache.lookup(id) else {
      return Vec::new();
    };
    container
      .children()
      .into_iter()
      .map(|child| {
        self.ensure_stub(&child);
        self.handle(
          &child,
          Arc::clone(&self.inner.context),
          Some(container.id().to_string()),
        )
      })
      .collect()
  }

  pub async fn post(&self, resource: Value, id: &str) -> Result<Option<String>> {
    self.update(WriteMethod::Post, resource, id).await
  }

  pub async fn put(&self, resource: Value, id: &str) -> Result<Option<String>> {
    self.update(WriteMethod::Put, resource, id).await
  }

  pub async fn patch(&self, resource: Value, id: &str) -> Result<Option<String>> {
    self.update(WriteMethod::Patch, resource, id).await
  }

  async fn update(&self, method: WriteMethod, resource: Value, id: &str) -> Result<Option<String>> {
    if is_local_id(id) {
      return self.set_local_data(resource, id).await;
    }

    let payload = self.with_context(resource);
    let response = self.inner.fetcher.send(method, id, Some(&payload)).await?;
    info!(id = %id, method = ?method, status = response.status, "Write accepted");

    self.after_write(id, &payload).await;

    Ok(Some(match (method, response.location) {
      (WriteMethod::Post, Some(location)) => location,
      _ => id.to_string(),
    }))
  }

  /// Write `resource` under the local id `id` and run the invalidation sequence.
  pub async fn set_local_data(&self, resource: Value, id: &str) -> Result<Option<String>> {
    let context = Arc::clone(&self.inner.context);
    self.inner.cache.delete(id);
    self.cache_local(&resource, id, &context)?;

    let nested = self.nested_resources(&resource, id);
    self.propagate(id, nested).await;
    Ok(Some(id.to_string()))
  }

  pub async fn delete(&self, id: &str) -> Result<WriteResponse> {
    let response = self
      .inner
      .fetcher
      .send(WriteMethod::Delete, id, None)
      .await?;
    info!(id = %id, status = response.status, "Delete accepted");

    self.clear_cache(id);
    self.propagate(id, Vec::new()).await;
    Ok(response)
  }

  async fn after_write(&self, id: &str, payload: &Value) {
    self.clear_cache(id);
    if self.get_data(id, GetDataOptions::force()).await.is_none() {
      warn!(id = %id, "Written resource could not be re-fetched");
    }
    let nested = self.nested_resources(payload, id);
    self.propagate(id, nested).await;
  }

  /// Refresh the dependents of `id` (plus `extra`), then notify `id` and all of them.
  async fn propagate(&self, id: &str, extra: Vec<String>) {
    let subscribers = self.inner.subscriptions.subscribers_of(id);
    let virtual_containers = self.inner.subscriptions.virtual_containers_of(id);

    let to_refresh: Vec<String> = extra
      .into_iter()
      .chain(subscribers.iter().cloned())
      .chain(virtual_containers.iter().cloned())
      .filter(|dep| dep != id)
      .collect();
    let refreshed = self.refresh(&to_refresh).await;

    let to_notify: Vec<String> = std::iter::once(id.to_string())
      .chain(refreshed)
      .chain(subscribers)
      .chain(virtual_containers)
      .collect();
    self.notify(&to_notify);
  }

  fn with_context(&self, resource: Value) -> Value {
    match resource {
      Value::Object(mut map) => {
        if !map.contains_key("@context") {
          map.insert("@context".to_string(), self.inner.context.to_value());
        }
        Value::Object(map)
      }
      other => other,
    }
  }

  /// Ids of resources embedded by reference in a written payload.
  pub fn nested_resources(&self, payload: &Value, id: &str) -> Vec<String> {
    let Some(map) = payload.as_object() else {
      return Vec::new();
    };
    let cached_is_container = self
      .inner
      .cache
      .lookup(id)
      .map(|r| self.inner.cache.is_container(&r))
      .unwrap_or(false);
    if cached_is_container {
      return Vec::new();
    }

    let mut ids: Vec<String> = Vec::new();
    for (key, value) in map {
      if key.starts_with('@') {
        continue;
      }
      for item in values_of(value) {
        if let Some(nested) = reference_id(item) {
          if nested != id && !ids.iter().any(|i| i == nested) {
            ids.push(nested.to_string());
          }
        }
      }
    }
    ids
  }

  /// Evict and re-fetch every cached, non-local id. Returns the ids refreshed.
  pub async fn refresh(&self, ids: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let targets: Vec<String> = ids
      .iter()
      .filter(|id| seen.insert(id.as_str()))
      .filter(|id| !is_local_id(id) && self.inner.cache.has(id))
      .cloned()
      .collect();

    for id in &targets {
      self.inner.cache.delete(id);
    }
    join_all(
      targets
        .iter()
        .map(|id| self.get_data(id, GetDataOptions::force())),
    )
    .await;

    debug!(count = targets.len(), "Refreshed resources");
    targets
  }

  /// Publish one change event per distinct id.
  pub fn notify(&self, ids: &[String]) {
    let mut seen = BTreeSet::new();
    for id in ids {
      if seen.insert(id.as_str()) {
        self.inner.events.publish(StoreEvent::Changed { id: id.clone() });
      }
    }
  }

  /// Explicit eviction, also dropping the entry a URL alias points to.
  pub fn clear_cache(&self, id: &str) {
    let cache = &self.inner.cache;
    if let Some(aliased) = cache.get_by_url(id) {
      if aliased.id() != id {
        cache.delete(aliased.id());
      }
    }
    cache.delete(id);
  }

  pub fn subscribe_resource_to(&self, dependent_id: &str, dependency_id: &str) {
    self.inner.subscriptions.subscribe(dependent_id, dependency_id);
  }

  pub fn subscribe_virtual_container_to(&self, container_id: &str, member_id: &str) {
    self
      .inner
      .subscriptions
      .subscribe_virtual(container_id, member_id);
  }
}
