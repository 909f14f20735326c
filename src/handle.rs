//! Lazy resource handles.
//!
//! A [`ResourceHandle`] is a view over one cache entry. It never owns the
//! resource: every read goes back to the store's cache, and traversal fetches
//! linked resources on demand.
//!
//! ```ignore
//! let user = store.get_data("https://api.example.org/users/1", Default::default()).await?;
//! let city = user.get("address.city").await;
//! let perms = user.get_permissions().await;
//! ```

use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::context::{JsonLdContext, TermResolver};
use crate::resource::{reference_id, values_of, Resource};
use crate::store::{GetDataOptions, Store};

/// Locale literals fall back to when the active one is missing.
pub const DEFAULT_LOCALE: &str = "en";

/// The result of resolving a path.
#[derive(Debug, Clone)]
pub enum PathValue {
  Literal(Value),
  Resource(ResourceHandle),
  List(Vec<PathValue>),
}

impl PathValue {
  pub fn as_literal(&self) -> Option<&Value> {
    match self {
      PathValue::Literal(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    self.as_literal().and_then(Value::as_str)
  }

  pub fn as_resource(&self) -> Option<&ResourceHandle> {
    match self {
      PathValue::Resource(handle) => Some(handle),
      _ => None,
    }
  }

  /// Lists yield their items, anything else a single-item list.
  pub fn into_list(self) -> Vec<PathValue> {
    match self {
      PathValue::List(items) => items,
      other => vec![other],
    }
  }
}

/// Resolvable view over a (possibly partial) resource.
#[derive(Clone)]
pub struct ResourceHandle {
  id: String,
  store: Store,
  context: Arc<JsonLdContext>,
  parent_id: Option<String>,
}

impl ResourceHandle {
  pub(crate) fn new(
    id: String,
    store: Store,
    context: Arc<JsonLdContext>,
    parent_id: Option<String>,
  ) -> Self {
    Self {
      id,
      store,
      context,
      parent_id,
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn parent_id(&self) -> Option<&str> {
    self.parent_id.as_deref()
  }

  /// Current cached state of the resource.
  pub fn resource(&self) -> Option<Resource> {
    self.store.cache().lookup(&self.id)
  }

  pub fn is_full(&self) -> bool {
    self.resource().map(|r| r.is_full()).unwrap_or(false)
  }

  /// Expand with the store's injected resolver, else the context the
  /// resource was fetched with, falling back to the client context.
  pub fn expand(&self, term: &str) -> String {
    if let Some(resolver) = self.store.resolver() {
      return resolver.expand(term);
    }
    match self.store.server_context(&self.id) {
      Some(server) => server.expand(term),
      None => self.context.expand(term),
    }
  }

  pub fn compact(&self, iri: &str) -> String {
    match self.store.resolver() {
      Some(resolver) => resolver.compact(iri),
      None => self.context.compact(iri),
    }
  }

  fn child_options(&self) -> GetDataOptions {
    GetDataOptions::default().with_parent(self.id.clone())
  }

  fn child(&self, id: &str) -> ResourceHandle {
    ResourceHandle::new(
      id.to_string(),
      self.store.clone(),
      Arc::clone(&self.context),
      Some(self.id.clone()),
    )
  }

  /// The full resource, fetched first when only a stub is cached.
  pub async fn load(&self, force: bool) -> Option<Resource> {
    if !force {
      if let Some(resource) = self.resource().filter(Resource::is_full) {
        return Some(resource);
      }
    }
    let options = GetDataOptions {
      force_fetch: force,
      parent_id: self.parent_id.clone(),
      ..GetDataOptions::default()
    };
    self
      .store
      .get_data_in(&self.id, options, Arc::clone(&self.context))
      .await?
      .resource()
  }

  /// Resolve a dotted path such as `"author.address.city"`.
  ///
  /// Each segment is a compact or expanded predicate. A path that is itself
  /// an absolute reference is fetched directly.
  pub fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Option<PathValue>> {
    async move {
      let path = path.trim();
      if path.is_empty() {
        return None;
      }
      if is_absolute_reference(path) {
        return self
          .store
          .get_data_in(path, self.child_options(), Arc::clone(&self.context))
          .await
          .map(PathValue::Resource);
      }

      let resource = self.load(false).await?;
      let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
      };

      match head {
        "@id" => return Some(PathValue::Literal(Value::String(self.id.clone()))),
        "@type" => {
          let types = self.get_type().into_iter().map(Value::String).collect();
          return Some(PathValue::Literal(Value::Array(types)));
        }
        _ => {}
      }

      let value = resource.get(&self.expand(head))?.clone();
      match rest {
        None => self.terminal(value).await,
        Some(rest) => self.traverse(value, rest).await,
      }
    }
    .boxed()
  }

  async fn terminal(&self, value: Value) -> Option<PathValue> {
    if is_language_list(&value) || is_value_object(&value) {
      return self.get_literal(&value).map(PathValue::Literal);
    }
    if let Value::Array(items) = &value {
      return Some(PathValue::List(
        items.iter().map(|item| self.lazy_item(item)).collect(),
      ));
    }
    if let Some(id) = bare_reference(&value) {
      return self
        .store
        .get_data_in(id, self.child_options(), Arc::clone(&self.context))
        .await
        .map(PathValue::Resource);
    }
    Some(PathValue::Literal(value))
  }

  /// A list member: references become stub-backed handles, resolved later.
  fn lazy_item(&self, item: &Value) -> PathValue {
    if let Some(id) = bare_reference(item) {
      self.store.ensure_stub(id);
      return PathValue::Resource(self.child(id));
    }
    if is_value_object(item) {
      if let Some(literal) = self.get_literal(item) {
        return PathValue::Literal(literal);
      }
    }
    PathValue::Literal(item.clone())
  }

  async fn traverse(&self, value: Value, rest: &str) -> Option<PathValue> {
    match value {
      Value::Array(items) => {
        let mut out = Vec::new();
        for item in items {
          if let Some(found) = self.traverse_one(item, rest).await {
            out.push(found);
          }
        }
        Some(PathValue::List(out))
      }
      other => self.traverse_one(other, rest).await,
    }
  }

  async fn traverse_one(&self, value: Value, rest: &str) -> Option<PathValue> {
    if let Some(id) = bare_reference(&value) {
      self.store.ensure_stub(id);
      let linked = self
        .store
        .get_data_in(id, self.child_options(), Arc::clone(&self.context))
        .await?;
      return linked.get(rest).await;
    }
    match value {
      Value::Object(map) => self.get_in_blank(&map, rest),
      _ => None,
    }
  }

  /// Resolve the rest of a path inside an embedded blank node.
  fn get_in_blank(&self, map: &Map<String, Value>, path: &str) -> Option<PathValue> {
    let (head, rest) = match path.split_once('.') {
      Some((head, rest)) => (head, Some(rest)),
      None => (path, None),
    };
    let value = map.get(&self.expand(head))?;
    match (rest, value) {
      (None, value) if is_language_list(value) || is_value_object(value) => {
        self.get_literal(value).map(PathValue::Literal)
      }
      (None, Value::Array(items)) => Some(PathValue::List(
        items.iter().map(|item| self.lazy_item(item)).collect(),
      )),
      (None, value) => Some(self.lazy_item(value)),
      (Some(rest), Value::Object(inner)) if bare_reference(value).is_none() => {
        self.get_in_blank(inner, rest)
      }
      _ => None,
    }
  }

  /// Select the literal for the store locale from a value object or a list
  /// of language-tagged value objects.
  pub fn get_literal(&self, value: &Value) -> Option<Value> {
    select_language(value, self.store.locale())
  }

  pub fn is_container(&self) -> bool {
    self
      .resource()
      .map(|r| self.store.cache().is_container(&r))
      .unwrap_or(false)
  }

  /// Test a type given in compact or expanded form.
  pub fn has_type(&self, type_name: &str) -> bool {
    let expanded = self.expand(type_name);
    self
      .resource()
      .map(|r| r.types().iter().any(|t| *t == expanded))
      .unwrap_or(false)
  }

  /// Types in compact form.
  pub fn get_type(&self) -> Vec<String> {
    self
      .resource()
      .map(|r| r.types().iter().map(|t| self.compact(t)).collect())
      .unwrap_or_default()
  }

  /// Permission modes in compact form (`view`, `change`, ...).
  ///
  /// Permissions are often asked for before the body is loaded, so a
  /// missing permission set triggers one forced re-fetch.
  pub async fn get_permissions(&self) -> Vec<String> {
    let predicate = self.expand("permissions");
    let mut permissions = self.resource().and_then(|r| r.get(&predicate).cloned());
    if permissions.is_none() {
      permissions = self
        .load(true)
        .await
        .and_then(|r| r.get(&predicate).cloned());
    }
    let Some(permissions) = permissions else {
      return Vec::new();
    };

    let mode = self.expand("mode");
    values_of(&permissions)
      .filter_map(|p| permission_mode(p, &mode))
      .map(|m| self.compact(&m))
      .collect()
  }

  /// Predicate keys in compact form.
  pub fn get_properties(&self) -> Vec<String> {
    self
      .resource()
      .map(|r| r.predicates().map(|p| self.compact(p)).collect())
      .unwrap_or_default()
  }

  /// Container members as handles, stubbed when not cached.
  pub fn children(&self) -> Vec<ResourceHandle> {
    self
      .resource()
      .map(|r| {
        r.children()
          .iter()
          .map(|id| {
            self.store.ensure_stub(id);
            self.child(id)
          })
          .collect()
      })
      .unwrap_or_default()
  }
}

impl fmt::Display for ResourceHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.compact(&self.id))
  }
}

impl fmt::Debug for ResourceHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResourceHandle")
      .field("id", &self.id)
      .field("parent_id", &self.parent_id)
      .finish_non_exhaustive()
  }
}

impl PartialEq for ResourceHandle {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for ResourceHandle {}

/// Pick the entry for `locale` from a language-tagged literal, falling back
/// to [`DEFAULT_LOCALE`]. Plain literals pass through.
pub fn select_language(value: &Value, locale: &str) -> Option<Value> {
  if is_language_list(value) {
    let entries: Vec<&Map<String, Value>> = values_of(value).filter_map(Value::as_object).collect();
    let pick = |lang: &str| {
      entries
        .iter()
        .find(|e| e.get("@language").and_then(Value::as_str) == Some(lang))
        .and_then(|e| e.get("@value").cloned())
    };
    return pick(locale).or_else(|| pick(DEFAULT_LOCALE));
  }
  match value {
    Value::Object(map) if map.contains_key("@value") => map.get("@value").cloned(),
    other => Some(other.clone()),
  }
}

fn is_language_list(value: &Value) -> bool {
  match value {
    Value::Array(items) => {
      !items.is_empty()
        && items
          .iter()
          .all(|i| i.as_object().map(|m| m.contains_key("@language")).unwrap_or(false))
    }
    _ => false,
  }
}

fn is_value_object(value: &Value) -> bool {
  value
    .as_object()
    .map(|m| m.contains_key("@value"))
    .unwrap_or(false)
}

/// The id of a `{"@id": ...}` value that carries nothing else.
fn bare_reference(value: &Value) -> Option<&str> {
  let map = value.as_object()?;
  if map.keys().all(|k| k == "@id" || k == "@type") {
    reference_id(value)
  } else {
    None
  }
}

fn is_absolute_reference(path: &str) -> bool {
  path.starts_with("http://") || path.starts_with("https://") || path.starts_with("store://")
}

fn permission_mode(permission: &Value, mode_predicate: &str) -> Option<String> {
  match permission {
    Value::String(mode) => Some(mode.clone()),
    Value::Object(map) => {
      let mode = map.get(mode_predicate).or_else(|| map.get("mode"));
      let typed = match mode {
        Some(Value::Object(mode)) => mode.get("@type"),
        Some(other) => Some(other),
        None => map.get("@type"),
      };
      typed.and_then(Value::as_str).map(String::from)
    }
    _ => None,
  }
}
