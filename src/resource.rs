//! Resource model shared by the cache, the handles and the sync engine.
//!
//! A [`Resource`] is one node of the flattened graph. Predicate keys are stored
//! in their expanded (absolute IRI) form; references to other nodes are kept as
//! `{"@id": ...}` objects so cyclic graphs never need owning pointers.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of identifiers that live only in the local cache.
pub const LOCAL_SCHEME: &str = "store://local.";

pub const LDP: &str = "http://www.w3.org/ns/ldp#";
pub const ACL: &str = "http://www.w3.org/ns/auth/acl#";
pub const DCAT: &str = "https://www.w3.org/ns/dcat3.jsonld#";

/// Expanded predicate holding container members.
pub const LDP_CONTAINS: &str = "http://www.w3.org/ns/ldp#contains";
/// Expanded predicate holding catalogue members.
pub const DCAT_DATASET: &str = "https://www.w3.org/ns/dcat3.jsonld#dataset";
/// Expanded predicate holding the permission set.
pub const ACL_ACCESS_CONTROL: &str = "http://www.w3.org/ns/auth/acl#accessControl";

/// Predicates whose values are the ordered children of a container.
pub const CHILD_PREDICATES: &[&str] = &[LDP_CONTAINS, DCAT_DATASET];

/// Returns true for identifiers using the local-only scheme.
pub fn is_local_id(id: &str) -> bool {
  id.starts_with(LOCAL_SCHEME)
}

/// Returns the id of a bare `{"@id": ...}` reference or an embedded node.
pub fn reference_id(value: &Value) -> Option<&str> {
  value.as_object()?.get("@id")?.as_str()
}

/// An identified graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Resource {
  id: String,
  body: Map<String, Value>,
}

impl Resource {
  /// Create a stub carrying nothing but its id.
  pub fn stub(id: impl Into<String>) -> Self {
    let id = id.into();
    let mut body = Map::new();
    body.insert("@id".to_string(), Value::String(id.clone()));
    Self { id, body }
  }

  /// Build a resource from a JSON object that has an `@id`.
  pub fn from_value(value: Value) -> Result<Self> {
    match value {
      Value::Object(body) => Self::from_map(body),
      other => Err(eyre!("Expected a JSON object for a resource, got {}", other)),
    }
  }

  pub fn from_map(mut body: Map<String, Value>) -> Result<Self> {
    let id = body
      .get("@id")
      .and_then(Value::as_str)
      .map(String::from)
      .ok_or_else(|| eyre!("Resource is missing an @id"))?;
    body.insert("@id".to_string(), Value::String(id.clone()));
    Ok(Self { id, body })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Re-key this resource, used for pagination/search variants of one id.
  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = id.into();
    self
      .body
      .insert("@id".to_string(), Value::String(self.id.clone()));
    self
  }

  /// The `@type` tags, whether stored as a string or an array.
  pub fn types(&self) -> Vec<&str> {
    match self.body.get("@type") {
      Some(Value::String(t)) => vec![t.as_str()],
      Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
      _ => Vec::new(),
    }
  }

  pub fn get(&self, predicate: &str) -> Option<&Value> {
    self.body.get(predicate)
  }

  pub fn insert(&mut self, predicate: impl Into<String>, value: Value) {
    let predicate = predicate.into();
    if predicate == "@id" {
      return;
    }
    self.body.insert(predicate, value);
  }

  pub fn remove(&mut self, predicate: &str) -> Option<Value> {
    if predicate == "@id" {
      return None;
    }
    self.body.remove(predicate)
  }

  /// Non-keyword predicate keys.
  pub fn predicates(&self) -> impl Iterator<Item = &str> {
    self
      .body
      .keys()
      .filter(|k| !k.starts_with('@'))
      .map(String::as_str)
  }

  /// A resource is full when it has any predicate besides permissions.
  pub fn is_full(&self) -> bool {
    self.predicates().any(|p| p != ACL_ACCESS_CONTROL)
  }

  pub fn is_stub(&self) -> bool {
    !self.is_full()
  }

  /// Shallow-overwrite this resource with the fields of `incoming`.
  /// Fields absent from `incoming` are kept.
  pub fn merge_from(&mut self, incoming: &Resource) {
    for (key, value) in &incoming.body {
      if key == "@id" {
        continue;
      }
      self.body.insert(key.clone(), value.clone());
    }
  }

  /// Ids referenced by the container child predicates, in order.
  pub fn children(&self) -> Vec<String> {
    CHILD_PREDICATES
      .iter()
      .filter_map(|p| self.body.get(*p))
      .flat_map(values_of)
      .filter_map(reference_id)
      .map(String::from)
      .collect()
  }

  /// Ids of every node referenced from a predicate, at any nesting depth of arrays.
  pub fn references(&self) -> Vec<String> {
    let mut ids = Vec::new();
    for (key, value) in &self.body {
      if key.starts_with('@') {
        continue;
      }
      for item in values_of(value) {
        if let Some(id) = reference_id(item) {
          if id != self.id && !ids.iter().any(|i| i == id) {
            ids.push(id.to_string());
          }
        }
      }
    }
    ids
  }

  pub fn body(&self) -> &Map<String, Value> {
    &self.body
  }

  pub fn to_value(&self) -> Value {
    Value::Object(self.body.clone())
  }
}

impl TryFrom<Value> for Resource {
  type Error = String;

  fn try_from(value: Value) -> Result<Self, Self::Error> {
    Resource::from_value(value).map_err(|e| e.to_string())
  }
}

impl From<Resource> for Value {
  fn from(resource: Resource) -> Self {
    Value::Object(resource.body)
  }
}

/// Iterate a predicate value as a list: arrays yield their items, anything else yields itself.
pub fn values_of(value: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
  match value {
    Value::Array(items) => Box::new(items.iter()),
    other => Box::new(std::iter::once(other)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_stub_is_not_full() {
    let stub = Resource::stub("https://api.example.org/users/1");
    assert!(stub.is_stub());

    let mut with_perms = stub.clone();
    with_perms.insert(ACL_ACCESS_CONTROL, json!(["view"]));
    assert!(with_perms.is_stub());

    with_perms.insert("http://www.w3.org/2000/01/rdf-schema#label", json!("Alice"));
    assert!(with_perms.is_full());
  }

  #[test]
  fn test_from_value_requires_id() {
    assert!(Resource::from_value(json!({ "name": "x" })).is_err());
    assert!(Resource::from_value(json!("x")).is_err());
    let r = Resource::from_value(json!({ "@id": "a", "@type": ["t1", "t2"] })).unwrap();
    assert_eq!(r.types(), vec!["t1", "t2"]);
  }

  #[test]
  fn test_merge_keeps_existing_fields() {
    let mut existing = Resource::from_value(json!({ "@id": "a", "p1": 1, "p2": 2 })).unwrap();
    let incoming = Resource::from_value(json!({ "@id": "a", "p2": 3, "p3": 4 })).unwrap();
    existing.merge_from(&incoming);
    assert_eq!(existing.get("p1"), Some(&json!(1)));
    assert_eq!(existing.get("p2"), Some(&json!(3)));
    assert_eq!(existing.get("p3"), Some(&json!(4)));
  }

  #[test]
  fn test_children_and_references() {
    let r = Resource::from_value(json!({
      "@id": "c",
      LDP_CONTAINS: [{ "@id": "c/1" }, { "@id": "c/2" }],
      "owner": { "@id": "u" },
      "self": { "@id": "c" }
    }))
    .unwrap();
    assert_eq!(r.children(), vec!["c/1", "c/2"]);
    let refs = r.references();
    assert!(refs.contains(&"u".to_string()));
    assert!(!refs.contains(&"c".to_string()));
  }

  #[test]
  fn test_local_scheme() {
    assert!(is_local_id("store://local.draft"));
    assert!(!is_local_id("https://api.example.org/draft"));
  }
}
