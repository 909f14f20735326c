//! Flattening of fetched JSON-LD documents into per-id resources.
//!
//! A single response may embed many nodes. Each embedded node with an `@id`
//! and at least one predicate becomes its own [`Resource`] and is replaced by a
//! `{"@id": ...}` reference in its parent. Blank nodes stay embedded. All keys
//! and `@type` values are expanded with the document context.

use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::context::{JsonLdContext, TermResolver};
use crate::resource::Resource;

/// Result of flattening one response document.
#[derive(Debug, Clone)]
pub struct FlatGraph {
  /// The id of the document's top-level node, when it has one.
  pub root_id: Option<String>,
  /// Every identified node with content, embedded nodes before their parents.
  pub resources: Vec<Resource>,
  /// The context the document was expanded with.
  pub context: JsonLdContext,
}

impl FlatGraph {
  pub fn root(&self) -> Option<&Resource> {
    let id = self.root_id.as_deref()?;
    self.resources.iter().find(|r| r.id() == id)
  }
}

/// Flatten `document` with `context` layered under the document's own `@context`.
pub fn flatten(document: &Value, context: &JsonLdContext) -> Result<FlatGraph> {
  let map = document
    .as_object()
    .ok_or_else(|| eyre!("Expected a JSON-LD object, got {}", kind_of(document)))?;

  let context = match map.get("@context") {
    Some(local) => context.merged_with_value(local),
    None => context.clone(),
  };

  let mut flattener = Flattener {
    context: &context,
    resources: Vec::new(),
    index: HashMap::new(),
  };

  let root_id = map.get("@id").and_then(Value::as_str).map(String::from);
  match map.get("@graph") {
    Some(Value::Array(nodes)) => {
      let mut first = None;
      for node in nodes {
        if let Some(node) = node.as_object() {
          let reference = flattener.node(node);
          if first.is_none() {
            first = reference_of(&reference);
          }
        }
      }
      // A document-level node may carry predicates next to @graph.
      if root_id.is_some() && map.keys().any(|k| !k.starts_with('@')) {
        flattener.node(map);
      }
      let root_id = root_id.or(first);
      Ok(FlatGraph {
        root_id,
        resources: flattener.resources,
        context: context.clone(),
      })
    }
    _ => {
      if root_id.is_none() {
        return Err(eyre!("JSON-LD document has neither @id nor @graph"));
      }
      flattener.node(map);
      Ok(FlatGraph {
        root_id,
        resources: flattener.resources,
        context: context.clone(),
      })
    }
  }
}

/// Expand the keys and `@type` values of a node in place, without splitting
/// out embedded nodes. Used for payloads that are cached as a single resource.
pub fn expand_node(node: &Map<String, Value>, context: &JsonLdContext) -> Map<String, Value> {
  let mut out = Map::new();
  for (key, value) in node {
    match key.as_str() {
      "@context" => {}
      "@type" => {
        out.insert(key.clone(), expand_types(value, context));
      }
      k if k.starts_with('@') => {
        out.insert(key.clone(), value.clone());
      }
      k => {
        out.insert(context.expand(k), expand_value_in_place(value, context));
      }
    }
  }
  out
}

fn expand_value_in_place(value: &Value, context: &JsonLdContext) -> Value {
  match value {
    Value::Array(items) => Value::Array(
      items
        .iter()
        .map(|v| expand_value_in_place(v, context))
        .collect(),
    ),
    Value::Object(map) if is_value_object(map) => value.clone(),
    Value::Object(map) => Value::Object(expand_node(map, context)),
    other => other.clone(),
  }
}

struct Flattener<'a> {
  context: &'a JsonLdContext,
  resources: Vec<Resource>,
  /// id -> position in `resources`
  index: HashMap<String, usize>,
}

impl Flattener<'_> {
  /// Flatten an identified node and return the value that replaces it in its parent.
  fn node(&mut self, node: &Map<String, Value>) -> Value {
    let Some(id) = node.get("@id").and_then(Value::as_str) else {
      return Value::Object(self.blank(node));
    };

    let mut body = Map::new();
    body.insert("@id".to_string(), Value::String(id.to_string()));
    for (key, value) in node {
      match key.as_str() {
        "@id" | "@context" | "@graph" => {}
        "@type" => {
          body.insert(key.clone(), expand_types(value, self.context));
        }
        k if k.starts_with('@') => {
          body.insert(key.clone(), value.clone());
        }
        k => {
          let expanded = self.context.expand(k);
          let value = self.value(value);
          body.insert(expanded, value);
        }
      }
    }

    let has_content = body.keys().any(|k| k != "@id");
    if has_content {
      // from_map only fails without an @id, which is set above.
      if let Ok(resource) = Resource::from_map(body) {
        self.push(resource);
      }
    }
    reference(id)
  }

  fn blank(&mut self, node: &Map<String, Value>) -> Map<String, Value> {
    let mut body = Map::new();
    for (key, value) in node {
      match key.as_str() {
        "@context" => {}
        "@type" => {
          body.insert(key.clone(), expand_types(value, self.context));
        }
        k if k.starts_with('@') => {
          body.insert(key.clone(), value.clone());
        }
        k => {
          let value = self.value(value);
          body.insert(self.context.expand(k), value);
        }
      }
    }
    body
  }

  fn value(&mut self, value: &Value) -> Value {
    match value {
      Value::Array(items) => Value::Array(items.iter().map(|v| self.value(v)).collect()),
      Value::Object(map) if is_value_object(map) => value.clone(),
      Value::Object(map) => self.node(map),
      other => other.clone(),
    }
  }

  fn push(&mut self, resource: Resource) {
    match self.index.get(resource.id()) {
      Some(&at) => self.resources[at].merge_from(&resource),
      None => {
        self.index.insert(resource.id().to_string(), self.resources.len());
        self.resources.push(resource);
      }
    }
  }
}

fn expand_types(value: &Value, context: &JsonLdContext) -> Value {
  match value {
    Value::String(t) => Value::String(context.expand(t)),
    Value::Array(ts) => Value::Array(
      ts.iter()
        .map(|t| match t {
          Value::String(t) => Value::String(context.expand(t)),
          other => other.clone(),
        })
        .collect(),
    ),
    other => other.clone(),
  }
}

fn is_value_object(map: &Map<String, Value>) -> bool {
  map.contains_key("@value")
}

fn reference(id: &str) -> Value {
  let mut map = Map::new();
  map.insert("@id".to_string(), Value::String(id.to_string()));
  Value::Object(map)
}

fn reference_of(value: &Value) -> Option<String> {
  crate::resource::reference_id(value).map(String::from)
}

fn kind_of(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::base_context;
  use crate::resource::LDP_CONTAINS;
  use serde_json::json;

  #[test]
  fn test_flatten_splits_embedded_nodes() {
    let doc = json!({
      "@id": "https://api.example.org/users/",
      "@type": "ldp:Container",
      "ldp:contains": [
        { "@id": "https://api.example.org/users/1", "name": "Alice" },
        { "@id": "https://api.example.org/users/2" }
      ],
      "permissions": [{ "mode": { "@type": "view" } }]
    });

    let graph = flatten(&doc, &base_context()).unwrap();
    assert_eq!(graph.root_id.as_deref(), Some("https://api.example.org/users/"));
    assert_eq!(graph.resources.len(), 2);

    let root = graph.root().unwrap();
    assert_eq!(root.types(), vec!["http://www.w3.org/ns/ldp#Container"]);
    assert_eq!(
      root.children(),
      vec!["https://api.example.org/users/1", "https://api.example.org/users/2"]
    );

    // The permission blank node stays embedded, with expanded keys.
    let perms = root.get("http://www.w3.org/ns/auth/acl#accessControl").unwrap();
    assert_eq!(
      perms[0]["http://www.w3.org/ns/auth/acl#mode"]["@type"],
      json!("http://www.w3.org/ns/auth/acl#Read")
    );

    let alice = graph
      .resources
      .iter()
      .find(|r| r.id() == "https://api.example.org/users/1")
      .unwrap();
    assert_eq!(
      alice.get("http://www.w3.org/2000/01/rdf-schema#label"),
      Some(&json!("Alice"))
    );
  }

  #[test]
  fn test_flatten_uses_document_context() {
    let doc = json!({
      "@context": { "title": "http://purl.org/dc/terms/title" },
      "@id": "doc",
      "title": { "@value": "Hello", "@language": "en" }
    });
    let graph = flatten(&doc, &base_context()).unwrap();
    let root = graph.root().unwrap();
    assert_eq!(
      root.get("http://purl.org/dc/terms/title"),
      Some(&json!({ "@value": "Hello", "@language": "en" }))
    );
  }

  #[test]
  fn test_flatten_graph_document() {
    let doc = json!({
      "@graph": [
        { "@id": "c", "@type": "ldp:Container", "ldp:contains": [{ "@id": "i" }] },
        { "@id": "i", "name": "item" }
      ]
    });
    let graph = flatten(&doc, &base_context()).unwrap();
    assert_eq!(graph.root_id.as_deref(), Some("c"));
    assert_eq!(graph.resources.len(), 2);
    assert!(graph.root().unwrap().get(LDP_CONTAINS).is_some());
  }

  #[test]
  fn test_flatten_merges_repeated_nodes_in_order() {
    let members: Vec<_> = (0..2000)
      .map(|i| json!({ "@id": format!("item/{}", i), "name": format!("n{}", i) }))
      .collect();
    let repeats: Vec<_> = (0..2000)
      .map(|i| json!({ "@id": format!("item/{}", i), "description": "again" }))
      .collect();
    let doc = json!({
      "@id": "c",
      "@type": "ldp:Container",
      "ldp:contains": members,
      "seeAlso": repeats
    });

    let graph = flatten(&doc, &base_context()).unwrap();
    assert_eq!(graph.resources.len(), 2001);
    assert_eq!(graph.resources[0].id(), "item/0");
    assert_eq!(graph.resources[1999].id(), "item/1999");
    let last = &graph.resources[1999];
    assert_eq!(last.get("http://www.w3.org/2000/01/rdf-schema#label"), Some(&json!("n1999")));
    assert_eq!(
      last.get("https://cdn.startinblox.com/owl#description"),
      Some(&json!("again"))
    );
  }

  #[test]
  fn test_flatten_rejects_non_objects() {
    assert!(flatten(&json!([1, 2]), &base_context()).is_err());
    assert!(flatten(&json!({ "name": "no id" }), &base_context()).is_err());
  }
}
