//! JSON-LD term resolution.
//!
//! The store never hard-codes a vocabulary: everything that needs to move
//! between compact terms (`name`, `ldp:contains`) and absolute IRIs goes
//! through a [`TermResolver`]. [`JsonLdContext`] is the implementation built
//! from `@context` documents.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Expansion and compaction of JSON-LD terms.
pub trait TermResolver: Send + Sync {
  /// Expand a term or compact IRI to an absolute IRI.
  fn expand(&self, term: &str) -> String;

  /// Compact an absolute IRI to the shortest term this resolver knows.
  fn compact(&self, iri: &str) -> String;
}

/// Container types recognised when no override is configured.
pub const DEFAULT_CONTAINER_TYPES: &[&str] = &[
  "ldp:Container",
  "ldp:BasicContainer",
  "ldp:DirectContainer",
  "ldp:IndirectContainer",
  "sib:federatedContainer",
  "dcat:Catalog",
];

/// Base context every store starts from.
pub fn base_context() -> JsonLdContext {
  let terms: &[(&str, &str)] = &[
    ("foaf", "http://xmlns.com/foaf/0.1/"),
    ("doap", "http://usefulinc.com/ns/doap#"),
    ("ldp", "http://www.w3.org/ns/ldp#"),
    ("rdfs", "http://www.w3.org/2000/01/rdf-schema#"),
    ("rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#"),
    ("xsd", "http://www.w3.org/2001/XMLSchema#"),
    ("geo", "http://www.w3.org/2003/01/geo/wgs84_pos#"),
    ("acl", "http://www.w3.org/ns/auth/acl#"),
    ("sib", "http://cdn.startinblox.com/owl/ttl/vocab.ttl#"),
    ("dcat", "https://www.w3.org/ns/dcat3.jsonld#"),
    ("name", "rdfs:label"),
    ("deadline", "xsd:dateTime"),
    ("lat", "geo:lat"),
    ("lng", "geo:long"),
    ("jabberID", "foaf:jabberID"),
    ("permissions", "acl:accessControl"),
    ("mode", "acl:mode"),
    ("view", "acl:Read"),
    ("change", "acl:Write"),
    ("add", "acl:Append"),
    ("delete", "acl:Delete"),
    ("control", "acl:Control"),
  ];

  let mut context = JsonLdContext {
    vocab: Some("https://cdn.startinblox.com/owl#".to_string()),
    terms: terms
      .iter()
      .map(|(t, iri)| (t.to_string(), iri.to_string()))
      .collect(),
    resolved: Vec::new(),
  };
  context.resolve();
  context
}

/// A merged JSON-LD context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonLdContext {
  vocab: Option<String>,
  terms: BTreeMap<String, String>,
  /// Every term with its fully expanded IRI, computed on construction.
  resolved: Vec<(String, String)>,
}

impl JsonLdContext {
  /// Parse a `@context` value: an object, an array of objects, or remote
  /// context URLs (which are skipped).
  pub fn from_value(value: &Value) -> Self {
    let mut context = Self::default();
    context.absorb(value);
    context.resolve();
    context
  }

  /// Returns a new context with `other`'s definitions layered on top of this one.
  pub fn merged(&self, other: &JsonLdContext) -> Self {
    let mut context = self.clone();
    if other.vocab.is_some() {
      context.vocab = other.vocab.clone();
    }
    for (term, iri) in &other.terms {
      context.terms.insert(term.clone(), iri.clone());
    }
    context.resolve();
    context
  }

  /// Shortcut for merging a raw `@context` value.
  pub fn merged_with_value(&self, value: &Value) -> Self {
    self.merged(&JsonLdContext::from_value(value))
  }

  pub fn is_empty(&self) -> bool {
    self.vocab.is_none() && self.terms.is_empty()
  }

  /// Serialize back to a `@context` object.
  pub fn to_value(&self) -> Value {
    let mut map = Map::new();
    if let Some(vocab) = &self.vocab {
      map.insert("@vocab".to_string(), Value::String(vocab.clone()));
    }
    for (term, iri) in &self.terms {
      map.insert(term.clone(), Value::String(iri.clone()));
    }
    Value::Object(map)
  }

  fn absorb(&mut self, value: &Value) {
    match value {
      Value::Array(items) => items.iter().for_each(|item| self.absorb(item)),
      Value::Object(map) => self.absorb_map(map),
      Value::String(url) => debug!(context = %url, "Skipping remote JSON-LD context"),
      _ => {}
    }
  }

  fn absorb_map(&mut self, map: &Map<String, Value>) {
    for (term, definition) in map {
      if term == "@vocab" {
        self.vocab = definition.as_str().map(String::from);
        continue;
      }
      if term.starts_with('@') {
        continue;
      }
      let iri = match definition {
        Value::String(iri) => Some(iri.clone()),
        Value::Object(def) => def.get("@id").and_then(Value::as_str).map(String::from),
        _ => None,
      };
      if let Some(iri) = iri {
        self.terms.insert(term.clone(), iri);
      }
    }
  }

  fn resolve(&mut self) {
    self.resolved = self
      .terms
      .keys()
      .map(|term| (term.clone(), self.expand_with_depth(term, 0)))
      .collect();
  }

  fn expand_with_depth(&self, term: &str, depth: usize) -> String {
    if depth > 8 || term.starts_with('@') || is_absolute(term) {
      return term.to_string();
    }
    if let Some(target) = self.terms.get(term) {
      if target == term {
        return term.to_string();
      }
      return self.expand_with_depth(target, depth + 1);
    }
    if let Some((prefix, suffix)) = term.split_once(':') {
      if let Some(namespace) = self.terms.get(prefix) {
        let namespace = self.expand_with_depth(namespace, depth + 1);
        return format!("{}{}", namespace, suffix);
      }
      return term.to_string();
    }
    match &self.vocab {
      Some(vocab) => format!("{}{}", vocab, term),
      None => term.to_string(),
    }
  }
}

impl TermResolver for JsonLdContext {
  fn expand(&self, term: &str) -> String {
    self.expand_with_depth(term, 0)
  }

  fn compact(&self, iri: &str) -> String {
    if iri.starts_with('@') {
      return iri.to_string();
    }

    // An exact term match wins over a prefixed form.
    if let Some((term, _)) = self
      .resolved
      .iter()
      .filter(|(term, expanded)| expanded == iri && !is_namespace(expanded) && !term.contains(':'))
      .min_by_key(|(term, _)| term.len())
    {
      return term.clone();
    }

    let prefixed = self
      .resolved
      .iter()
      .filter(|(term, namespace)| {
        is_namespace(namespace) && !term.contains(':') && iri.len() > namespace.len()
      })
      .filter(|(_, namespace)| iri.starts_with(namespace.as_str()))
      .max_by_key(|(_, namespace)| namespace.len());
    if let Some((prefix, namespace)) = prefixed {
      return format!("{}:{}", prefix, &iri[namespace.len()..]);
    }

    if let Some(vocab) = &self.vocab {
      if let Some(rest) = iri.strip_prefix(vocab.as_str()) {
        if !rest.is_empty() {
          return rest.to_string();
        }
      }
    }
    iri.to_string()
  }
}

fn is_absolute(term: &str) -> bool {
  term.contains("://") || term.starts_with("urn:") || term.starts_with("did:")
}

fn is_namespace(iri: &str) -> bool {
  iri.ends_with('#') || iri.ends_with('/')
}
