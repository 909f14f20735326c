//! Dependency edges used for invalidation fan-out.
//!
//! Two independent relations are kept, both keyed by the dependency:
//! - direct: a resource that embeds or displays another
//! - virtual: an aggregation view that must be refreshed when a member changes
//!
//! Edges are never removed for the lifetime of the store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

type Edges = Mutex<HashMap<String, BTreeSet<String>>>;

#[derive(Default)]
pub struct SubscriptionGraph {
  direct: Edges,
  virtual_containers: Edges,
}

impl SubscriptionGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record that `dependent` must be refreshed when `dependency` changes.
  pub fn subscribe(&self, dependent: &str, dependency: &str) {
    add_edge(&self.direct, dependency, dependent);
  }

  /// Record that the aggregation view `container` depends on `member`.
  pub fn subscribe_virtual(&self, container: &str, member: &str) {
    add_edge(&self.virtual_containers, member, container);
  }

  /// Resources subscribed to `dependency`.
  pub fn subscribers_of(&self, dependency: &str) -> BTreeSet<String> {
    edges_of(&self.direct, dependency)
  }

  /// Virtual containers that aggregate `member`.
  pub fn virtual_containers_of(&self, member: &str) -> BTreeSet<String> {
    edges_of(&self.virtual_containers, member)
  }
}

fn add_edge(edges: &Edges, from: &str, to: &str) {
  if let Ok(mut edges) = edges.lock() {
    edges
      .entry(from.to_string())
      .or_default()
      .insert(to.to_string());
  }
}

fn edges_of(edges: &Edges, from: &str) -> BTreeSet<String> {
  edges
    .lock()
    .ok()
    .and_then(|edges| edges.get(from).cloned())
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_subscribe_is_idempotent() {
    let graph = SubscriptionGraph::new();
    graph.subscribe("a", "b");
    graph.subscribe("a", "b");
    graph.subscribe("c", "b");

    let subs: Vec<_> = graph.subscribers_of("b").into_iter().collect();
    assert_eq!(subs, vec!["a", "c"]);
    assert!(graph.subscribers_of("a").is_empty());
  }

  #[test]
  fn test_relations_are_independent() {
    let graph = SubscriptionGraph::new();
    graph.subscribe("a", "b");
    graph.subscribe_virtual("v", "b");

    assert!(graph.subscribers_of("b").contains("a"));
    assert!(!graph.subscribers_of("b").contains("v"));
    assert!(graph.virtual_containers_of("b").contains("v"));
    assert!(graph.virtual_containers_of("v").is_empty());
  }
}
