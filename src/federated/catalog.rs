//! Federated catalogue access and item mapping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use super::snapshot::ListedItem;

/// Remote side of a delta sync.
#[async_trait]
pub trait CatalogSource: Send + Sync {
  /// List every active item with its hash and change timestamps.
  async fn list_items(&self) -> Result<Vec<ListedItem>>;

  /// Fetch the raw body of one item.
  async fn fetch_item(&self, hash: &str) -> Result<Value>;
}

/// reqwest-backed catalogue client.
pub struct HttpCatalogSource {
  client: reqwest::Client,
  endpoint: Url,
}

impl HttpCatalogSource {
  pub fn new(endpoint: &str, token: &str) -> Result<Self> {
    // A trailing slash makes joins append instead of replacing the last segment.
    let normalized = format!("{}/", endpoint.trim_end_matches('/'));
    let endpoint = Url::parse(&normalized)
      .map_err(|e| eyre!("Invalid catalogue endpoint {}: {}", endpoint, e))?;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    let auth = HeaderValue::from_str(&format!("Bearer {}", token))
      .map_err(|e| eyre!("Invalid catalogue token: {}", e))?;
    headers.insert(AUTHORIZATION, auth);

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, endpoint })
  }

  fn url(&self, path: &str) -> Result<Url> {
    self
      .endpoint
      .join(path)
      .map_err(|e| eyre!("Failed to build catalogue URL {}: {}", path, e))
  }

  async fn get_json(&self, url: Url) -> Result<Value> {
    debug!(url = %url, "GET");
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Failed to fetch {}: status {}", url, status));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {}: {}", url, e))
  }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
  async fn list_items(&self) -> Result<Vec<ListedItem>> {
    let mut url = self.url("self-descriptions")?;
    url
      .query_pairs_mut()
      .append_pair("withContent", "false")
      .append_pair("statuses", "ACTIVE");
    let listing = self.get_json(url).await?;
    parse_listing(&listing)
  }

  async fn fetch_item(&self, hash: &str) -> Result<Value> {
    let url = self.url(&format!("self-descriptions/{}", hash))?;
    self.get_json(url).await
  }
}

/// Parse a listing response: `{"items": [{"meta": {"sdHash": ..., ...}}]}`.
pub fn parse_listing(listing: &Value) -> Result<Vec<ListedItem>> {
  let items = listing
    .get("items")
    .and_then(Value::as_array)
    .ok_or_else(|| eyre!("Catalogue listing has no items array"))?;

  items
    .iter()
    .map(|item| {
      let meta = item
        .get("meta")
        .ok_or_else(|| eyre!("Catalogue listing item without meta"))?;
      let hash = meta
        .get("sdHash")
        .and_then(Value::as_str)
        .ok_or_else(|| eyre!("Catalogue listing item without sdHash"))?;
      Ok(ListedItem {
        hash: hash.to_string(),
        first_change: timestamp(meta, "statusDatetime"),
        second_change: timestamp(meta, "uploadDatetime"),
      })
    })
    .collect()
}

fn timestamp(meta: &Value, field: &str) -> Option<DateTime<Utc>> {
  let raw = meta.get(field)?.as_str()?;
  match DateTime::parse_from_rfc3339(raw) {
    Ok(ts) => Some(ts.with_timezone(&Utc)),
    Err(e) => {
      debug!(field, value = %raw, error = %e, "Unparseable listing timestamp");
      None
    }
  }
}

/// Fields copied from the credential subject, with the keys they may appear under.
const COPIED_FIELDS: &[(&str, &[&str])] = &[
  ("name", &["name", "dct:title", "dcterms:title"]),
  ("description", &["description", "dct:description", "dcterms:description"]),
  ("keywords", &["keywords", "keyword", "dcat:keyword"]),
  ("publisher", &["publisher", "dct:publisher", "dcterms:publisher"]),
];

/// Map a raw self-description into a catalogue resource document.
///
/// The body is a verifiable presentation; the resource id is its credential
/// subject id. A body without one is malformed and is an error.
pub fn map_item(hash: &str, body: &Value) -> Result<Value> {
  let credential = first(body.get("verifiableCredential"))
    .ok_or_else(|| eyre!("Self-description {} has no verifiable credential", hash))?;
  let subject = first(credential.get("credentialSubject"))
    .and_then(Value::as_object)
    .ok_or_else(|| eyre!("Self-description {} has no credential subject", hash))?;
  let id = subject
    .get("@id")
    .or_else(|| subject.get("id"))
    .and_then(Value::as_str)
    .filter(|id| !id.is_empty())
    .ok_or_else(|| eyre!("Self-description {} has no credential subject id", hash))?;

  let mut item = Map::new();
  item.insert("@id".to_string(), json!(id));
  item.insert("@type".to_string(), json!("dcat:Dataset"));
  for (field, keys) in COPIED_FIELDS {
    if let Some(value) = keys.iter().find_map(|k| subject.get(*k)) {
      item.insert(field.to_string(), value.clone());
    }
  }
  item.insert("sdHash".to_string(), json!(hash));
  Ok(Value::Object(item))
}

fn first(value: Option<&Value>) -> Option<&Value> {
  match value? {
    Value::Array(items) => items.first(),
    other => Some(other),
  }
}
