//! Network access for the store.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::WriteError;

const LD_JSON: &str = "application/ld+json";

/// HTTP verb of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
  Post,
  Put,
  Patch,
  Delete,
}

impl WriteMethod {
  fn as_method(self) -> Method {
    match self {
      WriteMethod::Post => Method::POST,
      WriteMethod::Put => Method::PUT,
      WriteMethod::Patch => Method::PATCH,
      WriteMethod::Delete => Method::DELETE,
    }
  }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResponse {
  pub status: u16,
  /// `Location` header, set by servers on creation
  pub location: Option<String>,
  pub body: Option<Value>,
}

/// Transport used by the store to read and write resources.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Fetch the JSON-LD document at `url`. `Ok(None)` means the server had nothing.
  async fn fetch(&self, url: &str) -> Result<Option<Value>>;

  /// Send a write. Non-success statuses are returned as [`WriteError::Rejected`].
  async fn send(&self, method: WriteMethod, url: &str, body: Option<&Value>) -> Result<WriteResponse>;
}

/// reqwest-backed fetcher for LDP servers.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  base: Option<Url>,
}

impl HttpFetcher {
  pub fn new(base: Option<&str>, token: Option<&str>) -> Result<Self> {
    let base = base
      .map(|b| Url::parse(b).map_err(|e| eyre!("Invalid endpoint {}: {}", b, e)))
      .transpose()?;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(LD_JSON));
    if let Some(token) = token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid API token: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base })
  }

  /// Resolve a possibly relative id against the configured endpoint.
  pub fn resolve_url(&self, id: &str) -> Result<Url> {
    match Url::parse(id) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => {
        let base = self
          .base
          .as_ref()
          .ok_or_else(|| eyre!("Relative id {} needs a configured endpoint", id))?;
        base
          .join(id)
          .map_err(|e| eyre!("Failed to resolve {}: {}", id, e))
      }
      Err(e) => Err(eyre!("Invalid resource URL {}: {}", id, e)),
    }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, url: &str) -> Result<Option<Value>> {
    let url = self.resolve_url(url)?;
    debug!(url = %url, "GET");

    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
      return Ok(None);
    }
    if !status.is_success() {
      return Err(eyre!("Failed to fetch {}: status {}", url, status));
    }

    let body: Value = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {}: {}", url, e))?;
    Ok(Some(body))
  }

  async fn send(&self, method: WriteMethod, url: &str, body: Option<&Value>) -> Result<WriteResponse> {
    let url = self.resolve_url(url)?;
    debug!(url = %url, method = ?method, "Write");

    let mut request = self.client.request(method.as_method(), url.clone());
    if let Some(body) = body {
      request = request
        .header(CONTENT_TYPE, LD_JSON)
        .body(serde_json::to_vec(body)?);
    }

    let response = request
      .send()
      .await
      .map_err(|e| WriteError::Transport(format!("{}: {}", url, e)))?;

    let status = response.status();
    let location = response
      .headers()
      .get(LOCATION)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let text = response.text().await.unwrap_or_default();
    let payload = serde_json::from_str::<Value>(&text).ok();

    if !status.is_success() {
      return Err(
        WriteError::Rejected {
          status: status.as_u16(),
          payload,
        }
        .into(),
      );
    }

    Ok(WriteResponse {
      status: status.as_u16(),
      location,
      body: payload,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_relative_ids() {
    let fetcher = HttpFetcher::new(Some("https://api.example.org/"), None).unwrap();
    assert_eq!(
      fetcher.resolve_url("/users/1").unwrap().as_str(),
      "https://api.example.org/users/1"
    );
    assert_eq!(
      fetcher.resolve_url("https://other.example.org/x").unwrap().as_str(),
      "https://other.example.org/x"
    );

    let bare = HttpFetcher::new(None, None).unwrap();
    assert!(bare.resolve_url("/users/1").is_err());
  }

  #[test]
  fn test_invalid_endpoint_is_a_config_error() {
    assert!(HttpFetcher::new(Some("not a url"), None).is_err());
  }
}
