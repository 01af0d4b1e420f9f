//! Raw HTTP exchange behind a trait so the client can be driven without a
//! network in tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl HttpRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  /// Header names are lowercase
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
  #[error("request timed out: {0}")]
  Timeout(String),
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("transport error: {0}")]
  Other(String),
}

impl TransportError {
  pub fn is_transient(&self) -> bool {
    matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
  }
}

#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Transport backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl ReqwestTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API url {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .connect_timeout(Duration::from_secs(5))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  fn url_for(&self, request: &HttpRequest) -> Result<Url, TransportError> {
    let mut url = self
      .base_url
      .join(&request.path)
      .map_err(|e| TransportError::Other(format!("invalid path {}: {}", request.path, e)))?;
    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(request.query.iter());
    }
    Ok(url)
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let url = self.url_for(&request)?;
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    }

    let response = builder.send().await.map_err(classify)?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(k, v)| {
        (
          k.as_str().to_ascii_lowercase(),
          v.to_str().unwrap_or_default().to_string(),
        )
      })
      .collect();
    let body = response.bytes().await.map_err(classify)?.to_vec();

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

fn classify(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::Timeout(err.to_string())
  } else if err.is_connect() {
    TransportError::Connect(err.to_string())
  } else {
    TransportError::Other(err.to_string())
  }
}
