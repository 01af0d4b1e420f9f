//! Review API client: auth header, retries, in-flight dedup, opportunistic
//! response caching and error normalization.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::freshness::parse_freshness;
use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use crate::auth::Session;
use crate::cache::{canonical_params, TieredCache};
use crate::error::{ApiError, ErrorKind, ErrorReporter};

/// Status codes retried by the client.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Prefix of keys written by opportunistic response caching.
pub const HTTP_CACHE_PREFIX: &str = "http:";

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(250),
      max_delay: Duration::from_secs(8),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

/// Key identifying a request for dedup and response caching.
pub fn request_key(method: Method, path: &str, params: &[(String, String)]) -> String {
  let params = canonical_params(params);
  if params.is_empty() {
    format!("{}:{}", method, path)
  } else {
    let query = url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(params.iter())
      .finish();
    format!("{}:{}?{}", method, path, query)
  }
}

/// Key under which a GET response for `path` is opportunistically cached.
pub fn http_cache_key(path: &str, params: &[(String, String)]) -> String {
  format!("{}{}", HTTP_CACHE_PREFIX, request_key(Method::Get, path, params))
}

type SharedResponse = Shared<BoxFuture<'static, Result<HttpResponse, ApiError>>>;

struct InFlight {
  id: u64,
  response: SharedResponse,
}

/// Per-client request settings. Travel with each request, so a joined
/// in-flight GET runs with the settings of the client that started it.
#[derive(Debug, Clone, Copy)]
struct RequestOptions {
  retry: RetryPolicy,
  default_ttl: Duration,
}

struct ClientInner {
  transport: Arc<dyn Transport>,
  session: Session,
  cache: Arc<TieredCache>,
  reporter: Arc<ErrorReporter>,
  in_flight: Mutex<HashMap<String, InFlight>>,
  next_flight: AtomicU64,
}

/// Clears an in-flight slot when the request task ends, including by panic.
struct FlightGuard {
  inner: Arc<ClientInner>,
  key: String,
  id: u64,
}

impl Drop for FlightGuard {
  fn drop(&mut self) {
    self.inner.finish_flight(&self.key, self.id);
  }
}

/// HTTP client for the review API.
///
/// Cheap to clone; clones share the in-flight table.
#[derive(Clone)]
pub struct ApiClient {
  inner: Arc<ClientInner>,
  options: RequestOptions,
}

impl ApiClient {
  pub fn new(
    transport: Arc<dyn Transport>,
    session: Session,
    cache: Arc<TieredCache>,
    reporter: Arc<ErrorReporter>,
  ) -> Self {
    Self {
      inner: Arc::new(ClientInner {
        transport,
        session,
        cache,
        reporter,
        in_flight: Mutex::new(HashMap::new()),
        next_flight: AtomicU64::new(1),
      }),
      options: RequestOptions {
        retry: RetryPolicy::default(),
        default_ttl: Duration::from_secs(60),
      },
    }
  }

  /// Replace the retry policy of this handle. Other clones keep theirs.
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.options.retry = retry;
    self
  }

  /// TTL for responses that carry an entity tag but no max-age.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.options.default_ttl = ttl;
    self
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    self.options.retry
  }

  pub fn session(&self) -> &Session {
    &self.inner.session
  }

  pub fn reporter(&self) -> &Arc<ErrorReporter> {
    &self.inner.reporter
  }

  /// Number of GET requests currently in flight.
  pub fn in_flight(&self) -> usize {
    self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// Stop sharing in-flight GETs whose request key starts with `prefix`.
  /// Callers already waiting still get their result; the next identical GET
  /// goes to the network.
  pub fn detach_in_flight(&self, prefix: &str) -> usize {
    let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    let before = in_flight.len();
    in_flight.retain(|key, _| !key.starts_with(prefix));
    before - in_flight.len()
  }

  /// Stop sharing the in-flight GET with exactly this request key.
  pub fn detach_in_flight_exact(&self, key: &str) -> bool {
    let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    in_flight.remove(key).is_some()
  }

  pub async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    params: &[(String, String)],
  ) -> Result<T, ApiError> {
    let response = self.send(Method::Get, path, params, None).await?;
    self.decode(Method::Get, path, &response)
  }

  pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
    &self,
    path: &str,
    body: &B,
  ) -> Result<T, ApiError> {
    let body = self.encode(body)?;
    let response = self.send(Method::Post, path, &[], Some(body)).await?;
    self.decode(Method::Post, path, &response)
  }

  pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(
    &self,
    path: &str,
    body: &B,
  ) -> Result<T, ApiError> {
    let body = self.encode(body)?;
    let response = self.send(Method::Patch, path, &[], Some(body)).await?;
    self.decode(Method::Patch, path, &response)
  }

  pub async fn delete(&self, path: &str, params: &[(String, String)]) -> Result<(), ApiError> {
    self.send(Method::Delete, path, params, None).await?;
    Ok(())
  }

  fn encode<B: Serialize + ?Sized>(&self, body: &B) -> Result<Vec<u8>, ApiError> {
    serde_json::to_vec(body).map_err(|e| {
      let err = ApiError::generic(format!("failed to encode request body: {}", e));
      self.inner.reporter.report(&err);
      err
    })
  }

  fn decode<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    response: &HttpResponse,
  ) -> Result<T, ApiError> {
    let body: &[u8] = if response.body.is_empty() {
      b"null"
    } else {
      &response.body
    };
    serde_json::from_slice(body).map_err(|e| {
      let err = ApiError::generic(format!("invalid response body: {}", e))
        .with_context("method", method.as_str())
        .with_context("path", path);
      self.inner.reporter.report(&err);
      err
    })
  }

  /// Issue a request. Identical GETs issued while one is outstanding share
  /// its result instead of hitting the network again.
  pub async fn send(
    &self,
    method: Method,
    path: &str,
    params: &[(String, String)],
    body: Option<Vec<u8>>,
  ) -> Result<HttpResponse, ApiError> {
    let mut request = HttpRequest::new(method, path);
    request.query = canonical_params(params);
    request.body = body;

    if method != Method::Get {
      return self.inner.execute(request, self.options).await;
    }

    let key = request_key(method, path, &request.query);
    let shared = {
      let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
      match in_flight.get(&key) {
        Some(flight) => {
          debug!(key, "joining in-flight request");
          flight.response.clone()
        }
        None => {
          let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
          let inner = Arc::clone(&self.inner);
          let options = self.options;
          let guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
          };
          // The request runs on its own task so it completes (and clears its
          // table slot) even if every waiter is dropped. The slot is inserted
          // before the lock is released, so the task cannot clear it early.
          let handle = tokio::spawn(async move {
            let _guard = guard;
            inner.execute(request, options).await
          });
          let response = async move {
            handle
              .await
              .unwrap_or_else(|e| Err(ApiError::generic(format!("request task failed: {}", e))))
          }
          .boxed()
          .shared();
          in_flight.insert(
            key,
            InFlight {
              id,
              response: response.clone(),
            },
          );
          response
        }
      }
    };

    shared.await
  }
}

impl ClientInner {
  fn finish_flight(&self, key: &str, id: u64) {
    let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    if in_flight.get(key).is_some_and(|f| f.id == id) {
      in_flight.remove(key);
    }
  }

  fn authorize(&self, request: &mut HttpRequest) {
    if let Some(token) = self.session.token() {
      request
        .headers
        .push(("Authorization".to_string(), format!("Bearer {}", token)));
    }
    request
      .headers
      .push(("Accept".to_string(), "application/json".to_string()));
  }

  async fn execute(&self, request: HttpRequest, options: RequestOptions) -> Result<HttpResponse, ApiError> {
    let mut attempt: u32 = 0;
    loop {
      let mut outgoing = request.clone();
      self.authorize(&mut outgoing);

      let (err, retry_after) = match self.transport.send(outgoing).await {
        Ok(response) if response.is_success() => {
          self.cache_response(&request, &response, options.default_ttl).await;
          return Ok(response);
        }
        Ok(response) => {
          let retryable = RETRYABLE_STATUSES.contains(&response.status);
          let retry_after = response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
          let err = ApiError::from_response(response.status, &response.body);
          (err, if retryable { Some(retry_after) } else { None })
        }
        Err(transport_err) => {
          let transient = transport_err.is_transient();
          let err = ApiError::from(transport_err);
          (err, if transient { Some(None) } else { None })
        }
      };

      let err = err
        .with_context("method", request.method.as_str())
        .with_context("path", request.path.as_str())
        .with_context("attempts", (attempt + 1).to_string());

      match retry_after {
        Some(retry_after) if attempt < options.retry.max_retries => {
          let delay = retry_after
            .map(|d| d.min(options.retry.max_delay))
            .unwrap_or_else(|| options.retry.delay_for(attempt));
          debug!(
            kind = %err.kind,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            path = %request.path,
            "retrying request"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        _ => {
          if err.kind == ErrorKind::Unauthorized {
            warn!(path = %request.path, "request unauthorized");
          }
          self.reporter.report(&err);
          return Err(err);
        }
      }
    }
  }

  async fn cache_response(&self, request: &HttpRequest, response: &HttpResponse, default_ttl: Duration) {
    if request.method != Method::Get {
      return;
    }
    let Some(freshness) = parse_freshness(response.header("cache-control"), response.header("etag"))
    else {
      return;
    };
    let Ok(body) = serde_json::from_slice::<Value>(&response.body) else {
      return;
    };

    let key = http_cache_key(&request.path, &request.query);
    let ttl = freshness.ttl(default_ttl);
    if let Err(e) = self.cache.set(&key, &body, ttl).await {
      debug!(key, error = %e, "response not cached");
    }
  }
}
