//! Normalized API errors, the error-listener registry and recent error history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::TransportError;

/// Classification of every failure that crosses from the HTTP client into the
/// service and store layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
  Timeout,
  Network,
  /// 4xx with field information
  Validation,
  Unauthorized,
  Forbidden,
  NotFound,
  Conflict,
  RateLimit,
  ServerError,
  ServiceUnavailable,
  /// Non-HTTP failure (decoding, task failure, ...)
  Generic,
  Unknown,
}

impl ErrorKind {
  pub fn from_status(status: u16) -> Self {
    match status {
      400 | 422 => ErrorKind::Validation,
      401 => ErrorKind::Unauthorized,
      403 => ErrorKind::Forbidden,
      404 => ErrorKind::NotFound,
      408 => ErrorKind::Timeout,
      409 => ErrorKind::Conflict,
      429 => ErrorKind::RateLimit,
      503 => ErrorKind::ServiceUnavailable,
      500..=599 => ErrorKind::ServerError,
      _ => ErrorKind::Unknown,
    }
  }

  /// Kinds the HTTP client retries before surfacing.
  pub fn is_transient(self) -> bool {
    matches!(
      self,
      ErrorKind::Timeout
        | ErrorKind::Network
        | ErrorKind::RateLimit
        | ErrorKind::ServerError
        | ErrorKind::ServiceUnavailable
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ErrorKind::Timeout => "TIMEOUT",
      ErrorKind::Network => "NETWORK",
      ErrorKind::Validation => "VALIDATION",
      ErrorKind::Unauthorized => "UNAUTHORIZED",
      ErrorKind::Forbidden => "FORBIDDEN",
      ErrorKind::NotFound => "NOT_FOUND",
      ErrorKind::Conflict => "CONFLICT",
      ErrorKind::RateLimit => "RATE_LIMIT",
      ErrorKind::ServerError => "SERVER_ERROR",
      ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
      ErrorKind::Generic => "GENERIC",
      ErrorKind::Unknown => "UNKNOWN",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A normalized error.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
  pub kind: ErrorKind,
  pub message: String,
  /// Where the error came from (method, path, attempt, ...)
  #[serde(default)]
  pub context: BTreeMap<String, String>,
  pub status: Option<u16>,
  /// Per-field messages for validation failures
  #[serde(default)]
  pub field_errors: BTreeMap<String, Vec<String>>,
  pub timestamp: DateTime<Utc>,
}

impl ApiError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      context: BTreeMap::new(),
      status: None,
      field_errors: BTreeMap::new(),
      timestamp: Utc::now(),
    }
  }

  pub fn generic(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Generic, message)
  }

  pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
    self.context.insert(key.to_string(), value.into());
    self
  }

  /// Build an error from a non-success HTTP response.
  ///
  /// The body is inspected for a `message` and for field errors under
  /// `errors` or `fieldErrors` (either `{field: [msg]}` or `{field: msg}`).
  pub fn from_response(status: u16, body: &[u8]) -> Self {
    let kind = ErrorKind::from_status(status);
    let parsed: Option<Value> = serde_json::from_slice(body).ok();

    let message = parsed
      .as_ref()
      .and_then(|v| v.get("message").or_else(|| v.get("error")))
      .and_then(|m| m.as_str())
      .map(String::from)
      .unwrap_or_else(|| format!("request failed with status {}", status));

    let field_errors = parsed
      .as_ref()
      .and_then(|v| v.get("fieldErrors").or_else(|| v.get("errors")))
      .and_then(|v| v.as_object())
      .map(|fields| {
        fields
          .iter()
          .map(|(field, msgs)| {
            let msgs = match msgs {
              Value::Array(items) => items
                .iter()
                .filter_map(|m| m.as_str().map(String::from))
                .collect(),
              Value::String(s) => vec![s.clone()],
              _ => Vec::new(),
            };
            (field.clone(), msgs)
          })
          .collect()
      })
      .unwrap_or_default();

    Self {
      status: Some(status),
      field_errors,
      ..Self::new(kind, message)
    }
  }
}

impl From<TransportError> for ApiError {
  fn from(err: TransportError) -> Self {
    let kind = match &err {
      TransportError::Timeout(_) => ErrorKind::Timeout,
      TransportError::Connect(_) => ErrorKind::Network,
      TransportError::Other(_) => ErrorKind::Unknown,
    };
    ApiError::new(kind, err.to_string())
  }
}

/// Details shown to the user. Currently the normalized error itself.
pub type ErrorDetails = ApiError;

/// Callback receiving every reported error.
pub type ErrorListener = Arc<dyn Fn(&ApiError) -> color_eyre::Result<()> + Send + Sync>;

/// Handle returned by `ErrorReporter::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Default number of errors kept in history.
pub const DEFAULT_HISTORY: usize = 50;

/// Registry of error listeners plus a bounded history of recent errors.
///
/// Listener failures (returned errors or panics) are logged and never reach
/// the call site that reported the error.
pub struct ErrorReporter {
  listeners: Mutex<Vec<(ListenerId, ErrorListener)>>,
  history: Mutex<VecDeque<ApiError>>,
  capacity: usize,
  next_id: AtomicU64,
}

impl Default for ErrorReporter {
  fn default() -> Self {
    Self::with_capacity(DEFAULT_HISTORY)
  }
}

impl ErrorReporter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      listeners: Mutex::new(Vec::new()),
      history: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity,
      next_id: AtomicU64::new(1),
    }
  }

  pub fn subscribe<F>(&self, listener: F) -> ListenerId
  where
    F: Fn(&ApiError) -> color_eyre::Result<()> + Send + Sync + 'static,
  {
    let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push((id, Arc::new(listener)));
    id
  }

  pub fn unsubscribe(&self, id: ListenerId) -> bool {
    let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
    let before = listeners.len();
    listeners.retain(|(lid, _)| *lid != id);
    listeners.len() != before
  }

  /// Record `error` in history and notify every listener.
  pub fn report(&self, error: &ApiError) {
    debug!(kind = %error.kind, message = %error.message, "api error");
    {
      let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
      if self.capacity > 0 {
        while history.len() >= self.capacity {
          history.pop_front();
        }
        history.push_back(error.clone());
      }
    }

    // Listeners run outside the lock so they may subscribe/unsubscribe.
    let listeners: Vec<ErrorListener> = self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|(_, l)| Arc::clone(l))
      .collect();

    for listener in listeners {
      match catch_unwind(AssertUnwindSafe(|| listener(error))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "error listener failed"),
        Err(_) => warn!("error listener panicked"),
      }
    }
  }

  /// Recent errors, oldest first.
  pub fn history(&self) -> Vec<ApiError> {
    self
      .history
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .cloned()
      .collect()
  }

  pub fn clear_history(&self) {
    self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
  }
}
