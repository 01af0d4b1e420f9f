//! Freshness headers on API responses.

use std::time::Duration;

/// How long a response may be cached, derived from its headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// `Cache-Control: max-age=N` with N > 0
  MaxAge(Duration),
  /// Only an entity tag, no explicit lifetime
  Validator,
}

/// Inspect `Cache-Control` and `ETag`.
///
/// Returns `None` when the response must not be cached (`no-store`,
/// `no-cache`, `max-age=0`) or carries no freshness information at all.
pub fn parse_freshness(cache_control: Option<&str>, etag: Option<&str>) -> Option<Freshness> {
  let mut max_age = None;

  if let Some(cc) = cache_control {
    for directive in cc.split(',').map(|d| d.trim().to_ascii_lowercase()) {
      if directive == "no-store" || directive == "no-cache" {
        return None;
      }
      if let Some(value) = directive.strip_prefix("max-age=") {
        if let Ok(secs) = value.trim_matches('"').parse::<u64>() {
          max_age = Some(secs);
        }
      }
    }
  }

  match max_age {
    Some(0) => None,
    Some(secs) => Some(Freshness::MaxAge(Duration::from_secs(secs))),
    None if etag.is_some_and(|e| !e.is_empty()) => Some(Freshness::Validator),
    None => None,
  }
}

impl Freshness {
  pub fn ttl(self, default: Duration) -> Duration {
    match self {
      Freshness::MaxAge(ttl) => ttl,
      Freshness::Validator => default,
    }
  }
}
