use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached value with its expiry metadata.
///
/// Entries are replaced as a whole on update, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  pub data: T,
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  /// Cache-wide write counter at the time the entry was stored
  pub version: u64,
}

impl<T> CacheEntry<T> {
  /// Create an entry expiring `ttl` after `stored_at`. Returns `None` when
  /// the expiry is not representable.
  pub fn new(data: T, stored_at: DateTime<Utc>, ttl: Duration, version: u64) -> Option<Self> {
    let expires_at = stored_at.checked_add_signed(ttl)?;
    Some(Self {
      data,
      stored_at,
      expires_at,
      version,
    })
  }

  /// An entry is live up to and including its expiry instant.
  pub fn is_live(&self, now: DateTime<Utc>) -> bool {
    now <= self.expires_at
  }
}
