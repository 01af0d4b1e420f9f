//! Canonical cache keys.
//!
//! Two logically identical queries must map to the same key no matter in which
//! order their fields were built, so parameters are normalized before they are
//! serialized and hashed.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Trait for query descriptors that can be turned into a cache key.
pub trait QueryKey {
  /// Stable cache key for this query.
  fn cache_key(&self) -> String;

  /// Human readable description, used in log output.
  fn description(&self) -> String;
}

/// Normalize a JSON value: object keys sorted recursively, `null` fields dropped.
///
/// Array order is preserved. Callers that treat a list as a set must sort it
/// before serializing.
pub fn canonical_json(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut fields: Vec<(&String, &Value)> = map.iter().filter(|(_, v)| !v.is_null()).collect();
      fields.sort_by(|a, b| a.0.cmp(b.0));

      let mut out = Map::new();
      for (k, v) in fields {
        out.insert(k.clone(), canonical_json(v));
      }
      Value::Object(out)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
    other => other.clone(),
  }
}

/// Serialize any parameter object into its canonical JSON string.
pub fn canonical_string<T: Serialize + ?Sized>(params: &T) -> serde_json::Result<String> {
  let value = serde_json::to_value(params)?;
  serde_json::to_string(&canonical_json(&value))
}

/// SHA256 hex digest, used for stable fixed-length keys.
pub fn hash_key(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Build `<operation>:<hash of canonical params>`.
pub fn canonical_key<T: Serialize + ?Sized>(operation: &str, params: &T) -> serde_json::Result<String> {
  let canonical = canonical_string(params)?;
  Ok(format!("{}:{}", operation, hash_key(&canonical)))
}

/// Sort query parameter pairs so their order never affects a key.
pub fn canonical_params(params: &[(String, String)]) -> Vec<(String, String)> {
  let mut sorted = params.to_vec();
  sorted.sort();
  sorted.dedup();
  sorted
}
