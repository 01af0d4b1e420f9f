//! Two-layer cache for API data.
//!
//! This module provides:
//! - Canonical cache keys that ignore parameter ordering
//! - A bounded in-memory layer with a synchronous fast path
//! - A durable layer mirrored on every write and consulted on memory misses
//! - TTL expiry on access plus a periodic background sweep

mod entry;
mod key;
mod storage;
mod tiered;

pub use entry::CacheEntry;
pub use key::{canonical_json, canonical_key, canonical_params, canonical_string, hash_key, QueryKey};
pub use storage::{DurableStore, MemoryStore, NoopStore, SqliteStore};
pub use tiered::{CacheError, CacheStats, TieredCache, DEFAULT_MEMORY_BUDGET};
