//! Memory + durable cache with TTL expiry and a byte-bounded memory layer.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::storage::DurableStore;
use crate::clock::Clock;

/// Default memory budget (4 MiB of serialized JSON).
pub const DEFAULT_MEMORY_BUDGET: usize = 4 * 1024 * 1024;

/// Fraction of entries evicted when the memory budget is exceeded.
const EVICTION_DIVISOR: usize = 5;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("failed to serialize cache value: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("ttl must be positive and representable, got {0:?}")]
  InvalidTtl(Duration),
}

/// Counters for cache behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub entries: usize,
  pub bytes: usize,
}

struct MemoryEntry {
  entry: CacheEntry<Value>,
  size: usize,
}

#[derive(Default)]
struct MemoryLayer {
  entries: HashMap<String, MemoryEntry>,
  bytes: usize,
}

impl MemoryLayer {
  fn remove(&mut self, key: &str) -> bool {
    match self.entries.remove(key) {
      Some(old) => {
        self.bytes -= old.size;
        true
      }
      None => false,
    }
  }

  /// Evict the oldest (by `stored_at`) fifth of the entries, at least one.
  fn evict_oldest(&mut self) -> usize {
    let count = (self.entries.len() / EVICTION_DIVISOR).max(1);
    let mut by_age: Vec<(DateTime<Utc>, String)> = self
      .entries
      .iter()
      .map(|(k, e)| (e.entry.stored_at, k.clone()))
      .collect();
    by_age.sort();

    for (_, key) in by_age.into_iter().take(count) {
      self.remove(&key);
    }
    count
  }
}

/// Two-layer cache.
///
/// `get` is a synchronous memory-only fast path. `get_durable` falls back to
/// the durable layer and re-populates memory on a hit. The memory layer is
/// bounded by a byte budget; when an insert would exceed it, the oldest fifth
/// of entries by store time is evicted. This approximates LRU by store time,
/// not by access time.
///
/// Durable failures never fail an operation: they are logged and the cache
/// behaves as memory-only.
pub struct TieredCache {
  memory: Mutex<MemoryLayer>,
  durable: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  budget: usize,
  epoch: AtomicU64,
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
}

impl TieredCache {
  pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
    Self {
      memory: Mutex::new(MemoryLayer::default()),
      durable,
      clock,
      budget: DEFAULT_MEMORY_BUDGET,
      epoch: AtomicU64::new(0),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      evictions: AtomicU64::new(0),
    }
  }

  /// Set the memory layer byte budget.
  pub fn with_memory_budget(mut self, bytes: usize) -> Self {
    self.budget = bytes;
    self
  }

  /// Number of writes performed so far. Each entry records the epoch it was
  /// written in as its `version`.
  pub fn epoch(&self) -> u64 {
    self.epoch.load(Ordering::SeqCst)
  }

  pub fn stats(&self) -> CacheStats {
    let memory = self.memory();
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      entries: memory.entries.len(),
      bytes: memory.bytes,
    }
  }

  fn memory(&self) -> MutexGuard<'_, MemoryLayer> {
    // A panic while holding the lock leaves the map consistent; keep serving.
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Store `value` under `key` for `ttl`, overwriting any existing entry.
  pub async fn set<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    ttl: Duration,
  ) -> Result<(), CacheError> {
    let ttl_chrono = chrono::Duration::from_std(ttl).map_err(|_| CacheError::InvalidTtl(ttl))?;
    if ttl.is_zero() {
      return Err(CacheError::InvalidTtl(ttl));
    }

    let data = serde_json::to_value(value)?;
    let version = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let entry =
      CacheEntry::new(data, self.clock.now(), ttl_chrono, version).ok_or(CacheError::InvalidTtl(ttl))?;
    let bytes = serde_json::to_vec(&entry)?;

    self.insert_memory(key, entry, bytes.len() + key.len());

    if let Err(e) = self.durable.put(key, &bytes) {
      warn!(key, error = %e, "durable cache write failed, continuing memory-only");
    }
    Ok(())
  }

  fn insert_memory(&self, key: &str, entry: CacheEntry<Value>, size: usize) {
    let mut memory = self.memory();
    memory.remove(key);

    while memory.bytes + size > self.budget && !memory.entries.is_empty() {
      let evicted = memory.evict_oldest();
      self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
      debug!(evicted, budget = self.budget, "memory cache over budget");
    }

    memory.bytes += size;
    memory.entries.insert(key.to_string(), MemoryEntry { entry, size });
  }

  /// Synchronous memory-layer lookup. Expired entries are evicted from both
  /// layers and reported as absent.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let now = self.clock.now();
    let data = {
      let mut memory = self.memory();
      match memory.entries.get(key) {
        Some(m) if m.entry.is_live(now) => Some(m.entry.data.clone()),
        Some(_) => {
          memory.remove(key);
          None
        }
        None => {
          self.misses.fetch_add(1, Ordering::Relaxed);
          return None;
        }
      }
    };

    match data {
      Some(data) => self.decode(key, data),
      None => {
        debug!(key, "cache entry expired");
        self.delete_durable(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  /// Lookup that falls back to the durable layer on a memory miss.
  pub async fn get_durable<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let now = self.clock.now();
    {
      let mut memory = self.memory();
      if let Some(m) = memory.entries.get(key) {
        if m.entry.is_live(now) {
          let data = m.entry.data.clone();
          drop(memory);
          return self.decode(key, data);
        }
        memory.remove(key);
        drop(memory);
        debug!(key, "cache entry expired");
        self.delete_durable(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        return None;
      }
    }

    let bytes = match self.durable.get(key) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        return None;
      }
      Err(e) => {
        warn!(key, error = %e, "durable cache read failed");
        self.misses.fetch_add(1, Ordering::Relaxed);
        return None;
      }
    };

    let entry: CacheEntry<Value> = match serde_json::from_slice(&bytes) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "discarding unreadable durable cache entry");
        self.delete_durable(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        return None;
      }
    };

    if !entry.is_live(now) {
      debug!(key, "durable cache entry expired");
      self.delete_durable(key);
      self.misses.fetch_add(1, Ordering::Relaxed);
      return None;
    }

    let data = entry.data.clone();
    self.insert_memory(key, entry, bytes.len() + key.len());
    self.decode(key, data)
  }

  fn decode<T: DeserializeOwned>(&self, key: &str, data: Value) -> Option<T> {
    match serde_json::from_value(data) {
      Ok(value) => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
      }
      Err(e) => {
        debug!(key, error = %e, "cached value has unexpected shape");
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  fn delete_durable(&self, key: &str) {
    if let Err(e) = self.durable.delete(key) {
      warn!(key, error = %e, "durable cache delete failed");
    }
  }

  /// Remove `key` from both layers.
  pub async fn delete(&self, key: &str) {
    self.memory().remove(key);
    self.delete_durable(key);
  }

  /// Remove every key starting with `prefix` from both layers, including
  /// durable entries written by earlier sessions. Returns the number of keys
  /// removed.
  pub async fn delete_prefix(&self, prefix: &str) -> usize {
    let mut removed: Vec<String> = {
      let mut memory = self.memory();
      let keys: Vec<String> = memory
        .entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      for key in &keys {
        memory.remove(key);
      }
      keys
    };

    match self.durable.keys() {
      Ok(keys) => {
        for key in keys.into_iter().filter(|k| k.starts_with(prefix)) {
          self.delete_durable(&key);
          if !removed.contains(&key) {
            removed.push(key);
          }
        }
      }
      Err(e) => warn!(prefix, error = %e, "durable cache key listing failed"),
    }

    removed.len()
  }

  /// Empty both layers.
  pub async fn clear(&self) {
    {
      let mut memory = self.memory();
      memory.entries.clear();
      memory.bytes = 0;
    }
    if let Err(e) = self.durable.clear() {
      warn!(error = %e, "durable cache clear failed");
    }
  }

  /// Evict every expired entry from both layers. Returns the number of
  /// distinct keys removed.
  pub async fn sweep(&self) -> usize {
    let now = self.clock.now();

    let mut removed: HashSet<String> = {
      let mut memory = self.memory();
      let expired: HashSet<String> = memory
        .entries
        .iter()
        .filter(|(_, m)| !m.entry.is_live(now))
        .map(|(k, _)| k.clone())
        .collect();
      for key in &expired {
        memory.remove(key);
      }
      expired
    };

    match self.durable.keys() {
      Ok(keys) => {
        for key in keys {
          let live = match self.durable.get(&key) {
            Ok(Some(bytes)) => serde_json::from_slice::<CacheEntry<Value>>(&bytes)
              .map(|e| e.is_live(now))
              .unwrap_or(false),
            Ok(None) => continue,
            Err(e) => {
              warn!(key, error = %e, "durable cache sweep read failed");
              continue;
            }
          };
          if !live {
            self.delete_durable(&key);
            removed.insert(key);
          }
        }
      }
      Err(e) => warn!(error = %e, "durable cache sweep skipped"),
    }

    if !removed.is_empty() {
      debug!(removed = removed.len(), "cache sweep evicted expired entries");
    }
    removed.len()
  }

  /// Run `sweep` every `interval` until the cache is dropped or the handle
  /// is aborted.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      // First tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match weak.upgrade() {
          Some(cache) => {
            cache.sweep().await;
          }
          None => break,
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStore;
  use crate::clock::ManualClock;
  use color_eyre::eyre::eyre;

  struct BrokenStore;

  impl DurableStore for BrokenStore {
    fn put(&self, _key: &str, _value: &[u8]) -> color_eyre::Result<()> {
      Err(eyre!("storage disabled"))
    }
    fn get(&self, _key: &str) -> color_eyre::Result<Option<Vec<u8>>> {
      Err(eyre!("storage disabled"))
    }
    fn delete(&self, _key: &str) -> color_eyre::Result<()> {
      Err(eyre!("storage disabled"))
    }
    fn clear(&self) -> color_eyre::Result<()> {
      Err(eyre!("storage disabled"))
    }
    fn keys(&self) -> color_eyre::Result<Vec<String>> {
      Err(eyre!("storage disabled"))
    }
  }

  fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, TieredCache) {
    let durable = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let cache = TieredCache::new(durable.clone(), clock.clone());
    (durable, clock, cache)
  }

  #[tokio::test]
  async fn test_set_then_get() {
    let (_, _, cache) = setup();
    cache.set("k", &vec![1, 2, 3], Duration::from_secs(5)).await.unwrap();
    assert_eq!(cache.get::<Vec<i32>>("k"), Some(vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_expired_entry_removed_from_both_layers() {
    let (durable, clock, cache) = setup();
    cache.set("k", &"v", Duration::from_secs(5)).await.unwrap();
    assert!(durable.get("k").unwrap().is_some());

    clock.advance(chrono::Duration::seconds(6));
    assert_eq!(cache.get::<String>("k"), None);
    assert!(durable.get("k").unwrap().is_none());
    assert_eq!(cache.stats().entries, 0);
  }

  #[tokio::test]
  async fn test_zero_ttl_rejected() {
    let (_, _, cache) = setup();
    let result = cache.set("k", &1, Duration::ZERO).await;
    assert!(matches!(result, Err(CacheError::InvalidTtl(_))));
  }

  #[tokio::test]
  async fn test_ttl_past_calendar_range_rejected() {
    let (durable, _, cache) = setup();
    let result = cache.set("k", &1, Duration::from_secs(9_000_000_000_000)).await;
    assert!(matches!(result, Err(CacheError::InvalidTtl(_))));
    assert_eq!(cache.get::<i32>("k"), None);
    assert!(durable.get("k").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_get_durable_repopulates_memory() {
    let durable = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    {
      let cache = TieredCache::new(durable.clone(), clock.clone());
      cache.set("k", &"persisted", Duration::from_secs(60)).await.unwrap();
    }

    // Fresh cache over the same durable store, as after a reload
    let cache = TieredCache::new(durable.clone(), clock.clone());
    assert_eq!(cache.get::<String>("k"), None);
    assert_eq!(cache.get_durable::<String>("k").await, Some("persisted".to_string()));
    assert_eq!(cache.get::<String>("k"), Some("persisted".to_string()));
  }

  #[tokio::test]
  async fn test_get_durable_evicts_expired_durable_entry() {
    let durable = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    {
      let cache = TieredCache::new(durable.clone(), clock.clone());
      cache.set("k", &1, Duration::from_secs(1)).await.unwrap();
    }
    clock.advance(chrono::Duration::seconds(2));

    let cache = TieredCache::new(durable.clone(), clock.clone());
    assert_eq!(cache.get_durable::<i32>("k").await, None);
    assert!(durable.get("k").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_delete_and_clear() {
    let (durable, _, cache) = setup();
    cache.set("a", &1, Duration::from_secs(60)).await.unwrap();
    cache.set("b", &2, Duration::from_secs(60)).await.unwrap();

    cache.delete("a").await;
    cache.delete("missing").await;
    assert_eq!(cache.get::<i32>("a"), None);
    assert!(durable.get("a").unwrap().is_none());

    cache.clear().await;
    assert_eq!(cache.get_durable::<i32>("b").await, None);
    assert!(durable.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_delete_prefix_reaches_durable_only_keys() {
    let durable = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    {
      let old = TieredCache::new(durable.clone(), clock.clone());
      old.set("reviews:list:aaa", &1, Duration::from_secs(60)).await.unwrap();
    }
    let cache = TieredCache::new(durable.clone(), clock.clone());
    cache.set("reviews:list:bbb", &2, Duration::from_secs(60)).await.unwrap();
    cache.set("reviews:detail:1", &3, Duration::from_secs(60)).await.unwrap();

    assert_eq!(cache.delete_prefix("reviews:list:").await, 2);
    assert_eq!(cache.get_durable::<i32>("reviews:list:aaa").await, None);
    assert_eq!(cache.get_durable::<i32>("reviews:list:bbb").await, None);
    assert_eq!(cache.get_durable::<i32>("reviews:detail:1").await, Some(3));
  }

  #[tokio::test]
  async fn test_budget_evicts_oldest_fifth() {
    let durable = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let probe = serde_json::to_vec(&CacheEntry::new(0u8, clock.now(), chrono::Duration::seconds(60), 1).unwrap())
      .unwrap()
      .len();
    // Room for roughly ten small entries
    let cache = TieredCache::new(durable, clock.clone()).with_memory_budget((probe + 8) * 10);

    for i in 0..10u8 {
      cache.set(&format!("k{}", i), &i, Duration::from_secs(60)).await.unwrap();
      clock.advance(chrono::Duration::seconds(1));
    }
    cache.set("k10", &10u8, Duration::from_secs(60)).await.unwrap();

    assert!(cache.stats().evictions >= 1);
    assert_eq!(cache.get::<u8>("k0"), None);
    assert_eq!(cache.get::<u8>("k10"), Some(10));
    assert!(cache.stats().bytes <= (probe + 8) * 10);
  }

  #[tokio::test]
  async fn test_sweep_removes_expired_everywhere() {
    let (durable, clock, cache) = setup();
    cache.set("short", &1, Duration::from_secs(1)).await.unwrap();
    cache.set("long", &2, Duration::from_secs(100)).await.unwrap();
    clock.advance(chrono::Duration::seconds(5));

    assert_eq!(cache.sweep().await, 1);
    assert!(durable.get("short").unwrap().is_none());
    assert!(durable.get("long").unwrap().is_some());
    assert_eq!(cache.stats().entries, 1);
  }

  #[tokio::test]
  async fn test_sweep_counts_durable_only_keys() {
    let durable = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    {
      let old = TieredCache::new(durable.clone(), clock.clone());
      old.set("old", &1, Duration::from_secs(1)).await.unwrap();
    }
    let cache = TieredCache::new(durable.clone(), clock.clone());
    cache.set("new", &2, Duration::from_secs(1)).await.unwrap();
    clock.advance(chrono::Duration::seconds(2));

    assert_eq!(cache.sweep().await, 2);
    assert!(durable.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sweeper_runs_on_its_interval() {
    let durable = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let cache = Arc::new(TieredCache::new(durable.clone(), clock.clone()));
    cache.set("short", &1, Duration::from_secs(1)).await.unwrap();
    cache.set("long", &2, Duration::from_secs(100)).await.unwrap();
    clock.advance(chrono::Duration::seconds(5));

    let handle = cache.spawn_sweeper(Duration::from_millis(10));
    let mut swept = false;
    for _ in 0..100 {
      tokio::time::sleep(Duration::from_millis(10)).await;
      if durable.get("short").unwrap().is_none() {
        swept = true;
        break;
      }
    }
    handle.abort();

    assert!(swept);
    assert_eq!(cache.stats().entries, 1);
    assert!(durable.get("long").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_sweeper_stops_when_cache_dropped() {
    let cache = Arc::new(TieredCache::new(Arc::new(MemoryStore::new()), Arc::new(ManualClock::default())));
    let handle = cache.spawn_sweeper(Duration::from_millis(5));
    drop(cache);
    tokio::time::timeout(Duration::from_secs(2), handle)
      .await
      .expect("sweeper should exit")
      .unwrap();
  }

  #[tokio::test]
  async fn test_broken_durable_layer_degrades_to_memory() {
    let cache = TieredCache::new(Arc::new(BrokenStore), Arc::new(ManualClock::default()));
    cache.set("k", &"v", Duration::from_secs(5)).await.unwrap();
    assert_eq!(cache.get_durable::<String>("k").await, Some("v".to_string()));
    assert_eq!(cache.get_durable::<String>("missing").await, None);
    cache.delete("k").await;
    assert_eq!(cache.delete_prefix("k").await, 0);
    cache.clear().await;
    assert_eq!(cache.sweep().await, 0);
  }
}
