//! Durable key/value storage boundary and its implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Reload-surviving key/value store.
///
/// Used both by the cache's durable layer and by the store's persisted state.
/// Callers treat every error as "storage unavailable" and degrade gracefully.
pub trait DurableStore: Send + Sync {
  /// Insert or overwrite a value.
  fn put(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Fetch a value by key.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Remove a value. Missing keys are not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// Remove every value in this store.
  fn clear(&self) -> Result<()>;

  /// Enumerate all keys.
  fn keys(&self) -> Result<Vec<String>>;
}

/// Storage implementation that doesn't persist anything.
/// Used when durable caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl DurableStore for NoopStore {
  fn put(&self, _key: &str, _value: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn delete(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// Process-local store. Survives nothing, but behaves like a durable store;
/// used by tests to simulate a reload.
#[derive(Default)]
pub struct MemoryStore {
  values: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn values(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self
      .values
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl DurableStore for MemoryStore {
  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    self.values()?.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.values()?.get(key).cloned())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self.values()?.remove(key);
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.values()?.clear();
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.values()?.keys().cloned().collect())
  }
}

/// SQLite-based durable storage.
///
/// One database file holds several namespaces (cache entries, persisted store
/// state, session credential); `clear` only touches its own namespace.
#[derive(Clone)]
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
  namespace: String,
}

impl SqliteStore {
  /// Open the database at the default location.
  pub fn open(namespace: &str) -> Result<Self> {
    Self::open_at(&Self::default_path()?, namespace)
  }

  /// Open or create the database at `path`.
  pub fn open_at(path: &Path, namespace: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Arc::new(Mutex::new(conn)),
      namespace: namespace.to_string(),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Another namespace on the same connection.
  pub fn namespace(&self, namespace: &str) -> Self {
    Self {
      conn: Arc::clone(&self.conn),
      namespace: namespace.to_string(),
    }
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("revsync").join("cache.db"))
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);
"#;

impl DurableStore for SqliteStore {
  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (namespace, key, value, written_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![self.namespace, key, value],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM kv_store WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn delete(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "DELETE FROM kv_store WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self
      .conn()?
      .execute(
        "DELETE FROM kv_store WHERE namespace = ?",
        params![self.namespace],
      )
      .map_err(|e| eyre!("Failed to clear namespace {}: {}", self.namespace, e))?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store WHERE namespace = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![self.namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}
