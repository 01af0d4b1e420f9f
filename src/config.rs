use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_MEMORY_BUDGET;
use crate::http::RetryPolicy;
use crate::review::ServiceConfig;
use crate::sync::ContextMode;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub http: HttpConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the review server, e.g. "https://reviews.example.com"
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub list_ttl_secs: u64,
  pub review_ttl_secs: u64,
  /// TTL for responses that only carry an entity tag
  pub default_http_ttl_secs: u64,
  pub memory_budget_bytes: usize,
  pub sweep_interval_secs: u64,
  /// Keep cached data and state on disk between runs
  pub durable: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      list_ttl_secs: 300,
      review_ttl_secs: 600,
      default_http_ttl_secs: 60,
      memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
      sweep_interval_secs: 60,
      durable: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 250,
      max_delay_ms: 8000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// delegate: one shared state; independent: the context keeps its own
  pub mode: ContextMode,
  pub reconcile_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      mode: ContextMode::Delegate,
      reconcile_interval_secs: 5,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./revsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/revsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/revsync/config.yaml\n\
                 with at least:\n  api:\n    url: https://reviews.example.com"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("revsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("revsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.api.url).map_err(|e| eyre!("api.url {:?} is not a URL: {}", self.api.url, e))?;
    if self.cache.list_ttl_secs == 0 || self.cache.review_ttl_secs == 0 {
      return Err(eyre!("cache TTLs must be positive"));
    }
    if self.http.base_delay_ms > self.http.max_delay_ms {
      return Err(eyre!("http.base_delay_ms must not exceed http.max_delay_ms"));
    }
    Ok(())
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.http.max_retries,
      base_delay: Duration::from_millis(self.http.base_delay_ms),
      max_delay: Duration::from_millis(self.http.max_delay_ms),
    }
  }

  pub fn service_config(&self) -> ServiceConfig {
    ServiceConfig {
      list_ttl: Duration::from_secs(self.cache.list_ttl_secs),
      review_ttl: Duration::from_secs(self.cache.review_ttl_secs),
    }
  }

  pub fn default_http_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.default_http_ttl_secs.max(1))
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.cache.sweep_interval_secs.max(1))
  }

  pub fn reconcile_interval(&self) -> Duration {
    Duration::from_secs(self.sync.reconcile_interval_secs)
  }

  /// Get the API token from the environment.
  ///
  /// Checks REVSYNC_TOKEN. When set it takes precedence over the stored
  /// session.
  pub fn get_api_token() -> Option<String> {
    std::env::var("REVSYNC_TOKEN").ok().filter(|t| !t.is_empty())
  }

  /// Get the login password from the environment.
  ///
  /// Checks REVSYNC_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("REVSYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set the REVSYNC_PASSWORD environment variable."))
  }
}
