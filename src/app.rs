//! Construction and lifetime of the long-lived services.

use color_eyre::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthService, Session};
use crate::cache::{DurableStore, MemoryStore, SqliteStore, TieredCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::ErrorReporter;
use crate::http::{ApiClient, ReqwestTransport, Transport};
use crate::review::ReviewService;
use crate::store::ReviewStore;
use crate::sync::{ContextMode, Reconciler, ReviewAccess, ReviewContext};

const AUTH_PATH: &str = "/api/auth";

/// Durable stores, one per concern so that clearing the cache leaves the
/// session and the persisted state alone.
pub struct Durables {
  pub cache: Arc<dyn DurableStore>,
  pub state: Arc<dyn DurableStore>,
  pub session: Arc<dyn DurableStore>,
}

impl Durables {
  /// Namespaces of the SQLite database in the data directory.
  pub fn sqlite() -> Result<Self> {
    let cache = SqliteStore::open("cache")?;
    Ok(Self {
      state: Arc::new(cache.namespace("state")),
      session: Arc::new(cache.namespace("session")),
      cache: Arc::new(cache),
    })
  }

  pub fn in_memory() -> Self {
    Self {
      cache: Arc::new(MemoryStore::new()),
      state: Arc::new(MemoryStore::new()),
      session: Arc::new(MemoryStore::new()),
    }
  }
}

/// Application services wired together.
///
/// Everything is constructed here and passed down explicitly; there are no
/// process-wide singletons.
pub struct App {
  config: Config,
  cache: Arc<TieredCache>,
  reporter: Arc<ErrorReporter>,
  auth: AuthService,
  service: Arc<ReviewService>,
  store: ReviewStore,
  context: ReviewContext,
  background: Vec<JoinHandle<()>>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let transport = Arc::new(ReqwestTransport::new(&config.api.url, config.timeout())?);
    let durables = if config.cache.durable {
      Durables::sqlite()?
    } else {
      Durables::in_memory()
    };
    Ok(Self::with_parts(config, transport, durables, Arc::new(SystemClock)))
  }

  pub fn with_parts(
    config: Config,
    transport: Arc<dyn Transport>,
    durables: Durables,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let cache = Arc::new(
      TieredCache::new(durables.cache, Arc::clone(&clock))
        .with_memory_budget(config.cache.memory_budget_bytes),
    );
    let reporter = Arc::new(ErrorReporter::new());

    let session = match Config::get_api_token() {
      Some(token) => {
        debug!("using token from environment");
        let session = Session::in_memory();
        session.set_token(Some(token));
        session
      }
      None => Session::persistent(durables.session),
    };

    let client = ApiClient::new(transport, session, Arc::clone(&cache), Arc::clone(&reporter))
      .with_retry(config.retry_policy())
      .with_default_ttl(config.default_http_ttl());
    let auth = AuthService::new(client.clone(), AUTH_PATH);
    let service = Arc::new(ReviewService::new(client, Arc::clone(&cache), config.service_config()));
    let store = ReviewStore::persistent(Arc::clone(&service), clock, durables.state);
    let context = ReviewContext::new(&store, config.sync.mode);

    Self {
      config,
      cache,
      reporter,
      auth,
      service,
      store,
      context,
      background: Vec::new(),
    }
  }

  /// Restore persisted state and start the background tasks: the cache
  /// sweeper, a network refresh of restored data and, for independent
  /// contexts, the reconciler.
  pub fn start(&mut self) -> bool {
    let restored = self.store.restore();
    if restored {
      let store = self.store.clone();
      self.background.push(tokio::spawn(async move {
        match store.refresh().await {
          Ok(reviews) => debug!(reviews = reviews.len(), "replaced restored reviews"),
          Err(e) => warn!(error = %e, "refresh of restored reviews failed"),
        }
      }));
    }

    self
      .background
      .push(self.cache.spawn_sweeper(self.config.sweep_interval()));

    if let Some(reconciler) =
      Reconciler::new(&self.store, &self.context, self.config.reconcile_interval())
    {
      info!(interval = ?reconciler.interval(), "starting reconciler");
      self.background.push(reconciler.spawn(self.service.subscribe()));
    }
    restored
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &Arc<TieredCache> {
    &self.cache
  }

  pub fn reporter(&self) -> &Arc<ErrorReporter> {
    &self.reporter
  }

  pub fn auth(&self) -> &AuthService {
    &self.auth
  }

  pub fn service(&self) -> &Arc<ReviewService> {
    &self.service
  }

  pub fn store(&self) -> &ReviewStore {
    &self.store
  }

  /// The accessor commands go through.
  pub fn reviews(&self) -> &dyn ReviewAccess {
    &self.context
  }

  pub fn mode(&self) -> ContextMode {
    self.context.mode()
  }
}

impl Drop for App {
  fn drop(&mut self) {
    for handle in self.background.drain(..) {
      handle.abort();
    }
  }
}
