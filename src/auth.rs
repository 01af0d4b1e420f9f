//! Session credential and the auth endpoints.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::cache::DurableStore;
use crate::error::{ApiError, ErrorKind};
use crate::http::ApiClient;

const TOKEN_KEY: &str = "session:token";

/// Holder of the bearer credential.
///
/// Shared between the HTTP client (reads) and the auth service (writes). When
/// backed by a durable store the token survives restarts.
#[derive(Clone, Default)]
pub struct Session {
  token: Arc<RwLock<Option<String>>>,
  store: Option<Arc<dyn DurableStore>>,
}

impl Session {
  pub fn in_memory() -> Self {
    Self::default()
  }

  /// Load the persisted token from `store`, if any.
  pub fn persistent(store: Arc<dyn DurableStore>) -> Self {
    let token = match store.get(TOKEN_KEY) {
      Ok(Some(bytes)) => String::from_utf8(bytes).ok(),
      Ok(None) => None,
      Err(e) => {
        warn!(error = %e, "could not read stored session");
        None
      }
    };
    Self {
      token: Arc::new(RwLock::new(token)),
      store: Some(store),
    }
  }

  pub fn token(&self) -> Option<String> {
    self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn set_token(&self, token: Option<String>) {
    if let Some(store) = &self.store {
      let result = match &token {
        Some(t) => store.put(TOKEN_KEY, t.as_bytes()),
        None => store.delete(TOKEN_KEY),
      };
      if let Err(e) = result {
        warn!(error = %e, "could not persist session");
      }
    }
    *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
  }

  pub fn is_authenticated(&self) -> bool {
    self.token().is_some()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  pub id: String,
  pub name: String,
  pub email: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
  email: &'a str,
  password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
  token: String,
  user: User,
}

/// Login/logout and profile calls under a separate base path.
#[derive(Clone)]
pub struct AuthService {
  client: ApiClient,
  base_path: String,
}

impl AuthService {
  pub fn new(client: ApiClient, base_path: impl Into<String>) -> Self {
    Self {
      client,
      base_path: base_path.into().trim_end_matches('/').to_string(),
    }
  }

  fn path(&self, suffix: &str) -> String {
    format!("{}/{}", self.base_path, suffix)
  }

  pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
    let response: LoginResponse = self
      .client
      .post(&self.path("login"), &LoginRequest { email, password })
      .await?;
    self.client.session().set_token(Some(response.token));
    info!(user = %response.user.id, "logged in");
    Ok(response.user)
  }

  /// Drop the credential. A server that already forgot the session is fine.
  pub async fn logout(&self) -> Result<(), ApiError> {
    let result = self
      .client
      .post::<_, serde_json::Value>(&self.path("logout"), &serde_json::json!({}))
      .await;
    self.client.session().set_token(None);
    match result {
      Ok(_) => Ok(()),
      Err(e) if e.kind == ErrorKind::Unauthorized => Ok(()),
      Err(e) => Err(e),
    }
  }

  pub async fn current_user(&self) -> Result<User, ApiError> {
    self.client.get(&self.path("me"), &[]).await
  }

  pub async fn update_user(&self, patch: &UserPatch) -> Result<User, ApiError> {
    self.client.patch(&self.path("me"), patch).await
  }
}
