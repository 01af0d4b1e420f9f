//! The subset of the store that survives restarts.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::state::AppState;
use crate::cache::DurableStore;
use crate::review::{Review, ReviewFilter};

pub const STATE_KEY: &str = "store:state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
  pub reviews: Vec<Review>,
  pub filters: ReviewFilter,
  pub cache_version: u64,
}

impl From<&AppState> for PersistedState {
  fn from(state: &AppState) -> Self {
    Self {
      reviews: state.reviews.clone(),
      filters: state.filters.clone(),
      cache_version: state.cache_version,
    }
  }
}

/// Whether the persisted subset differs between two snapshots.
pub(crate) fn subset_changed(prev: &AppState, next: &AppState) -> bool {
  prev.cache_version != next.cache_version
    || prev.filters != next.filters
    || prev.fingerprint() != next.fingerprint()
}

pub fn load(store: &dyn DurableStore) -> Option<PersistedState> {
  let bytes = match store.get(STATE_KEY) {
    Ok(Some(bytes)) => bytes,
    Ok(None) => return None,
    Err(e) => {
      warn!(error = %e, "could not read persisted state");
      return None;
    }
  };
  match serde_json::from_slice(&bytes) {
    Ok(state) => Some(state),
    Err(e) => {
      // Written by an incompatible version; start over
      warn!(error = %e, "discarding unreadable persisted state");
      let _ = store.delete(STATE_KEY);
      None
    }
  }
}

pub fn save(store: &dyn DurableStore, state: &PersistedState) {
  let bytes = match serde_json::to_vec(state) {
    Ok(bytes) => bytes,
    Err(e) => {
      warn!(error = %e, "could not serialize state");
      return;
    }
  };
  match store.put(STATE_KEY, &bytes) {
    Ok(()) => debug!(reviews = state.reviews.len(), version = state.cache_version, "state persisted"),
    Err(e) => warn!(error = %e, "could not persist state"),
  }
}
