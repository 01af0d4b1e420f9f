//! Global review state.
//!
//! This module provides:
//! - `AppState` snapshots replaced atomically on every change
//! - Subscriptions with optional equality to skip redundant notifications
//! - A persisted subset restored as provisional data after a restart
//! - Generation counters so late fetch results cannot overwrite newer state

mod persist;
mod review_store;
mod state;

pub use persist::{load, save, PersistedState, STATE_KEY};
pub use review_store::{ReviewStore, StateEquality, StateListener, SubscriptionId};
pub use state::AppState;
