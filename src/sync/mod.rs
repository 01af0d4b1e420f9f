//! Keeping accessors of the review state consistent.

mod context;
mod fingerprint;
mod reconcile;

pub use context::{ContextMode, ReviewAccess, ReviewContext};
pub use fingerprint::{CollectionFingerprint, ReviewFingerprint};
pub use reconcile::{Reconciler, Side, TickOutcome, MIN_INTERVAL};
