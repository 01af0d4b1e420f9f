use chrono::{DateTime, Utc};

use crate::error::ApiError;
use crate::review::{Review, ReviewFilter};
use crate::sync::{CollectionFingerprint, ReviewFingerprint};

/// Snapshot of the review state.
///
/// Replaced as a whole on every change; readers hold an `Arc` to a snapshot
/// that never changes under them.
#[derive(Debug, Clone, Default)]
pub struct AppState {
  pub reviews: Vec<Review>,
  pub selected_review: Option<Review>,
  pub filters: ReviewFilter,
  pub loading: bool,
  /// Last failure. Data from the last success is kept alongside it
  pub error: Option<ApiError>,
  pub last_fetch_time: Option<DateTime<Utc>>,
  /// Incremented on every successful list fetch and cache invalidation
  pub cache_version: u64,
  /// Restored from durable storage and not yet confirmed by a fetch
  pub provisional: bool,
}

impl AppState {
  /// Whether a full error screen is warranted instead of stale data plus an
  /// error indicator.
  pub fn show_error_screen(&self) -> bool {
    self.error.is_some() && self.reviews.is_empty() && self.selected_review.is_none()
  }

  pub fn fingerprint(&self) -> CollectionFingerprint {
    CollectionFingerprint::of(&self.reviews)
  }

  /// Equality over content: review ids with their `updated_at` and comment
  /// threads, the selected review, filters, and the loading/error flags.
  pub fn content_eq(&self, other: &AppState) -> bool {
    self.loading == other.loading
      && self.provisional == other.provisional
      && self.error == other.error
      && self.filters == other.filters
      && self.selected_review.as_ref().map(ReviewFingerprint::of)
        == other.selected_review.as_ref().map(ReviewFingerprint::of)
      && self.fingerprint() == other.fingerprint()
  }

  pub fn find_review(&self, id: &str) -> Option<&Review> {
    self.reviews.iter().find(|r| r.id == id)
  }

  /// Put `review` into the list and the selection wherever its id appears.
  pub(crate) fn with_review(&self, review: &Review) -> AppState {
    let mut next = self.clone();
    for slot in next.reviews.iter_mut().filter(|r| r.id == review.id) {
      *slot = review.clone();
    }
    if next
      .selected_review
      .as_ref()
      .is_some_and(|s| s.id == review.id)
    {
      next.selected_review = Some(review.clone());
    }
    next
  }

  /// Apply `edit` to every copy of review `id`. Copies the edit rejects are
  /// left unchanged.
  pub(crate) fn with_review_edited<F>(&self, id: &str, edit: F) -> AppState
  where
    F: Fn(&Review) -> Option<Review>,
  {
    let mut next = self.clone();
    for slot in next.reviews.iter_mut().filter(|r| r.id == id) {
      if let Some(edited) = edit(slot) {
        *slot = edited;
      }
    }
    if let Some(selected) = next.selected_review.as_mut().filter(|s| s.id == id) {
      if let Some(edited) = edit(selected) {
        *selected = edited;
      }
    }
    next
  }
}
