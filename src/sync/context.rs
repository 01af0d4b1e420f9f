//! Alternate accessor over the review state.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::review::{
  Comment, CommentPatch, FetchPolicy, NewComment, NewReview, Review, ReviewFilter, ReviewPatch,
};
use crate::store::{AppState, ReviewStore};

/// The operations shared by the global store and a context.
#[async_trait]
pub trait ReviewAccess: Send + Sync {
  fn state(&self) -> Arc<AppState>;
  fn set_reviews(&self, reviews: Vec<Review>);
  fn select_review(&self, id: Option<&str>) -> bool;
  fn set_filters(&self, filters: ReviewFilter);
  fn clear_filters(&self);
  fn cancel_pending(&self);

  async fn fetch_reviews(&self, policy: FetchPolicy) -> Result<Vec<Review>, ApiError>;
  async fn fetch_review(&self, id: &str, policy: FetchPolicy) -> Result<Review, ApiError>;
  async fn add_review(&self, new: &NewReview) -> Result<Review, ApiError>;
  async fn update_review(&self, id: &str, patch: &ReviewPatch) -> Result<Review, ApiError>;
  async fn remove_review(&self, id: &str) -> Result<(), ApiError>;
  async fn add_comment(&self, review_id: &str, new: &NewComment) -> Result<Comment, ApiError>;
  async fn update_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    patch: &CommentPatch,
  ) -> Result<Comment, ApiError>;
  async fn resolve_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    resolved: bool,
  ) -> Result<Comment, ApiError>;
  async fn delete_comment(&self, review_id: &str, comment_id: &str) -> Result<(), ApiError>;
  async fn invalidate_cache(&self);
}

#[async_trait]
impl ReviewAccess for ReviewStore {
  fn state(&self) -> Arc<AppState> {
    ReviewStore::state(self)
  }

  fn set_reviews(&self, reviews: Vec<Review>) {
    ReviewStore::set_reviews(self, reviews)
  }

  fn select_review(&self, id: Option<&str>) -> bool {
    ReviewStore::select_review(self, id)
  }

  fn set_filters(&self, filters: ReviewFilter) {
    ReviewStore::set_filters(self, filters)
  }

  fn clear_filters(&self) {
    ReviewStore::clear_filters(self)
  }

  fn cancel_pending(&self) {
    ReviewStore::cancel_pending(self)
  }

  async fn fetch_reviews(&self, policy: FetchPolicy) -> Result<Vec<Review>, ApiError> {
    ReviewStore::fetch_reviews(self, policy).await
  }

  async fn fetch_review(&self, id: &str, policy: FetchPolicy) -> Result<Review, ApiError> {
    ReviewStore::fetch_review(self, id, policy).await
  }

  async fn add_review(&self, new: &NewReview) -> Result<Review, ApiError> {
    ReviewStore::add_review(self, new).await
  }

  async fn update_review(&self, id: &str, patch: &ReviewPatch) -> Result<Review, ApiError> {
    ReviewStore::update_review(self, id, patch).await
  }

  async fn remove_review(&self, id: &str) -> Result<(), ApiError> {
    ReviewStore::remove_review(self, id).await
  }

  async fn add_comment(&self, review_id: &str, new: &NewComment) -> Result<Comment, ApiError> {
    ReviewStore::add_comment(self, review_id, new).await
  }

  async fn update_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    patch: &CommentPatch,
  ) -> Result<Comment, ApiError> {
    ReviewStore::update_comment(self, review_id, comment_id, patch).await
  }

  async fn resolve_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    resolved: bool,
  ) -> Result<Comment, ApiError> {
    ReviewStore::resolve_comment(self, review_id, comment_id, resolved).await
  }

  async fn delete_comment(&self, review_id: &str, comment_id: &str) -> Result<(), ApiError> {
    ReviewStore::delete_comment(self, review_id, comment_id).await
  }

  async fn invalidate_cache(&self) {
    ReviewStore::invalidate_cache(self).await
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
  /// Read and write through the global store
  #[default]
  Delegate,
  /// Keep a private copy fed through the review service
  Independent,
}

/// A view of the review state with the same operations as the global store.
///
/// In delegate mode every call, reads included, goes to the global store, so
/// the context never holds state of its own. In independent mode the context
/// owns a separate, non-persisted store on the same service. The mode cannot
/// change after construction.
pub struct ReviewContext {
  mode: ContextMode,
  target: ReviewStore,
}

impl ReviewContext {
  pub fn new(global: &ReviewStore, mode: ContextMode) -> Self {
    let target = match mode {
      ContextMode::Delegate => global.clone(),
      ContextMode::Independent => {
        debug!("context keeps an independent review state");
        ReviewStore::new(Arc::clone(global.service()), Arc::clone(global.clock()))
      }
    };
    Self { mode, target }
  }

  pub fn mode(&self) -> ContextMode {
    self.mode
  }

  /// The private store of an independent context.
  pub fn local_store(&self) -> Option<&ReviewStore> {
    match self.mode {
      ContextMode::Delegate => None,
      ContextMode::Independent => Some(&self.target),
    }
  }
}

#[async_trait]
impl ReviewAccess for ReviewContext {
  fn state(&self) -> Arc<AppState> {
    self.target.state()
  }

  fn set_reviews(&self, reviews: Vec<Review>) {
    self.target.set_reviews(reviews)
  }

  fn select_review(&self, id: Option<&str>) -> bool {
    self.target.select_review(id)
  }

  fn set_filters(&self, filters: ReviewFilter) {
    self.target.set_filters(filters)
  }

  fn clear_filters(&self) {
    self.target.clear_filters()
  }

  fn cancel_pending(&self) {
    self.target.cancel_pending()
  }

  async fn fetch_reviews(&self, policy: FetchPolicy) -> Result<Vec<Review>, ApiError> {
    self.target.fetch_reviews(policy).await
  }

  async fn fetch_review(&self, id: &str, policy: FetchPolicy) -> Result<Review, ApiError> {
    self.target.fetch_review(id, policy).await
  }

  async fn add_review(&self, new: &NewReview) -> Result<Review, ApiError> {
    self.target.add_review(new).await
  }

  async fn update_review(&self, id: &str, patch: &ReviewPatch) -> Result<Review, ApiError> {
    self.target.update_review(id, patch).await
  }

  async fn remove_review(&self, id: &str) -> Result<(), ApiError> {
    self.target.remove_review(id).await
  }

  async fn add_comment(&self, review_id: &str, new: &NewComment) -> Result<Comment, ApiError> {
    self.target.add_comment(review_id, new).await
  }

  async fn update_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    patch: &CommentPatch,
  ) -> Result<Comment, ApiError> {
    self.target.update_comment(review_id, comment_id, patch).await
  }

  async fn resolve_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    resolved: bool,
  ) -> Result<Comment, ApiError> {
    self.target.resolve_comment(review_id, comment_id, resolved).await
  }

  async fn delete_comment(&self, review_id: &str, comment_id: &str) -> Result<(), ApiError> {
    self.target.delete_comment(review_id, comment_id).await
  }

  async fn invalidate_cache(&self) {
    self.target.invalidate_cache().await
  }
}
