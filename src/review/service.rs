//! Review operations with cache-first reads and write invalidation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::filter::ReviewFilter;
use super::types::{
  Comment, CommentPatch, NewComment, NewFile, NewReview, Review, ReviewFile, ReviewList, ReviewPatch,
};
use crate::cache::{QueryKey, TieredCache};
use crate::error::ApiError;
use crate::http::{http_cache_key, request_key, ApiClient, Method, HTTP_CACHE_PREFIX};

pub const REVIEWS_PATH: &str = "/api/reviews";
const LIST_PREFIX: &str = "reviews:list";
const DETAIL_PREFIX: &str = "reviews:detail";

/// Cache keys for review reads.
#[derive(Clone, Debug)]
pub enum ReviewQueryKey {
  List(ReviewFilter),
  Detail(String),
}

impl QueryKey for ReviewQueryKey {
  fn cache_key(&self) -> String {
    match self {
      Self::List(filter) => filter.cache_key(LIST_PREFIX),
      Self::Detail(id) => format!("{}:{}", DETAIL_PREFIX, id),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::List(filter) => format!("reviews: {}", filter),
      Self::Detail(id) => format!("review {}", id),
    }
  }
}

/// Whether a read may be served from the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
  #[default]
  CacheFirst,
  /// Skip the cache lookup; still writes the result through
  NetworkOnly,
}

/// Notification sent after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
  ReviewCreated(String),
  ReviewUpdated(String),
  ReviewDeleted(String),
  CommentsChanged(String),
  FilesChanged(String),
  CacheInvalidated,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
  pub list_ttl: Duration,
  pub review_ttl: Duration,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      list_ttl: Duration::from_secs(300),
      review_ttl: Duration::from_secs(600),
    }
  }
}

/// Typed review operations.
///
/// Reads check the cache first and write fresh results through. Writes
/// invalidate every cached read they could have staled:
///
/// | write | invalidates |
/// |---|---|
/// | create review | all list entries |
/// | update / delete review | the review entry and all list entries |
/// | comment or file changes | the review entry |
///
/// A read that was already on the network when an invalidation ran returns
/// its result to the caller but does not write it back.
pub struct ReviewService {
  client: ApiClient,
  cache: Arc<TieredCache>,
  config: ServiceConfig,
  events: broadcast::Sender<ServiceEvent>,
  /// Bumped by every invalidation
  invalidations: AtomicU64,
}

impl ReviewService {
  pub fn new(client: ApiClient, cache: Arc<TieredCache>, config: ServiceConfig) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      client,
      cache,
      config,
      events,
      invalidations: AtomicU64::new(0),
    }
  }

  pub fn client(&self) -> &ApiClient {
    &self.client
  }

  pub fn cache(&self) -> &Arc<TieredCache> {
    &self.cache
  }

  /// Subscribe to write notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
    self.events.subscribe()
  }

  fn emit(&self, event: ServiceEvent) {
    // No receivers is fine
    let _ = self.events.send(event);
  }

  async fn write_through<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
    if let Err(e) = self.cache.set(key, value, ttl).await {
      warn!(key, error = %e, "write-through failed");
    }
  }

  fn invalidation_epoch(&self) -> u64 {
    self.invalidations.load(Ordering::SeqCst)
  }

  /// Write a read result through unless an invalidation ran since `epoch`
  /// was taken. One that lands during the write removes the entry again.
  async fn write_through_since<T: serde::Serialize + ?Sized>(
    &self,
    epoch: u64,
    key: &str,
    value: &T,
    ttl: Duration,
  ) {
    if self.invalidation_epoch() != epoch {
      debug!(key, "not caching a read that an invalidation overtook");
      return;
    }
    self.write_through(key, value, ttl).await;
    if self.invalidation_epoch() != epoch {
      self.cache.delete(key).await;
    }
  }

  pub async fn list_reviews(
    &self,
    filter: &ReviewFilter,
    policy: FetchPolicy,
  ) -> Result<Vec<Review>, ApiError> {
    let query = ReviewQueryKey::List(filter.clone());
    let key = query.cache_key();

    if policy == FetchPolicy::CacheFirst {
      if let Some(reviews) = self.cache.get_durable::<Vec<Review>>(&key).await {
        debug!(query = %query.description(), "cache hit");
        return Ok(reviews);
      }
    }

    debug!(query = %query.description(), "fetching from network");
    let epoch = self.invalidation_epoch();
    let list: ReviewList = self.client.get(REVIEWS_PATH, &filter.to_query_params()).await?;
    let reviews = list.into_reviews();
    self
      .write_through_since(epoch, &key, &reviews, self.config.list_ttl)
      .await;
    Ok(reviews)
  }

  pub async fn get_review(&self, id: &str, policy: FetchPolicy) -> Result<Review, ApiError> {
    let query = ReviewQueryKey::Detail(id.to_string());
    let key = query.cache_key();

    if policy == FetchPolicy::CacheFirst {
      if let Some(review) = self.cache.get_durable::<Review>(&key).await {
        debug!(query = %query.description(), "cache hit");
        return Ok(review);
      }
    }

    let epoch = self.invalidation_epoch();
    let review: Review = self.client.get(&review_path(id), &[]).await?;
    self
      .write_through_since(epoch, &key, &review, self.config.review_ttl)
      .await;
    Ok(review)
  }

  pub async fn create_review(&self, new: &NewReview) -> Result<Review, ApiError> {
    let review: Review = self.client.post(REVIEWS_PATH, new).await?;
    self.invalidate_lists().await;
    self
      .write_through(
        &ReviewQueryKey::Detail(review.id.clone()).cache_key(),
        &review,
        self.config.review_ttl,
      )
      .await;
    info!(review = %review.id, "review created");
    self.emit(ServiceEvent::ReviewCreated(review.id.clone()));
    Ok(review)
  }

  pub async fn update_review(&self, id: &str, patch: &ReviewPatch) -> Result<Review, ApiError> {
    let review: Review = self.client.patch(&review_path(id), patch).await?;
    self.invalidate_review(id).await;
    self.invalidate_lists().await;
    self
      .write_through(
        &ReviewQueryKey::Detail(id.to_string()).cache_key(),
        &review,
        self.config.review_ttl,
      )
      .await;
    self.emit(ServiceEvent::ReviewUpdated(id.to_string()));
    Ok(review)
  }

  pub async fn delete_review(&self, id: &str) -> Result<(), ApiError> {
    self.client.delete(&review_path(id), &[]).await?;
    self.invalidate_review(id).await;
    self.invalidate_lists().await;
    info!(review = %id, "review deleted");
    self.emit(ServiceEvent::ReviewDeleted(id.to_string()));
    Ok(())
  }

  pub async fn add_comment(&self, review_id: &str, new: &NewComment) -> Result<Comment, ApiError> {
    let path = format!("{}/comments", review_path(review_id));
    let comment: Comment = self.client.post(&path, new).await?;
    self.invalidate_review(review_id).await;
    self.emit(ServiceEvent::CommentsChanged(review_id.to_string()));
    Ok(comment)
  }

  pub async fn update_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    patch: &CommentPatch,
  ) -> Result<Comment, ApiError> {
    let path = format!("{}/comments/{}", review_path(review_id), comment_id);
    let comment: Comment = self.client.patch(&path, patch).await?;
    self.invalidate_review(review_id).await;
    self.emit(ServiceEvent::CommentsChanged(review_id.to_string()));
    Ok(comment)
  }

  pub async fn delete_comment(&self, review_id: &str, comment_id: &str) -> Result<(), ApiError> {
    let path = format!("{}/comments/{}", review_path(review_id), comment_id);
    self.client.delete(&path, &[]).await?;
    self.invalidate_review(review_id).await;
    self.emit(ServiceEvent::CommentsChanged(review_id.to_string()));
    Ok(())
  }

  pub async fn add_file(&self, review_id: &str, file: &NewFile) -> Result<ReviewFile, ApiError> {
    let path = format!("{}/files", review_path(review_id));
    let added: ReviewFile = self.client.post(&path, file).await?;
    self.invalidate_review(review_id).await;
    self.emit(ServiceEvent::FilesChanged(review_id.to_string()));
    Ok(added)
  }

  pub async fn remove_file(&self, review_id: &str, file_path: &str) -> Result<(), ApiError> {
    let path = format!("{}/files", review_path(review_id));
    self
      .client
      .delete(&path, &[("path".to_string(), file_path.to_string())])
      .await?;
    self.invalidate_review(review_id).await;
    self.emit(ServiceEvent::FilesChanged(review_id.to_string()));
    Ok(())
  }

  /// Drop every cached list, for every filter ever used.
  pub async fn invalidate_lists(&self) {
    self.invalidations.fetch_add(1, Ordering::SeqCst);
    // List GETs still on the network must not be joined by reads issued
    // after this write
    let list_request = request_key(Method::Get, REVIEWS_PATH, &[]);
    self.client.detach_in_flight(&format!("{}?", list_request));
    self.client.detach_in_flight_exact(&list_request);
    let mut removed = self.cache.delete_prefix(&format!("{}:", LIST_PREFIX)).await;
    removed += self
      .cache
      .delete_prefix(&format!("{}?", http_cache_key(REVIEWS_PATH, &[])))
      .await;
    self.cache.delete(&http_cache_key(REVIEWS_PATH, &[])).await;
    debug!(removed, "invalidated review lists");
  }

  /// Drop the cached detail of one review.
  pub async fn invalidate_review(&self, id: &str) {
    self.invalidations.fetch_add(1, Ordering::SeqCst);
    self
      .client
      .detach_in_flight_exact(&request_key(Method::Get, &review_path(id), &[]));
    self
      .cache
      .delete(&ReviewQueryKey::Detail(id.to_string()).cache_key())
      .await;
    self.cache.delete(&http_cache_key(&review_path(id), &[])).await;
  }

  /// Drop every cached review read.
  pub async fn invalidate_all(&self) {
    self.invalidations.fetch_add(1, Ordering::SeqCst);
    self
      .client
      .detach_in_flight(&request_key(Method::Get, REVIEWS_PATH, &[]));
    self.cache.delete_prefix("reviews:").await;
    self
      .cache
      .delete_prefix(&format!("{}GET:{}", HTTP_CACHE_PREFIX, REVIEWS_PATH))
      .await;
    info!("review cache invalidated");
    self.emit(ServiceEvent::CacheInvalidated);
  }
}

fn review_path(id: &str) -> String {
  format!("{}/{}", REVIEWS_PATH, id)
}
