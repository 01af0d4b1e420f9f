//! The authoritative review state container.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::persist::{self, subset_changed, PersistedState};
use super::state::AppState;
use crate::cache::DurableStore;
use crate::clock::Clock;
use crate::error::ApiError;
use crate::review::{
  Comment, CommentPatch, FetchPolicy, NewComment, NewReview, Review, ReviewFilter, ReviewPatch,
  ReviewService,
};

pub type StateListener = Arc<dyn Fn(&AppState) + Send + Sync>;
pub type StateEquality = Arc<dyn Fn(&AppState, &AppState) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
  id: SubscriptionId,
  listener: StateListener,
  equal: Option<StateEquality>,
}

struct StoreInner {
  service: Arc<ReviewService>,
  clock: Arc<dyn Clock>,
  persistence: Option<Arc<dyn DurableStore>>,
  state: RwLock<Arc<AppState>>,
  /// Serializes state replacement and listener notification
  commit: Mutex<()>,
  subscribers: Mutex<Vec<Subscriber>>,
  next_subscription: AtomicU64,
  list_generation: AtomicU64,
  detail_generation: AtomicU64,
}

/// Review state with explicit actions.
///
/// Every action does its I/O through the [`ReviewService`] first and then
/// applies a single state replacement, so subscribers never see a partly
/// applied change. A failed action records the error and keeps the data
/// from the last success.
///
/// Listeners run synchronously while the replacement is being published and
/// must not call actions on the same store from inside the callback.
#[derive(Clone)]
pub struct ReviewStore {
  inner: Arc<StoreInner>,
}

impl ReviewStore {
  pub fn new(service: Arc<ReviewService>, clock: Arc<dyn Clock>) -> Self {
    Self::build(service, clock, None)
  }

  /// A store that writes its persisted subset to `store` on every change.
  pub fn persistent(
    service: Arc<ReviewService>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn DurableStore>,
  ) -> Self {
    Self::build(service, clock, Some(store))
  }

  fn build(
    service: Arc<ReviewService>,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn DurableStore>>,
  ) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        service,
        clock,
        persistence,
        state: RwLock::new(Arc::new(AppState::default())),
        commit: Mutex::new(()),
        subscribers: Mutex::new(Vec::new()),
        next_subscription: AtomicU64::new(1),
        list_generation: AtomicU64::new(0),
        detail_generation: AtomicU64::new(0),
      }),
    }
  }

  pub fn service(&self) -> &Arc<ReviewService> {
    &self.inner.service
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.inner.clock
  }

  /// Current snapshot.
  pub fn state(&self) -> Arc<AppState> {
    Arc::clone(&self.inner.state.read().unwrap_or_else(|e| e.into_inner()))
  }

  /// Call `listener` after every state replacement.
  pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
  where
    F: Fn(&AppState) + Send + Sync + 'static,
  {
    self.add_subscriber(Arc::new(listener), None)
  }

  /// Call `listener` after every replacement for which `equal(prev, next)`
  /// is false.
  pub fn subscribe_with<F, E>(&self, listener: F, equal: E) -> SubscriptionId
  where
    F: Fn(&AppState) + Send + Sync + 'static,
    E: Fn(&AppState, &AppState) -> bool + Send + Sync + 'static,
  {
    self.add_subscriber(Arc::new(listener), Some(Arc::new(equal)))
  }

  /// Subscribe with [`AppState::content_eq`] as the equality.
  pub fn subscribe_content<F>(&self, listener: F) -> SubscriptionId
  where
    F: Fn(&AppState) + Send + Sync + 'static,
  {
    self.subscribe_with(listener, AppState::content_eq)
  }

  fn add_subscriber(&self, listener: StateListener, equal: Option<StateEquality>) -> SubscriptionId {
    let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
    self.subscribers().push(Subscriber {
      id,
      listener,
      equal,
    });
    id
  }

  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let mut subscribers = self.subscribers();
    let before = subscribers.len();
    subscribers.retain(|s| s.id != id);
    subscribers.len() != before
  }

  fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
    self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn commit_guard(&self) -> MutexGuard<'_, ()> {
    self.inner.commit.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Replace the state with `f(current)`.
  fn commit<F>(&self, f: F) -> Arc<AppState>
  where
    F: FnOnce(&AppState) -> AppState,
  {
    let _guard = self.commit_guard();
    let prev = self.state();
    let next = Arc::new(f(prev.as_ref()));
    self.publish(&prev, &next);
    next
  }

  /// Replace the state if `f` produces a new one.
  fn try_commit<F>(&self, f: F) -> Option<Arc<AppState>>
  where
    F: FnOnce(&AppState) -> Option<AppState>,
  {
    let _guard = self.commit_guard();
    let prev = self.state();
    let next = Arc::new(f(prev.as_ref())?);
    self.publish(&prev, &next);
    Some(next)
  }

  fn publish(&self, prev: &AppState, next: &Arc<AppState>) {
    *self.inner.state.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(next);

    if let Some(store) = &self.inner.persistence {
      if subset_changed(prev, next) {
        persist::save(store.as_ref(), &PersistedState::from(next.as_ref()));
      }
    }

    let subscribers = self.subscribers().clone();
    for subscriber in subscribers {
      if subscriber.equal.as_ref().is_some_and(|eq| eq(prev, next.as_ref())) {
        continue;
      }
      let listener = &subscriber.listener;
      if catch_unwind(AssertUnwindSafe(|| listener(next.as_ref()))).is_err() {
        warn!(subscription = subscriber.id.0, "state listener panicked");
      }
    }
  }

  /// Apply the outcome of a write: a success goes through `apply` and
  /// clears the error, a failure is recorded next to the existing data.
  fn settle<T, F>(&self, result: Result<T, ApiError>, apply: F) -> Result<T, ApiError>
  where
    F: FnOnce(&AppState, &T) -> AppState,
  {
    match result {
      Ok(value) => {
        self.commit(|s| AppState {
          error: None,
          ..apply(s, &value)
        });
        Ok(value)
      }
      Err(e) => {
        self.record_error(&e);
        Err(e)
      }
    }
  }

  /// Like [`settle`](Self::settle) for writes that change list membership
  /// or list content. A list fetch still running was answered before the
  /// write and is abandoned.
  fn settle_list_write<T, F>(&self, result: Result<T, ApiError>, apply: F) -> Result<T, ApiError>
  where
    F: FnOnce(&AppState, &T) -> AppState,
  {
    match result {
      Ok(value) => {
        self.commit(|s| {
          self.inner.list_generation.fetch_add(1, Ordering::SeqCst);
          AppState {
            error: None,
            loading: false,
            ..apply(s, &value)
          }
        });
        Ok(value)
      }
      Err(e) => {
        self.record_error(&e);
        Err(e)
      }
    }
  }

  fn record_error(&self, error: &ApiError) {
    self.commit(|s| AppState {
      error: Some(error.clone()),
      ..s.clone()
    });
  }

  pub fn set_reviews(&self, reviews: Vec<Review>) {
    self.commit(|s| {
      let selected_review = refreshed_selection(s.selected_review.as_ref(), &reviews);
      AppState {
        reviews,
        selected_review,
        error: None,
        ..s.clone()
      }
    });
  }

  /// Select a review from the current list, or clear the selection. Returns
  /// false if `id` is not in the list.
  pub fn select_review(&self, id: Option<&str>) -> bool {
    self
      .try_commit(|s| {
        let selected_review = match id {
          Some(id) => Some(s.find_review(id)?.clone()),
          None => None,
        };
        Some(AppState {
          selected_review,
          ..s.clone()
        })
      })
      .is_some()
  }

  /// Replace the filters. A list fetch still running for the old filters
  /// is abandoned.
  pub fn set_filters(&self, filters: ReviewFilter) {
    self.commit(|s| {
      self.inner.list_generation.fetch_add(1, Ordering::SeqCst);
      AppState {
        filters: filters.canonical(),
        loading: false,
        ..s.clone()
      }
    });
  }

  pub fn clear_filters(&self) {
    self.set_filters(ReviewFilter::default());
  }

  /// Fetch the list for the current filters.
  ///
  /// If the fetch is superseded while it runs (a newer list fetch, a filter
  /// change or [`cancel_pending`](Self::cancel_pending)), its result is
  /// returned to the caller but not applied.
  ///
  /// While the state is provisional (restored, not yet fetched) the cache
  /// is skipped whatever `policy` says.
  pub async fn fetch_reviews(&self, policy: FetchPolicy) -> Result<Vec<Review>, ApiError> {
    let mut generation = 0;
    let started = self.commit(|s| {
      generation = self.inner.list_generation.fetch_add(1, Ordering::SeqCst) + 1;
      AppState {
        loading: true,
        ..s.clone()
      }
    });
    let filters = started.filters.clone();
    let policy = if started.provisional {
      FetchPolicy::NetworkOnly
    } else {
      policy
    };

    let result = self.inner.service.list_reviews(&filters, policy).await;
    let now = self.inner.clock.now();

    let applied = self.try_commit(|s| {
      if self.inner.list_generation.load(Ordering::SeqCst) != generation {
        return None;
      }
      Some(match &result {
        Ok(reviews) => AppState {
          reviews: reviews.clone(),
          selected_review: refreshed_selection(s.selected_review.as_ref(), reviews),
          loading: false,
          error: None,
          last_fetch_time: Some(now),
          cache_version: s.cache_version + 1,
          provisional: false,
          filters: s.filters.clone(),
        },
        Err(e) => AppState {
          loading: false,
          error: Some(e.clone()),
          ..s.clone()
        },
      })
    });
    if applied.is_none() {
      debug!(generation, "dropping superseded list fetch");
    }
    result
  }

  /// Fetch one review and select it. The matching list item is updated in
  /// the same replacement.
  pub async fn fetch_review(&self, id: &str, policy: FetchPolicy) -> Result<Review, ApiError> {
    let mut generation = 0;
    self.commit(|s| {
      generation = self.inner.detail_generation.fetch_add(1, Ordering::SeqCst) + 1;
      AppState {
        loading: true,
        ..s.clone()
      }
    });

    let result = self.inner.service.get_review(id, policy).await;

    let applied = self.try_commit(|s| {
      if self.inner.detail_generation.load(Ordering::SeqCst) != generation {
        return None;
      }
      Some(match &result {
        Ok(review) => AppState {
          selected_review: Some(review.clone()),
          loading: false,
          error: None,
          ..s.with_review(review)
        },
        Err(e) => AppState {
          loading: false,
          error: Some(e.clone()),
          ..s.clone()
        },
      })
    });
    if applied.is_none() {
      debug!(review = %id, generation, "dropping superseded review fetch");
    }
    result
  }

  pub async fn add_review(&self, new: &NewReview) -> Result<Review, ApiError> {
    let result = self.inner.service.create_review(new).await;
    self.settle_list_write(result, |s, review| {
      let mut next = s.clone();
      next.reviews.insert(0, review.clone());
      next
    })
  }

  pub async fn update_review(&self, id: &str, patch: &ReviewPatch) -> Result<Review, ApiError> {
    let result = self.inner.service.update_review(id, patch).await;
    self.settle_list_write(result, |s, review| s.with_review(review))
  }

  pub async fn remove_review(&self, id: &str) -> Result<(), ApiError> {
    let result = self.inner.service.delete_review(id).await;
    self.settle_list_write(result, |s, _| {
      let mut next = s.clone();
      next.reviews.retain(|r| r.id != id);
      if next.selected_review.as_ref().is_some_and(|r| r.id == id) {
        next.selected_review = None;
      }
      next
    })
  }

  pub async fn add_comment(&self, review_id: &str, new: &NewComment) -> Result<Comment, ApiError> {
    let result = self.inner.service.add_comment(review_id, new).await;
    self.settle(result, |s, comment| {
      s.with_review_edited(review_id, |r| r.with_comment_added(comment.clone()))
    })
  }

  pub async fn update_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    patch: &CommentPatch,
  ) -> Result<Comment, ApiError> {
    let result = self
      .inner
      .service
      .update_comment(review_id, comment_id, patch)
      .await;
    self.settle(result, |s, comment| {
      s.with_review_edited(review_id, |r| r.with_comment_replaced(comment.clone()))
    })
  }

  pub async fn resolve_comment(
    &self,
    review_id: &str,
    comment_id: &str,
    resolved: bool,
  ) -> Result<Comment, ApiError> {
    let patch = CommentPatch {
      resolved: Some(resolved),
      ..Default::default()
    };
    self.update_comment(review_id, comment_id, &patch).await
  }

  pub async fn delete_comment(&self, review_id: &str, comment_id: &str) -> Result<(), ApiError> {
    let result = self.inner.service.delete_comment(review_id, comment_id).await;
    self.settle(result, |s, _| {
      s.with_review_edited(review_id, |r| r.without_comment(comment_id))
    })
  }

  /// Drop every cached review read and bump the cache version.
  pub async fn invalidate_cache(&self) {
    self.inner.service.invalidate_all().await;
    self.commit(|s| AppState {
      cache_version: s.cache_version + 1,
      ..s.clone()
    });
  }

  /// Abandon every fetch in flight. Their results will not be applied.
  pub fn cancel_pending(&self) {
    self.commit(|s| {
      self.inner.list_generation.fetch_add(1, Ordering::SeqCst);
      self.inner.detail_generation.fetch_add(1, Ordering::SeqCst);
      AppState {
        loading: false,
        ..s.clone()
      }
    });
  }

  /// Load the persisted subset as provisional display data. Returns false if
  /// nothing was persisted. A [`refresh`](Self::refresh) must follow.
  pub fn restore(&self) -> bool {
    let Some(store) = &self.inner.persistence else {
      return false;
    };
    let Some(persisted) = persist::load(store.as_ref()) else {
      return false;
    };
    info!(
      reviews = persisted.reviews.len(),
      version = persisted.cache_version,
      "restored persisted state"
    );
    self.commit(|s| AppState {
      selected_review: refreshed_selection(s.selected_review.as_ref(), &persisted.reviews),
      reviews: persisted.reviews,
      filters: persisted.filters,
      cache_version: persisted.cache_version,
      provisional: true,
      ..s.clone()
    });
    true
  }

  /// Fetch from the network regardless of cached or restored data.
  pub async fn refresh(&self) -> Result<Vec<Review>, ApiError> {
    self.fetch_reviews(FetchPolicy::NetworkOnly).await
  }

  pub fn refresh_in_background(&self) -> JoinHandle<Result<Vec<Review>, ApiError>> {
    let store = self.clone();
    tokio::spawn(async move { store.refresh().await })
  }
}

/// The selected review as found in `reviews`, unless the list copy is older.
fn refreshed_selection(selected: Option<&Review>, reviews: &[Review]) -> Option<Review> {
  let selected = selected?;
  match reviews.iter().find(|r| r.id == selected.id) {
    Some(fresh) if fresh.updated_at >= selected.updated_at => Some(fresh.clone()),
    _ => Some(selected.clone()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use crate::store::persist::STATE_KEY;
  use crate::testing::{review, FakeReviewApi, Harness};
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn two_reviews() -> Arc<FakeReviewApi> {
    FakeReviewApi::with_reviews(vec![
      review("r1", "2024-01-01T00:00:00Z"),
      review("r2", "2024-01-02T00:00:00Z"),
    ])
  }

  #[tokio::test]
  async fn test_fetch_populates_and_persists() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();

    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    let state = store.state();
    assert_eq!(state.reviews.len(), 2);
    assert!(!state.loading);
    assert!(state.last_fetch_time.is_some());
    assert_eq!(state.cache_version, 1);

    let persisted = persist::load(h.state_store.as_ref()).unwrap();
    assert_eq!(persisted.reviews, state.reviews);
    assert_eq!(persisted.cache_version, 1);
  }

  #[tokio::test]
  async fn test_failure_keeps_prior_data() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();

    h.api.fail_with(Some(500));
    let err = store.fetch_reviews(FetchPolicy::NetworkOnly).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServerError);

    let state = store.state();
    assert_eq!(state.reviews.len(), 2);
    assert_eq!(state.error.as_ref().map(|e| e.kind), Some(ErrorKind::ServerError));
    assert!(!state.show_error_screen());

    h.api.fail_with(None);
    store.fetch_reviews(FetchPolicy::NetworkOnly).await.unwrap();
    assert!(store.state().error.is_none());
  }

  #[tokio::test]
  async fn test_first_load_failure_shows_error_screen() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    h.api.fail_with(Some(403));

    assert!(store.fetch_reviews(FetchPolicy::CacheFirst).await.is_err());
    assert!(store.state().show_error_screen());
    assert_eq!(h.reporter.history().len(), 1);
  }

  #[tokio::test]
  async fn test_list_and_selection_never_torn() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    let torn = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(AtomicUsize::new(0));
    {
      let torn = torn.clone();
      let seen = seen.clone();
      store.subscribe(move |state| {
        seen.fetch_add(1, Ordering::SeqCst);
        if let Some(selected) = &state.selected_review {
          if let Some(listed) = state.find_review(&selected.id) {
            if listed != selected {
              torn.fetch_add(1, Ordering::SeqCst);
            }
          }
        }
      });
    }

    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    store.fetch_review("r1", FetchPolicy::NetworkOnly).await.unwrap();

    h.api.edit("r1", |r| {
      r.title = "edited elsewhere".into();
      r.updated_at = "2024-05-01T00:00:00Z".parse().unwrap();
    });
    store.fetch_reviews(FetchPolicy::NetworkOnly).await.unwrap();
    assert_eq!(store.state().selected_review.as_ref().unwrap().title, "edited elsewhere");

    h.api.edit("r1", |r| {
      r.title = "edited again".into();
      r.updated_at = "2024-06-01T00:00:00Z".parse().unwrap();
    });
    store.fetch_review("r1", FetchPolicy::NetworkOnly).await.unwrap();
    assert_eq!(store.state().find_review("r1").unwrap().title, "edited again");

    assert!(seen.load(Ordering::SeqCst) >= 8);
    assert_eq!(torn.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_content_subscription_skips_identical_replacements() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    let every = Arc::new(AtomicUsize::new(0));
    let content = Arc::new(AtomicUsize::new(0));
    {
      let every = every.clone();
      store.subscribe(move |_| {
        every.fetch_add(1, Ordering::SeqCst);
      });
      let content = content.clone();
      store.subscribe_content(move |_| {
        content.fetch_add(1, Ordering::SeqCst);
      });
    }

    let reviews = vec![review("r1", "2024-01-01T00:00:00Z"), review("r2", "2024-01-01T00:00:00Z")];
    store.set_reviews(reviews.clone());
    store.set_reviews(reviews);
    assert_eq!(every.load(Ordering::SeqCst), 2);
    assert_eq!(content.load(Ordering::SeqCst), 1);

    // Same length, different ids
    store.set_reviews(vec![review("r1", "2024-01-01T00:00:00Z"), review("r3", "2024-01-01T00:00:00Z")]);
    assert_eq!(content.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_unsubscribe_and_panicking_listener() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    let calls = Arc::new(AtomicUsize::new(0));
    store.subscribe(|_| panic!("listener bug"));
    let id = {
      let calls = calls.clone();
      store.subscribe(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
      })
    };

    store.set_reviews(Vec::new());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(store.unsubscribe(id));
    store.set_reviews(Vec::new());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cancelled_fetch_is_not_applied() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    h.api.set_delay(Duration::from_millis(50));

    let (result, _) = tokio::join!(store.fetch_reviews(FetchPolicy::CacheFirst), async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      store.cancel_pending();
    });

    assert_eq!(result.unwrap().len(), 2);
    let state = store.state();
    assert!(state.reviews.is_empty());
    assert!(!state.loading);
  }

  #[tokio::test]
  async fn test_filter_change_abandons_running_fetch() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    h.api.set_delay(Duration::from_millis(50));

    let (_, _) = tokio::join!(store.fetch_reviews(FetchPolicy::CacheFirst), async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      store.set_filters(ReviewFilter::default().with_author("nobody"));
    });
    assert!(store.state().reviews.is_empty());

    let reviews = store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    assert!(reviews.is_empty());
    assert_eq!(store.state().filters.author_id.as_deref(), Some("nobody"));
  }

  #[tokio::test]
  async fn test_comment_actions_patch_list_and_selection() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    assert!(store.select_review(Some("r1")));
    assert!(!store.select_review(Some("ghost")));

    let comment = store
      .add_comment(
        "r1",
        &NewComment {
          body: "nit".into(),
          ..Default::default()
        },
      )
      .await
      .unwrap();
    let state = store.state();
    assert_eq!(state.find_review("r1").unwrap().comment_count(), 1);
    assert_eq!(state.selected_review.as_ref().unwrap().comment_count(), 1);

    store.resolve_comment("r1", &comment.id, true).await.unwrap();
    let state = store.state();
    assert!(state.selected_review.as_ref().unwrap().find_comment(&comment.id).unwrap().resolved);

    store.delete_comment("r1", &comment.id).await.unwrap();
    assert_eq!(store.state().find_review("r1").unwrap().comment_count(), 0);
  }

  #[tokio::test]
  async fn test_review_writes() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();

    let created = store
      .add_review(&NewReview {
        title: "third".into(),
        ..Default::default()
      })
      .await
      .unwrap();
    assert_eq!(store.state().reviews[0].id, created.id);

    store
      .update_review(
        "r2",
        &ReviewPatch {
          title: Some("renamed".into()),
          ..Default::default()
        },
      )
      .await
      .unwrap();
    assert_eq!(store.state().find_review("r2").unwrap().title, "renamed");

    store.select_review(Some("r2"));
    store.remove_review("r2").await.unwrap();
    let state = store.state();
    assert!(state.find_review("r2").is_none());
    assert!(state.selected_review.is_none());

    let err = store.remove_review("r2").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(store.state().reviews.len(), 2);
  }

  #[tokio::test]
  async fn test_list_fetch_answered_before_update_is_not_applied() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    h.api.set_list_delay(Duration::from_millis(50));

    let (stale, updated) = tokio::join!(store.fetch_reviews(FetchPolicy::NetworkOnly), async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      store
        .update_review(
          "r1",
          &ReviewPatch {
            title: Some("renamed".into()),
            ..Default::default()
          },
        )
        .await
    });
    assert_eq!(stale.unwrap()[0].title, "Review r1");
    updated.unwrap();

    let state = store.state();
    assert_eq!(state.find_review("r1").unwrap().title, "renamed");
    assert!(!state.loading);

    h.api.set_list_delay(Duration::ZERO);
    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    assert_eq!(store.state().find_review("r1").unwrap().title, "renamed");
  }

  #[tokio::test]
  async fn test_provisional_state_fetches_from_network() {
    let api = FakeReviewApi::with_reviews(vec![review("r1", "2024-01-01T00:00:00Z")]);
    let h = Harness::new(api.clone());
    h.global_store().fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    api.edit("r1", |r| r.title = "edited elsewhere".into());

    // The list cache survives the restart along with the persisted state
    let reloaded = h.reload();
    let store = reloaded.global_store();
    assert!(store.restore());

    let reviews = store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    assert_eq!(reviews[0].title, "edited elsewhere");
    assert_eq!(api.list_calls(), 2);
    assert!(!store.state().provisional);

    // Once fetched, cache-first reads are served from the cache again
    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    assert_eq!(api.list_calls(), 2);
  }

  #[tokio::test]
  async fn test_invalidate_cache_bumps_version() {
    let h = Harness::new(two_reviews());
    let store = h.global_store();
    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    store.invalidate_cache().await;
    assert_eq!(store.state().cache_version, 2);

    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    assert_eq!(h.api.list_calls(), 2);
  }

  #[tokio::test]
  async fn test_durable_reload_refetches_and_replaces() {
    let api = FakeReviewApi::with_reviews(vec![review("r1", "2024-01-01T00:00:00Z")]);
    let h = Harness::new(api.clone());
    h.global_store().fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    assert!(h.state_store.get(STATE_KEY).unwrap().is_some());

    // Restart: new memory, same durable stores
    let reloaded = h.reload();
    let store = reloaded.global_store();
    let renders = Arc::new(AtomicUsize::new(0));
    {
      let renders = renders.clone();
      store.subscribe_content(move |_| {
        renders.fetch_add(1, Ordering::SeqCst);
      });
    }

    assert!(store.restore());
    let restored = store.state();
    assert!(restored.provisional);
    assert_eq!(restored.reviews.len(), 1);

    let fresh = store.refresh_in_background().await.unwrap().unwrap();
    assert_eq!(fresh, restored.reviews);
    assert_eq!(api.list_calls(), 2);

    let state = store.state();
    assert!(!state.provisional);
    assert!(state.last_fetch_time.is_some());
    assert_eq!(state.reviews, restored.reviews);
    assert!(renders.load(Ordering::SeqCst) >= 3);
  }

  #[tokio::test]
  async fn test_restore_without_persistence() {
    let h = Harness::new(two_reviews());
    let store = ReviewStore::new(h.service.clone(), Arc::new(crate::clock::SystemClock));
    assert!(!store.restore());
    store.fetch_reviews(FetchPolicy::CacheFirst).await.unwrap();
    assert!(h.state_store.get(STATE_KEY).unwrap().is_none());
  }
}
