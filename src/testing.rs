//! Test doubles shared by the unit tests.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::Session;
use crate::cache::{DurableStore, MemoryStore, TieredCache};
use crate::clock::{Clock, SystemClock};
use crate::error::ErrorReporter;
use crate::http::{ApiClient, HttpRequest, HttpResponse, Method, RetryPolicy, Transport, TransportError};
use crate::review::{
  Comment, CommentPatch, NewComment, NewFile, NewReview, Priority, Review, ReviewFile, ReviewPatch,
  ReviewService, ReviewStatus, ServiceConfig,
};
use crate::store::ReviewStore;

pub fn json_response(status: u16, body: &Value) -> HttpResponse {
  HttpResponse {
    status,
    headers: vec![("content-type".to_string(), "application/json".to_string())],
    body: serde_json::to_vec(body).unwrap(),
  }
}

fn ts(s: &str) -> DateTime<Utc> {
  s.parse().unwrap()
}

pub fn comment(id: &str) -> Comment {
  Comment {
    id: id.to_string(),
    author_id: "u1".to_string(),
    body: format!("body of {}", id),
    resolved: false,
    parent_id: None,
    file_path: None,
    line: None,
    created_at: ts("2024-01-01T00:00:00Z"),
    updated_at: ts("2024-01-01T00:00:00Z"),
    replies: Vec::new(),
  }
}

pub fn review(id: &str, updated_at: &str) -> Review {
  Review {
    id: id.to_string(),
    title: format!("Review {}", id),
    description: String::new(),
    author_id: "u1".to_string(),
    status: ReviewStatus::Open,
    priority: Priority::Medium,
    tags: Default::default(),
    files: Arc::new(Vec::new()),
    comments: Vec::new(),
    participants: Vec::new(),
    reviewers: Vec::new(),
    assignees: Vec::new(),
    created_at: ts("2024-01-01T00:00:00Z"),
    updated_at: ts(updated_at),
    due_date: None,
    merged_at: None,
    closed_at: None,
  }
}

type Handler = Box<dyn FnMut(&HttpRequest) -> Result<HttpResponse, TransportError> + Send>;

/// Transport answering from a closure and recording every request.
pub struct MockTransport {
  handler: Mutex<Handler>,
  delay: Mutex<Duration>,
  requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
  pub fn new<F>(handler: F) -> Arc<Self>
  where
    F: FnMut(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + 'static,
  {
    Arc::new(Self {
      handler: Mutex::new(Box::new(handler)),
      delay: Mutex::new(Duration::ZERO),
      requests: Mutex::new(Vec::new()),
    })
  }

  /// Answer with `responses` in order, then fail.
  pub fn sequence(responses: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
    let mut queue: VecDeque<_> = responses.into();
    Self::new(move |_| {
      queue
        .pop_front()
        .unwrap_or_else(|| Err(TransportError::Other("no more responses".into())))
    })
  }

  pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
    *self.delay.lock().unwrap() = delay;
    self
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<HttpRequest> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    self.requests.lock().unwrap().push(request.clone());
    let delay = *self.delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    let mut handler = self.handler.lock().unwrap();
    (*handler)(&request)
  }
}

/// In-memory review server speaking the REST shape of the real API.
pub struct FakeReviewApi {
  reviews: Mutex<Vec<Review>>,
  failing: Mutex<Option<u16>>,
  delay: Mutex<Duration>,
  list_delay: Mutex<Duration>,
  list_calls: AtomicUsize,
  detail_calls: AtomicUsize,
  next_id: AtomicUsize,
}

impl FakeReviewApi {
  pub fn with_reviews(reviews: Vec<Review>) -> Arc<Self> {
    Arc::new(Self {
      reviews: Mutex::new(reviews),
      failing: Mutex::new(None),
      delay: Mutex::new(Duration::ZERO),
      list_delay: Mutex::new(Duration::ZERO),
      list_calls: AtomicUsize::new(0),
      detail_calls: AtomicUsize::new(0),
      next_id: AtomicUsize::new(1),
    })
  }

  pub fn list_calls(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  pub fn detail_calls(&self) -> usize {
    self.detail_calls.load(Ordering::SeqCst)
  }

  /// Answer every request with `status` until reset with `None`.
  pub fn fail_with(&self, status: Option<u16>) {
    *self.failing.lock().unwrap() = status;
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = delay;
  }

  /// Answer list requests with the data as it was when the request
  /// arrived, `delay` later.
  pub fn set_list_delay(&self, delay: Duration) {
    *self.list_delay.lock().unwrap() = delay;
  }

  /// Change a review server-side, as another client would.
  pub fn edit<F: FnOnce(&mut Review)>(&self, id: &str, f: F) {
    let mut reviews = self.reviews.lock().unwrap();
    if let Some(review) = reviews.iter_mut().find(|r| r.id == id) {
      f(review);
    }
  }

  pub fn snapshot(&self) -> Vec<Review> {
    self.reviews.lock().unwrap().clone()
  }

  fn next_id(&self, prefix: &str) -> String {
    format!("{}{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
  }

  fn route(&self, request: &HttpRequest) -> HttpResponse {
    let Some(rest) = request.path.strip_prefix("/api/reviews") else {
      return not_found();
    };
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    match (request.method, segments.as_slice()) {
      (Method::Get, []) => self.list(request),
      (Method::Post, []) => self.create(request),
      (Method::Get, [id]) => {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.with_review(id, |r| json_response(200, &json!(r)))
      }
      (Method::Patch, [id]) => self.patch_review(id, request),
      (Method::Delete, [id]) => {
        let mut reviews = self.reviews.lock().unwrap();
        let before = reviews.len();
        reviews.retain(|r| r.id != *id);
        if reviews.len() == before {
          not_found()
        } else {
          HttpResponse {
            status: 204,
            headers: Vec::new(),
            body: Vec::new(),
          }
        }
      }
      (Method::Post, [id, "comments"]) => self.add_comment(id, request),
      (Method::Patch, [id, "comments", cid]) => self.patch_comment(id, cid, request),
      (Method::Delete, [id, "comments", cid]) => {
        self.mutate(id, |r| r.without_comment(cid).map(|r| (r, json!({}))))
      }
      (Method::Post, [id, "files"]) => {
        let Some(file) = body::<NewFile>(request) else {
          return bad_request();
        };
        let added = ReviewFile {
          path: file.path,
          additions: 0,
          deletions: 0,
          patch: file.patch,
        };
        self.mutate(id, |r| {
          let mut files = r.files.as_ref().clone();
          files.push(added.clone());
          Some((
            Review {
              files: Arc::new(files),
              ..r.clone()
            },
            json!(added),
          ))
        })
      }
      (Method::Delete, [id, "files"]) => {
        let Some((_, path)) = request.query.iter().find(|(k, _)| k == "path") else {
          return bad_request();
        };
        self.mutate(id, |r| {
          let files: Vec<ReviewFile> = r.files.iter().filter(|f| &f.path != path).cloned().collect();
          Some((
            Review {
              files: Arc::new(files),
              ..r.clone()
            },
            json!({}),
          ))
        })
      }
      _ => not_found(),
    }
  }

  fn list(&self, request: &HttpRequest) -> HttpResponse {
    self.list_calls.fetch_add(1, Ordering::SeqCst);
    let param = |name: &str| {
      request
        .query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
    };
    let statuses: Option<Vec<ReviewStatus>> =
      param("status").map(|s| s.split(',').filter_map(|v| v.parse().ok()).collect());
    let tags: Option<Vec<String>> = param("tags").map(|s| s.split(',').map(String::from).collect());
    let author = param("authorId");

    let reviews: Vec<Review> = self
      .reviews
      .lock()
      .unwrap()
      .iter()
      .filter(|r| statuses.as_ref().map_or(true, |s| s.contains(&r.status)))
      .filter(|r| author.as_ref().map_or(true, |a| &r.author_id == a))
      .filter(|r| tags.as_ref().map_or(true, |t| t.iter().all(|t| r.tags.contains(t))))
      .cloned()
      .collect();
    let total = reviews.len();
    json_response(200, &json!({ "reviews": reviews, "total": total }))
  }

  fn create(&self, request: &HttpRequest) -> HttpResponse {
    let Some(new) = body::<NewReview>(request) else {
      return bad_request();
    };
    let now = Utc::now();
    let created = Review {
      id: self.next_id("new-"),
      title: new.title,
      description: new.description,
      priority: new.priority.unwrap_or(Priority::Medium),
      tags: new.tags,
      reviewers: new.reviewers,
      assignees: new.assignees,
      due_date: new.due_date,
      created_at: now,
      updated_at: now,
      ..review("template", "2024-01-01T00:00:00Z")
    };
    self.reviews.lock().unwrap().push(created.clone());
    json_response(201, &json!(created))
  }

  fn patch_review(&self, id: &str, request: &HttpRequest) -> HttpResponse {
    let Some(patch) = body::<ReviewPatch>(request) else {
      return bad_request();
    };
    self.mutate(id, |r| {
      let mut next = r.clone();
      if let Some(title) = &patch.title {
        next.title = title.clone();
      }
      if let Some(description) = &patch.description {
        next.description = description.clone();
      }
      if let Some(status) = patch.status {
        next.status = status;
      }
      if let Some(priority) = patch.priority {
        next.priority = priority;
      }
      if let Some(tags) = &patch.tags {
        next.tags = tags.clone();
      }
      let body = json!(next);
      Some((next, body))
    })
  }

  fn add_comment(&self, id: &str, request: &HttpRequest) -> HttpResponse {
    let Some(new) = body::<NewComment>(request) else {
      return bad_request();
    };
    let created = Comment {
      id: self.next_id("c"),
      body: new.body,
      parent_id: new.parent_id,
      file_path: new.file_path,
      line: new.line,
      ..comment("template")
    };
    let response = json!(created);
    self.mutate(id, |r| r.with_comment_added(created.clone()).map(|r| (r, response.clone())))
  }

  fn patch_comment(&self, id: &str, cid: &str, request: &HttpRequest) -> HttpResponse {
    let Some(patch) = body::<CommentPatch>(request) else {
      return bad_request();
    };
    self.mutate(id, |r| {
      let next = r.with_comment_edited(cid, |c| {
        if let Some(body) = &patch.body {
          c.body = body.clone();
        }
        if let Some(resolved) = patch.resolved {
          c.resolved = resolved;
        }
      })?;
      let edited = next.find_comment(cid)?;
      let body = json!(Comment {
        replies: Vec::new(),
        ..Comment::clone(edited)
      });
      Some((next, body))
    })
  }

  fn with_review<F: FnOnce(&Review) -> HttpResponse>(&self, id: &str, f: F) -> HttpResponse {
    match self.reviews.lock().unwrap().iter().find(|r| r.id == id) {
      Some(review) => f(review),
      None => not_found(),
    }
  }

  /// Replace a review with the edited version and bump its `updated_at`.
  fn mutate<F>(&self, id: &str, f: F) -> HttpResponse
  where
    F: FnOnce(&Review) -> Option<(Review, Value)>,
  {
    let mut reviews = self.reviews.lock().unwrap();
    let Some(slot) = reviews.iter_mut().find(|r| r.id == id) else {
      return not_found();
    };
    match f(slot) {
      Some((mut next, body)) => {
        next.updated_at = slot.updated_at + ChronoDuration::minutes(1);
        let patched_review = body.get("id").and_then(Value::as_str) == Some(next.id.as_str());
        *slot = next.clone();
        if patched_review {
          json_response(200, &json!(next))
        } else {
          json_response(200, &body)
        }
      }
      None => not_found(),
    }
  }
}

fn body<T: DeserializeOwned>(request: &HttpRequest) -> Option<T> {
  serde_json::from_slice(request.body.as_deref()?).ok()
}

fn not_found() -> HttpResponse {
  json_response(404, &json!({"message": "not found"}))
}

fn bad_request() -> HttpResponse {
  json_response(400, &json!({"message": "bad request"}))
}

#[async_trait]
impl Transport for FakeReviewApi {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let delay = *self.delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    if let Some(status) = *self.failing.lock().unwrap() {
      return Ok(json_response(status, &json!({"message": "injected failure"})));
    }
    let list_delay = *self.list_delay.lock().unwrap();
    if request.method == Method::Get && request.path == "/api/reviews" && !list_delay.is_zero() {
      let response = self.route(&request);
      tokio::time::sleep(list_delay).await;
      return Ok(response);
    }
    Ok(self.route(&request))
  }
}

/// A review service wired to a fake server. The cache and the store state
/// live in separate durable stores, as they do in separate namespaces in the
/// app.
pub struct Harness {
  pub api: Arc<FakeReviewApi>,
  pub durable: Arc<MemoryStore>,
  pub state_store: Arc<MemoryStore>,
  pub cache: Arc<TieredCache>,
  pub reporter: Arc<ErrorReporter>,
  pub service: Arc<ReviewService>,
}

impl Harness {
  pub fn new(api: Arc<FakeReviewApi>) -> Self {
    Self::with_durable(api, Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
  }

  pub fn with_durable(
    api: Arc<FakeReviewApi>,
    durable: Arc<MemoryStore>,
    state_store: Arc<MemoryStore>,
  ) -> Self {
    let store: Arc<dyn DurableStore> = durable.clone();
    let cache = Arc::new(TieredCache::new(store, Arc::new(SystemClock)));
    let reporter = Arc::new(ErrorReporter::new());
    let client = ApiClient::new(api.clone(), Session::in_memory(), cache.clone(), reporter.clone())
      .with_retry(RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
      });
    let service = Arc::new(ReviewService::new(client, cache.clone(), ServiceConfig::default()));
    Self {
      api,
      durable,
      state_store,
      cache,
      reporter,
      service,
    }
  }

  /// Same server and durable stores, empty memory. Simulates a restart.
  pub fn reload(&self) -> Self {
    Self::with_durable(self.api.clone(), self.durable.clone(), self.state_store.clone())
  }

  /// Global store persisting into `state_store`.
  pub fn global_store(&self) -> ReviewStore {
    ReviewStore::persistent(self.service.clone(), Arc::new(SystemClock), self.state_store.clone())
  }

  pub fn global_store_with_clock(&self, clock: Arc<dyn Clock>) -> ReviewStore {
    ReviewStore::persistent(self.service.clone(), clock, self.state_store.clone())
  }
}
