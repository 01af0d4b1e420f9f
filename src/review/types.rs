use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewStatus {
  Draft,
  Open,
  InProgress,
  Approved,
  Rejected,
  Merged,
  Closed,
}

impl ReviewStatus {
  pub const ALL: [ReviewStatus; 7] = [
    ReviewStatus::Draft,
    ReviewStatus::Open,
    ReviewStatus::InProgress,
    ReviewStatus::Approved,
    ReviewStatus::Rejected,
    ReviewStatus::Merged,
    ReviewStatus::Closed,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      ReviewStatus::Draft => "draft",
      ReviewStatus::Open => "open",
      ReviewStatus::InProgress => "in-progress",
      ReviewStatus::Approved => "approved",
      ReviewStatus::Rejected => "rejected",
      ReviewStatus::Merged => "merged",
      ReviewStatus::Closed => "closed",
    }
  }
}

impl fmt::Display for ReviewStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ReviewStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim().to_lowercase();
    ReviewStatus::ALL
      .into_iter()
      .find(|status| status.as_str() == s)
      .ok_or_else(|| format!("unknown status: {}", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  Medium,
  High,
  Critical,
}

impl Priority {
  pub fn as_str(self) -> &'static str {
    match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
      Priority::Critical => "critical",
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "low" => Ok(Priority::Low),
      "medium" => Ok(Priority::Medium),
      "high" => Ok(Priority::High),
      "critical" => Ok(Priority::Critical),
      other => Err(format!("unknown priority: {}", other)),
    }
  }
}

/// A changed file attached to a review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFile {
  pub path: String,
  #[serde(default)]
  pub additions: u32,
  #[serde(default)]
  pub deletions: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub patch: Option<String>,
}

/// A comment and its replies.
///
/// Replies are shared `Arc`s so that editing one comment can reuse every
/// untouched subtree of the previous version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
  pub id: String,
  pub author_id: String,
  pub body: String,
  #[serde(default)]
  pub resolved: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub file_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub replies: Vec<Arc<Comment>>,
}

/// Full review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub description: String,
  pub author_id: String,
  pub status: ReviewStatus,
  pub priority: Priority,
  #[serde(default)]
  pub tags: BTreeSet<String>,
  #[serde(default)]
  pub files: Arc<Vec<ReviewFile>>,
  #[serde(default)]
  pub comments: Vec<Arc<Comment>>,
  #[serde(default)]
  pub participants: Vec<String>,
  #[serde(default)]
  pub reviewers: Vec<String>,
  #[serde(default)]
  pub assignees: Vec<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub merged_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub closed_at: Option<DateTime<Utc>>,
}

/// Payload for creating a review
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReview {
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<Priority>,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub tags: BTreeSet<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub reviewers: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub assignees: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
}

/// Partial update of a review; unset fields are left alone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<ReviewStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<Priority>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tags: Option<BTreeSet<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reviewers: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assignees: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
}

/// Payload for a new comment or reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
  pub body: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parent_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub file_path: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved: Option<bool>,
}

/// Payload for attaching a file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
  pub path: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub patch: Option<String>,
}

/// List endpoint response. Servers answer either with a bare array or with
/// an envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ReviewList {
  Bare(Vec<Review>),
  Envelope {
    reviews: Vec<Review>,
    #[serde(default)]
    #[allow(dead_code)]
    total: Option<u64>,
  },
}

impl ReviewList {
  pub fn into_reviews(self) -> Vec<Review> {
    match self {
      ReviewList::Bare(reviews) => reviews,
      ReviewList::Envelope { reviews, .. } => reviews,
    }
  }
}
