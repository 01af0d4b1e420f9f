//! Review list query options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::types::{Priority, ReviewStatus};
use crate::cache::{canonical_key, hash_key};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
  CreatedAt,
  #[default]
  UpdatedAt,
  Priority,
  Title,
}

impl SortField {
  pub fn as_str(self) -> &'static str {
    match self {
      SortField::CreatedAt => "createdAt",
      SortField::UpdatedAt => "updatedAt",
      SortField::Priority => "priority",
      SortField::Title => "title",
    }
  }
}

impl FromStr for SortField {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace(['-', '_'], "").as_str() {
      "createdat" | "created" => Ok(SortField::CreatedAt),
      "updatedat" | "updated" => Ok(SortField::UpdatedAt),
      "priority" => Ok(SortField::Priority),
      "title" => Ok(SortField::Title),
      other => Err(format!("unknown sort field: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  Asc,
  #[default]
  Desc,
}

impl SortOrder {
  pub fn as_str(self) -> &'static str {
    match self {
      SortOrder::Asc => "asc",
      SortOrder::Desc => "desc",
    }
  }
}

impl FromStr for SortOrder {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "asc" => Ok(SortOrder::Asc),
      "desc" => Ok(SortOrder::Desc),
      other => Err(format!("unknown sort order: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
  pub from: Option<DateTime<Utc>>,
  pub to: Option<DateTime<Utc>>,
}

pub const DEFAULT_LIMIT: u32 = 20;

fn default_limit() -> u32 {
  DEFAULT_LIMIT
}

/// Filter for the review list.
///
/// Multi-valued criteria are ordered sets, and empty criteria are not
/// serialized, so two filters with the same meaning always produce the same
/// query string and cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFilter {
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub status: BTreeSet<ReviewStatus>,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub priority: BTreeSet<Priority>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub author_id: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub tags: BTreeSet<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub date_range: Option<DateRange>,
  #[serde(default)]
  pub sort_by: SortField,
  #[serde(default)]
  pub sort_order: SortOrder,
  #[serde(default = "default_limit")]
  pub limit: u32,
  #[serde(default)]
  pub offset: u32,
}

impl Default for ReviewFilter {
  fn default() -> Self {
    Self {
      status: BTreeSet::new(),
      priority: BTreeSet::new(),
      author_id: None,
      tags: BTreeSet::new(),
      date_range: None,
      sort_by: SortField::default(),
      sort_order: SortOrder::default(),
      limit: DEFAULT_LIMIT,
      offset: 0,
    }
  }
}

impl ReviewFilter {
  pub fn with_status(mut self, status: ReviewStatus) -> Self {
    self.status.insert(status);
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority.insert(priority);
    self
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
    self.author_id = Some(author_id.into());
    self
  }

  /// Normalized form: blank author dropped, blank tags removed, empty date
  /// range dropped.
  pub fn canonical(&self) -> Self {
    let mut filter = self.clone();
    filter.author_id = filter
      .author_id
      .map(|a| a.trim().to_string())
      .filter(|a| !a.is_empty());
    filter.tags = filter
      .tags
      .iter()
      .map(|t| t.trim().to_string())
      .filter(|t| !t.is_empty())
      .collect();
    if filter
      .date_range
      .is_some_and(|r| r.from.is_none() && r.to.is_none())
    {
      filter.date_range = None;
    }
    filter
  }

  /// Cache key for the list query using this filter.
  pub fn cache_key(&self, operation: &str) -> String {
    canonical_key(operation, &self.canonical())
      .unwrap_or_else(|_| format!("{}:{}", operation, hash_key(&self.to_string())))
  }

  /// Query parameters, sorted by name.
  pub fn to_query_params(&self) -> Vec<(String, String)> {
    let filter = self.canonical();
    let mut params = Vec::new();

    if !filter.status.is_empty() {
      let joined: Vec<&str> = filter.status.iter().map(|s| s.as_str()).collect();
      params.push(("status".to_string(), joined.join(",")));
    }
    if !filter.priority.is_empty() {
      let joined: Vec<&str> = filter.priority.iter().map(|p| p.as_str()).collect();
      params.push(("priority".to_string(), joined.join(",")));
    }
    if let Some(author) = &filter.author_id {
      params.push(("authorId".to_string(), author.clone()));
    }
    if !filter.tags.is_empty() {
      let joined: Vec<&str> = filter.tags.iter().map(String::as_str).collect();
      params.push(("tags".to_string(), joined.join(",")));
    }
    if let Some(range) = filter.date_range {
      if let Some(from) = range.from {
        params.push(("from".to_string(), from.to_rfc3339()));
      }
      if let Some(to) = range.to {
        params.push(("to".to_string(), to.to_rfc3339()));
      }
    }
    params.push(("sortBy".to_string(), filter.sort_by.as_str().to_string()));
    params.push(("sortOrder".to_string(), filter.sort_order.as_str().to_string()));
    params.push(("limit".to_string(), filter.limit.to_string()));
    params.push(("offset".to_string(), filter.offset.to_string()));

    params.sort();
    params
  }
}

impl fmt::Display for ReviewFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let params: Vec<String> = self
      .to_query_params()
      .into_iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect();
    f.write_str(&params.join("&"))
  }
}
