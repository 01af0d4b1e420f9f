//! Content fingerprints for change detection.
//!
//! Two review collections are considered equal only when they hold the same
//! ids with the same `updated_at` and the same comment threads. The number
//! of reviews is never enough on its own.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::review::{Comment, Review};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReviewFingerprint {
  pub id: String,
  pub updated_at: DateTime<Utc>,
  /// Hex digest over the comment tree
  pub comments: String,
}

impl ReviewFingerprint {
  pub fn of(review: &Review) -> Self {
    let mut hasher = Sha256::new();
    digest_comments(&mut hasher, &review.comments);
    Self {
      id: review.id.clone(),
      updated_at: review.updated_at,
      comments: hex::encode(hasher.finalize()),
    }
  }
}

fn digest_comments(hasher: &mut Sha256, comments: &[Arc<Comment>]) {
  for comment in comments {
    hasher.update(comment.id.as_bytes());
    hasher.update([0]);
    hasher.update(comment.updated_at.to_rfc3339().as_bytes());
    hasher.update([comment.resolved as u8]);
    hasher.update(comment.body.as_bytes());
    hasher.update([0]);
    // Bracket replies so that moving a reply changes the digest
    hasher.update(b"(");
    digest_comments(hasher, &comment.replies);
    hasher.update(b")");
  }
}

/// Ordered fingerprint of a review list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionFingerprint {
  items: Vec<ReviewFingerprint>,
}

impl CollectionFingerprint {
  pub fn of(reviews: &[Review]) -> Self {
    Self {
      items: reviews.iter().map(ReviewFingerprint::of).collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Same reviews in any order.
  pub fn same_content(&self, other: &Self) -> bool {
    let ours: BTreeSet<&ReviewFingerprint> = self.items.iter().collect();
    let theirs: BTreeSet<&ReviewFingerprint> = other.items.iter().collect();
    ours == theirs
  }

  /// Ids present on only one side or with different content.
  pub fn differing_ids(&self, other: &Self) -> BTreeSet<String> {
    let ours: BTreeSet<&ReviewFingerprint> = self.items.iter().collect();
    let theirs: BTreeSet<&ReviewFingerprint> = other.items.iter().collect();
    ours
      .symmetric_difference(&theirs)
      .map(|fp| fp.id.clone())
      .collect()
  }

  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    for item in &self.items {
      hasher.update(item.id.as_bytes());
      hasher.update([0]);
      hasher.update(item.updated_at.to_rfc3339().as_bytes());
      hasher.update(item.comments.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}
