//! Comment tree edits with structural sharing.
//!
//! Every edit locates the target comment by id anywhere in the tree and
//! rebuilds only the path from the root to it. Sibling subtrees and the
//! review's `files` are reused by reference, so `Arc::ptr_eq` can be used for
//! change detection.

use std::sync::Arc;

use super::types::{Comment, Review};

type EditFn<'a> = dyn FnMut(&Comment) -> Option<Comment> + 'a;

/// Rebuild the path to `id`. `edit` returns the replacement, or `None` to
/// remove the comment. Returns `None` if `id` is not in the tree.
fn rebuild(comments: &[Arc<Comment>], id: &str, edit: &mut EditFn<'_>) -> Option<Vec<Arc<Comment>>> {
  for (i, comment) in comments.iter().enumerate() {
    if comment.id == id {
      let mut out = comments.to_vec();
      match edit(comment) {
        Some(replacement) => out[i] = Arc::new(replacement),
        None => {
          out.remove(i);
        }
      }
      return Some(out);
    }

    if let Some(replies) = rebuild(&comment.replies, id, edit) {
      let mut out = comments.to_vec();
      out[i] = Arc::new(Comment {
        replies,
        ..Comment::clone(comment)
      });
      return Some(out);
    }
  }
  None
}

fn find<'a>(comments: &'a [Arc<Comment>], id: &str) -> Option<&'a Arc<Comment>> {
  comments.iter().find_map(|c| {
    if c.id == id {
      Some(c)
    } else {
      find(&c.replies, id)
    }
  })
}

fn count(comments: &[Arc<Comment>]) -> usize {
  comments.iter().map(|c| 1 + count(&c.replies)).sum()
}

impl Review {
  fn with_comments(&self, comments: Vec<Arc<Comment>>) -> Review {
    Review {
      comments,
      ..self.clone()
    }
  }

  /// Find a comment anywhere in the tree.
  pub fn find_comment(&self, id: &str) -> Option<&Arc<Comment>> {
    find(&self.comments, id)
  }

  /// Total number of comments including replies.
  pub fn comment_count(&self) -> usize {
    count(&self.comments)
  }

  /// Replace the comment with the same id.
  ///
  /// If `updated` carries no replies the existing replies are kept; update
  /// endpoints return the edited comment without its thread.
  pub fn with_comment_replaced(&self, updated: Comment) -> Option<Review> {
    let id = updated.id.clone();
    let mut updated = Some(updated);
    let comments = rebuild(&self.comments, &id, &mut |old| {
      let mut new = updated.take()?;
      if new.replies.is_empty() {
        new.replies = old.replies.clone();
      }
      Some(new)
    })?;
    Some(self.with_comments(comments))
  }

  /// Apply `f` to the comment with `id`.
  pub fn with_comment_edited<F>(&self, id: &str, mut f: F) -> Option<Review>
  where
    F: FnMut(&mut Comment),
  {
    let comments = rebuild(&self.comments, id, &mut |old| {
      let mut new = old.clone();
      f(&mut new);
      Some(new)
    })?;
    Some(self.with_comments(comments))
  }

  pub fn with_comment_resolved(&self, id: &str, resolved: bool) -> Option<Review> {
    self.with_comment_edited(id, |c| c.resolved = resolved)
  }

  /// Insert `comment` as a reply to its `parent_id`, or at the top level.
  /// Returns `None` if the parent does not exist.
  pub fn with_comment_added(&self, comment: Comment) -> Option<Review> {
    match comment.parent_id.clone() {
      None => {
        let mut comments = self.comments.clone();
        comments.push(Arc::new(comment));
        Some(self.with_comments(comments))
      }
      Some(parent) => {
        let mut reply = Some(comment);
        let comments = rebuild(&self.comments, &parent, &mut |old| {
          let mut new = old.clone();
          new.replies.push(Arc::new(reply.take()?));
          Some(new)
        })?;
        Some(self.with_comments(comments))
      }
    }
  }

  /// Remove the comment with `id` together with its replies.
  pub fn without_comment(&self, id: &str) -> Option<Review> {
    let comments = rebuild(&self.comments, id, &mut |_| None)?;
    Some(self.with_comments(comments))
  }
}
