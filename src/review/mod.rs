//! Review domain: wire types, list filters, comment tree edits and the
//! cached review service.

mod comments;
mod filter;
mod service;
mod types;

pub use filter::{DateRange, ReviewFilter, SortField, SortOrder, DEFAULT_LIMIT};
pub use service::{FetchPolicy, ReviewQueryKey, ReviewService, ServiceConfig, ServiceEvent, REVIEWS_PATH};
pub use types::{
  Comment, CommentPatch, NewComment, NewFile, NewReview, Priority, Review, ReviewFile, ReviewList,
  ReviewPatch, ReviewStatus,
};
