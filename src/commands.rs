//! Command-line subcommands and their execution.

use clap::{Args, Subcommand};
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::app::App;
use crate::review::{FetchPolicy, NewComment, Priority, Review, ReviewFilter, ReviewStatus, SortField, SortOrder};
use crate::store::AppState;
use crate::sync::ReviewAccess;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// List reviews
  List(ListArgs),
  /// Show one review with its comments
  Show { id: String },
  /// Comment on a review
  Comment {
    id: String,
    body: String,
    /// Reply to an existing comment instead of starting a thread
    #[arg(long)]
    reply_to: Option<String>,
  },
  /// Mark a comment as resolved
  Resolve { review: String, comment: String },
  /// Log in. The password is read from REVSYNC_PASSWORD
  Login { email: String },
  Logout,
  /// Show the logged-in user
  Whoami,
  /// Print the review list whenever it changes
  Watch(ListArgs),
  /// Cache maintenance
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Drop every cached response
  Clear,
  /// Print cache counters
  Stats,
}

#[derive(Args, Debug, Default)]
pub struct ListArgs {
  #[arg(long, value_delimiter = ',')]
  pub status: Vec<ReviewStatus>,
  #[arg(long, value_delimiter = ',')]
  pub priority: Vec<Priority>,
  #[arg(long)]
  pub author: Option<String>,
  #[arg(long = "tag")]
  pub tags: Vec<String>,
  #[arg(long)]
  pub sort_by: Option<SortField>,
  #[arg(long)]
  pub order: Option<SortOrder>,
  #[arg(long)]
  pub limit: Option<u32>,
  #[arg(long)]
  pub offset: Option<u32>,
  /// Skip the cache
  #[arg(long)]
  pub fresh: bool,
}

impl ListArgs {
  pub fn filter(&self) -> ReviewFilter {
    let mut filter = ReviewFilter {
      status: self.status.iter().copied().collect(),
      priority: self.priority.iter().copied().collect(),
      author_id: self.author.clone(),
      tags: self.tags.iter().cloned().collect(),
      ..Default::default()
    };
    if let Some(sort_by) = self.sort_by {
      filter.sort_by = sort_by;
    }
    if let Some(order) = self.order {
      filter.sort_order = order;
    }
    if let Some(limit) = self.limit {
      filter.limit = limit;
    }
    if let Some(offset) = self.offset {
      filter.offset = offset;
    }
    filter.canonical()
  }

  fn policy(&self) -> FetchPolicy {
    if self.fresh {
      FetchPolicy::NetworkOnly
    } else {
      FetchPolicy::CacheFirst
    }
  }
}

pub async fn run(app: &mut App, command: Command) -> Result<()> {
  match command {
    Command::List(args) => {
      app.start();
      let reviews = app.reviews();
      reviews.set_filters(args.filter());
      let list = reviews.fetch_reviews(args.policy()).await?;
      print_list(&list);
      Ok(())
    }
    Command::Show { id } => {
      let review = app.reviews().fetch_review(&id, FetchPolicy::CacheFirst).await?;
      print_review(&review);
      Ok(())
    }
    Command::Comment { id, body, reply_to } => {
      let new = NewComment {
        body,
        parent_id: reply_to,
        ..Default::default()
      };
      let comment = app.reviews().add_comment(&id, &new).await?;
      println!("{}", comment.id);
      Ok(())
    }
    Command::Resolve { review, comment } => {
      app.reviews().resolve_comment(&review, &comment, true).await?;
      println!("resolved {}", comment);
      Ok(())
    }
    Command::Login { email } => {
      let password = crate::config::Config::get_password()?;
      let user = app.auth().login(&email, &password).await?;
      println!("logged in as {} <{}>", user.name, user.email);
      Ok(())
    }
    Command::Logout => {
      app.auth().logout().await?;
      println!("logged out");
      Ok(())
    }
    Command::Whoami => {
      let user = app.auth().current_user().await?;
      println!("{} <{}> ({})", user.name, user.email, user.id);
      Ok(())
    }
    Command::Watch(args) => watch(app, args).await,
    Command::Cache(CacheCommand::Clear) => {
      app.reviews().invalidate_cache().await;
      app.cache().clear().await;
      println!("cache cleared");
      Ok(())
    }
    Command::Cache(CacheCommand::Stats) => {
      let stats = app.cache().stats();
      println!(
        "entries={} bytes={} hits={} misses={} evictions={}",
        stats.entries, stats.bytes, stats.hits, stats.misses, stats.evictions
      );
      Ok(())
    }
  }
}

async fn watch(app: &mut App, args: ListArgs) -> Result<()> {
  if app.start() {
    print_state(&app.reviews().state());
  }
  app.store().subscribe_content(|state| {
    if !state.loading {
      println!("--");
      print_state(state);
    }
  });

  let reviews = app.reviews();
  reviews.set_filters(args.filter());
  let interval = app.config().reconcile_interval().max(Duration::from_secs(1));
  let mut ticker = tokio::time::interval(interval);
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        // Errors are recorded in the state and shown by the listener
        let _ = reviews.fetch_reviews(FetchPolicy::NetworkOnly).await;
      }
      _ = tokio::signal::ctrl_c() => {
        info!("watch interrupted");
        reviews.cancel_pending();
        return Ok(());
      }
    }
  }
}

fn print_state(state: &AppState) {
  if state.show_error_screen() {
    if let Some(error) = &state.error {
      println!("error: {}", error);
    }
    return;
  }
  print_list(&state.reviews);
  if let Some(error) = &state.error {
    println!("(showing last data: {})", error);
  }
  if state.provisional {
    println!("(restored, refreshing)");
  }
}

fn print_list(reviews: &[Review]) {
  for r in reviews {
    println!(
      "{:<12} {:<12} {:<9} {:>3}  {}",
      r.id,
      r.status,
      r.priority,
      r.comment_count(),
      r.title
    );
  }
}

fn print_review(review: &Review) {
  println!("{} [{}] {}", review.id, review.status, review.title);
  if !review.description.is_empty() {
    println!("\n{}\n", review.description);
  }
  for file in review.files.iter() {
    println!("  {} (+{} -{})", file.path, file.additions, file.deletions);
  }
  fn walk(comments: &[Arc<crate::review::Comment>], depth: usize) {
    for c in comments {
      let mark = if c.resolved { "x" } else { " " };
      println!("{}[{}] {} {}: {}", "  ".repeat(depth), mark, c.id, c.author_id, c.body);
      walk(&c.replies, depth + 1);
    }
  }
  walk(&review.comments, 0);
}
