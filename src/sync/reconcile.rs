//! Background convergence of two independently held review states.

use std::time::Duration;
use tokio::sync::broadcast::{
  self,
  error::{RecvError, TryRecvError},
};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::ReviewContext;
use crate::error::ApiError;
use crate::review::{FetchPolicy, ServiceEvent};
use crate::store::ReviewStore;

/// Shortest allowed interval between periodic checks.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
  Global,
  Context,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
  InSync,
  /// The container on this side was behind and has been refetched
  Refetched(Side),
  /// The container on this side was behind but already loading
  Skipped(Side),
  Failed(Side, ApiError),
}

/// Compares the global store with an independent context and refetches the
/// one that is behind.
///
/// Only exists for independent contexts; a delegating context reads the
/// global state directly.
pub struct Reconciler {
  global: ReviewStore,
  local: ReviewStore,
  interval: Duration,
}

impl Reconciler {
  pub fn new(global: &ReviewStore, context: &ReviewContext, interval: Duration) -> Option<Self> {
    let local = context.local_store()?.clone();
    Some(Self {
      global: global.clone(),
      local,
      interval: interval.max(MIN_INTERVAL),
    })
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  fn store(&self, side: Side) -> &ReviewStore {
    match side {
      Side::Global => &self.global,
      Side::Context => &self.local,
    }
  }

  /// One comparison. Collections are compared by review ids and content,
  /// never by size.
  pub async fn tick(&self) -> TickOutcome {
    let global = self.global.state();
    let local = self.local.state();

    let global_fp = global.fingerprint();
    let local_fp = local.fingerprint();
    if global_fp.same_content(&local_fp) {
      return TickOutcome::InSync;
    }

    // The side fetched longer ago is behind; ties go to the context
    let (behind, ahead) = if global.last_fetch_time < local.last_fetch_time {
      (Side::Global, local)
    } else {
      (Side::Context, global)
    };
    let store = self.store(behind);
    let state = store.state();

    debug!(
      ?behind,
      differing = ?global_fp.differing_ids(&local_fp),
      "review states diverged"
    );

    if state.loading {
      return TickOutcome::Skipped(behind);
    }
    if state.filters != ahead.filters {
      store.set_filters(ahead.filters.clone());
    }

    // Network-only so concurrent refetches of the same list share one
    // request in the client
    match store.fetch_reviews(FetchPolicy::NetworkOnly).await {
      Ok(reviews) => {
        info!(?behind, reviews = reviews.len(), "reconciled review state");
        TickOutcome::Refetched(behind)
      }
      Err(e) => {
        warn!(?behind, error = %e, "reconcile refetch failed");
        TickOutcome::Failed(behind, e)
      }
    }
  }

  /// Tick every interval and after the service reports writes. Event
  /// driven ticks are at least [`MIN_INTERVAL`] apart; events arriving in
  /// between are folded into the next tick.
  pub fn spawn(self, mut events: broadcast::Receiver<ServiceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      let mut events_open = true;
      let mut last_tick: Option<Instant> = None;

      loop {
        tokio::select! {
          _ = ticker.tick() => {}
          event = events.recv(), if events_open => {
            match event {
              Ok(event) => debug!(?event, "reconciling after service event"),
              Err(RecvError::Lagged(skipped)) => debug!(skipped, "service events lagged"),
              Err(RecvError::Closed) => {
                events_open = false;
                continue;
              }
            }
            if let Some(last) = last_tick {
              tokio::time::sleep_until(last + MIN_INTERVAL).await;
            }
            let folded = drain(&mut events);
            if folded > 0 {
              debug!(folded, "folded service events into one tick");
            }
          }
        }
        last_tick = Some(Instant::now());
        self.tick().await;
      }
    })
  }
}

/// Discard queued events. Returns how many there were.
fn drain(events: &mut broadcast::Receiver<ServiceEvent>) -> u64 {
  let mut drained = 0;
  loop {
    match events.try_recv() {
      Ok(_) => drained += 1,
      Err(TryRecvError::Lagged(skipped)) => drained += skipped,
      Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return drained,
    }
  }
}
