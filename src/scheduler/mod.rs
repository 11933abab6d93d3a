//! Adaptive refresh scheduler.
//!
//! One refresh cycle fetches every listing the rules need through the
//! response cache, evaluates the collections and publishes a new
//! [`Snapshot`]. Readers get the current snapshot from a `watch` channel and
//! never wait on a running cycle. Cycles are serialized by a single-flight
//! lock.

mod clock;
mod interval;
mod plan;
mod snapshot;

pub use clock::{Clock, ManualClock, SystemClock};
pub use interval::AdaptiveInterval;
pub use plan::FetchPlan;
pub use snapshot::{SourceFailure, Snapshot};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, TryFutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLayer, Payload, ResponseCache};
use crate::config::{Refresh, Ruleset};
use crate::engine::{self, EvalContext, Membership};
use crate::error::{Error, Result};
use crate::fingerprint::FetchRequest;
use crate::model::{Item, ItemId, ItemKind};
use crate::source::{Source, SourceError};

/// Callback run after each published snapshot, normally `ResponseCache::save_async`.
pub type PersistFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Running,
  /// Terminal: the loop was cancelled or hit a fatal error.
  Stopped,
}

/// Scheduler status for staleness display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerState {
  pub last_run_at: Option<DateTime<Utc>>,
  pub next_run_at: Option<DateTime<Utc>>,
  pub phase: Phase,
  /// Interval the loop will sleep after the most recent cycle.
  pub interval: Duration,
}

impl SchedulerState {
  pub fn running(&self) -> bool {
    self.phase == Phase::Running
  }
}

/// Mutable state owned by whichever cycle holds the single-flight lock.
struct CycleState {
  interval: AdaptiveInterval,
  generation: u64,
}

/// What a completed cycle produced, beyond the published snapshot.
struct CycleOutcome {
  first_transient: Option<Error>,
  persist_error: Option<Error>,
}

pub struct Scheduler {
  ruleset: Arc<Ruleset>,
  source: Arc<dyn Source>,
  cache: CacheLayer,
  clock: Arc<dyn Clock>,
  refresh: Refresh,
  plan: FetchPlan,
  persist: Option<PersistFn>,
  snapshot: watch::Sender<Arc<Snapshot>>,
  state: watch::Sender<SchedulerState>,
  cycle: Mutex<CycleState>,
}

impl Scheduler {
  pub fn new(
    ruleset: Arc<Ruleset>,
    source: Arc<dyn Source>,
    cache: Arc<ResponseCache>,
    refresh: Refresh,
  ) -> Self {
    Self::with_clock(ruleset, source, cache, refresh, Arc::new(SystemClock))
  }

  pub fn with_clock(
    ruleset: Arc<Ruleset>,
    source: Arc<dyn Source>,
    cache: Arc<ResponseCache>,
    refresh: Refresh,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let interval = AdaptiveInterval::new(refresh.min, refresh.max);
    let plan = FetchPlan::from_ruleset(&ruleset);
    let (snapshot, _) = watch::channel(Arc::new(Snapshot::empty(clock.now())));
    let (state, _) = watch::channel(SchedulerState {
      last_run_at: None,
      next_run_at: None,
      phase: Phase::Idle,
      interval: interval.current(),
    });

    Self {
      ruleset,
      source,
      cache: CacheLayer::new(cache),
      clock,
      refresh,
      plan,
      persist: None,
      snapshot,
      state,
      cycle: Mutex::new(CycleState {
        interval,
        generation: 0,
      }),
    }
  }

  /// Run `persist` after every cycle that publishes a snapshot.
  pub fn with_persist(mut self, persist: PersistFn) -> Self {
    self.persist = Some(persist);
    self
  }

  pub fn refresh(&self) -> Refresh {
    self.refresh
  }

  pub fn plan(&self) -> &FetchPlan {
    &self.plan
  }

  /// The currently published snapshot. Never blocks.
  pub fn snapshot(&self) -> Arc<Snapshot> {
    self.snapshot.borrow().clone()
  }

  /// Receiver notified each time a new snapshot is published.
  pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
    self.snapshot.subscribe()
  }

  pub fn state(&self) -> SchedulerState {
    self.state.borrow().clone()
  }

  pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
    self.state.subscribe()
  }

  /// Whether viewers should be warned that data is old: nothing published
  /// yet, or the snapshot is older than twice `max_refresh`.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    let snapshot = self.snapshot();
    if snapshot.generation == 0 {
      return true;
    }
    let limit = self.refresh.max.saturating_mul(2);
    match snapshot.age(now).to_std() {
      Ok(age) => age > limit,
      // Negative age: generated "in the future" relative to `now`
      Err(_) => false,
    }
  }

  /// Handle that lets another task force a refresh.
  pub fn refresh_handle(self: &Arc<Self>, cancel: CancellationToken) -> RefreshHandle {
    RefreshHandle {
      scheduler: Arc::clone(self),
      cancel,
    }
  }

  /// Run one refresh cycle.
  ///
  /// Without `force`, the cycle is skipped when the previous one started less
  /// than `min_refresh` ago. With `force`, every listing is refetched even if
  /// its cached copy is fresh; membership keeps its own cadence. Transient
  /// source failures are recorded in the snapshot; a forced run also returns
  /// the first of them as an error, as it does a failed persist. Fatal source
  /// failures abort the cycle without publishing.
  pub async fn run_once(&self, cancel: &CancellationToken, force: bool) -> Result<()> {
    let mut cycle = self.cycle.lock().await;
    if cancel.is_cancelled() {
      return Err(Error::Cancelled);
    }

    let now = self.clock.now();
    if !force {
      let last_run_at = self.state.borrow().last_run_at;
      if let Some(last) = last_run_at {
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.refresh.min {
          debug!(?elapsed, "skipping refresh, previous cycle too recent");
          return Ok(());
        }
      }
    }

    self.state.send_modify(|s| s.phase = Phase::Running);
    let outcome = tokio::select! {
      _ = cancel.cancelled() => Err(Error::Cancelled),
      outcome = self.cycle(now, force, &mut cycle) => outcome,
    };

    let interval = cycle.interval.current();
    self.state.send_modify(|s| {
      s.phase = Phase::Idle;
      if outcome.is_ok() {
        s.last_run_at = Some(now);
        s.interval = interval;
        s.next_run_at = chrono::Duration::from_std(interval)
          .ok()
          .and_then(|d| now.checked_add_signed(d));
      }
    });

    let outcome = outcome?;
    if force {
      if let Some(err) = outcome.first_transient {
        return Err(err);
      }
      if let Some(err) = outcome.persist_error {
        return Err(err);
      }
    }
    Ok(())
  }

  /// Refresh until `cancel` fires or a fatal error occurs.
  ///
  /// Returns `Ok(())` on cancellation. Cancellation is observed between
  /// cycles and at any pending fetch.
  pub async fn run_loop(&self, cancel: &CancellationToken) -> Result<()> {
    info!(
      min = ?self.refresh.min,
      max = ?self.refresh.max,
      fetches = self.plan.len(),
      "refresh loop started"
    );

    let result = loop {
      match self.run_once(cancel, false).await {
        Ok(()) => {}
        Err(Error::Cancelled) => break Ok(()),
        Err(err) => {
          error!(error = %err, "refresh loop stopped");
          break Err(err);
        }
      }

      let wait = self.state.borrow().interval;
      debug!(?wait, "sleeping until next refresh");
      tokio::select! {
        _ = cancel.cancelled() => break Ok(()),
        _ = self.clock.sleep(wait) => {}
      }
    };

    self.state.send_modify(|s| {
      s.phase = Phase::Stopped;
      s.next_run_at = None;
    });
    if result.is_ok() {
      info!("refresh loop cancelled");
    }
    result
  }

  async fn cycle(
    &self,
    now: DateTime<Utc>,
    force: bool,
    cycle: &mut CycleState,
  ) -> Result<CycleOutcome> {
    let mut failures = Vec::new();
    let mut first_transient = None;
    let listing_max_age = if force { Duration::ZERO } else { self.refresh.min };

    let mut items: BTreeMap<ItemId, Arc<Item>> = BTreeMap::new();
    for request in self.plan.listings() {
      let Some(payload) = self
        .fetch(&request, listing_max_age, now, &mut failures, &mut first_transient)
        .await?
      else {
        continue;
      };
      for item in payload.items() {
        items
          .entry(item.id())
          .or_insert_with(|| Arc::new(item.clone()));
      }
    }

    let mut membership = Membership::default();
    for request in self.plan.membership() {
      let FetchRequest::Members { org } = &request else {
        continue;
      };
      if let Some(payload) = self
        .fetch(&request, self.refresh.membership, now, &mut failures, &mut first_transient)
        .await?
      {
        membership.insert(org, payload.members());
      }
    }

    let items: Vec<Arc<Item>> = items.into_values().collect();
    let ctx = EvalContext {
      now,
      membership: &membership,
    };
    let collections = engine::evaluate_all(&self.ruleset, &items, &ctx);

    cycle.generation += 1;
    let snapshot = Snapshot {
      generation: cycle.generation,
      generated_at: now,
      collections,
      source_errors: failures,
    };
    let had_transient = snapshot.is_partial();
    info!(
      generation = snapshot.generation,
      items = items.len(),
      collections = snapshot.collections.len(),
      errors = snapshot.source_errors.len(),
      "published snapshot"
    );
    self.snapshot.send_replace(Arc::new(snapshot));

    let next = cycle.interval.record(had_transient);
    debug!(?next, had_transient, "adjusted refresh interval");

    let persist_error = match &self.persist {
      Some(persist) => match persist().await {
        Ok(()) => None,
        Err(err) => {
          warn!(error = %err, "failed to persist cache, will retry after next cycle");
          Some(err)
        }
      },
      None => None,
    };

    Ok(CycleOutcome {
      first_transient,
      persist_error,
    })
  }

  /// Fetch one request through the cache.
  ///
  /// Transient failures are recorded and yield the stale payload if one
  /// exists; fatal failures are returned.
  async fn fetch(
    &self,
    request: &FetchRequest,
    max_age: Duration,
    now: DateTime<Utc>,
    failures: &mut Vec<SourceFailure>,
    first_transient: &mut Option<Error>,
  ) -> Result<Option<Arc<Payload>>> {
    let target = request.description();
    let fingerprint = request.fingerprint(self.source.endpoint());
    let source = &self.source;

    let fetched = self
      .cache
      .fetch(&fingerprint, max_age, now, || match request {
        FetchRequest::Items { repo, kind, params } => match kind {
          ItemKind::Issue => source.fetch_issues(repo, params),
          ItemKind::PullRequest => source.fetch_pull_requests(repo, params),
        }
        .map_ok(Payload::Items)
        .boxed(),
        FetchRequest::Members { org } => source
          .fetch_membership(org)
          .map_ok(Payload::Members)
          .boxed(),
      })
      .await;

    let (payload, error) = match fetched {
      Ok(result) => (Some(result.payload), result.error),
      Err(err) if err.is_transient() => (None, Some(err)),
      Err(err) => {
        error!(request = %target, error = %err, "fatal source error");
        return Err(Error::from_source(target, err));
      }
    };

    if let Some(err) = error {
      record_failure(&target, err, payload.is_some(), failures, first_transient);
    }
    Ok(payload)
  }
}

fn record_failure(
  target: &str,
  err: SourceError,
  served_stale: bool,
  failures: &mut Vec<SourceFailure>,
  first_transient: &mut Option<Error>,
) {
  warn!(request = %target, error = %err, served_stale, "transient source error");
  failures.push(SourceFailure {
    target: target.to_string(),
    message: err.to_string(),
    served_stale,
  });
  if first_transient.is_none() {
    *first_transient = Some(Error::from_source(target, err));
  }
}

/// Cloneable trigger for an immediate forced refresh.
#[derive(Clone)]
pub struct RefreshHandle {
  scheduler: Arc<Scheduler>,
  cancel: CancellationToken,
}

impl RefreshHandle {
  /// Equivalent to `run_once(cancel, true)`; waits for any running cycle first.
  pub async fn refresh(&self) -> Result<()> {
    self.scheduler.run_once(&self.cancel, true).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::LoadOptions;
  use crate::model::ItemState;
  use crate::source::MemorySource;
  use chrono::TimeZone;
  use std::sync::atomic::{AtomicUsize, Ordering};

  const CONFIG: &str = r#"
settings:
  repos: [a/b]
rules:
  - id: bugs
    kind: issue
    filters:
      - {tag: label, value: bug}
  - id: external
    kind: issue
    filters:
      - {tag: author-member, value: acme, negate: true}
collections:
  - id: bugs
    rule-ids: [bugs]
  - id: external
    rule-ids: [external]
"#;

  fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
  }

  fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
  }

  fn issues() -> Vec<Item> {
    let mut bug = Item::new("a/b", 1, ItemKind::Issue, start() - chrono::Duration::days(3));
    bug.labels.insert("bug".into());
    bug.author = "insider".into();
    let mut feature = Item::new("a/b", 2, ItemKind::Issue, start() - chrono::Duration::days(2));
    feature.labels.insert("feature".into());
    feature.author = "visitor".into();
    vec![bug, feature]
  }

  struct Harness {
    scheduler: Arc<Scheduler>,
    source: Arc<MemorySource>,
    clock: Arc<ManualClock>,
    saves: Arc<AtomicUsize>,
  }

  fn harness(source: MemorySource, refresh: Refresh) -> Harness {
    let ruleset = Arc::new(Ruleset::from_yaml(CONFIG, "test", &LoadOptions::default()).unwrap());
    let source = Arc::new(source);
    let clock = Arc::new(ManualClock::new(start()));
    let saves = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&saves);

    let scheduler = Scheduler::with_clock(
      ruleset,
      source.clone(),
      Arc::new(ResponseCache::new("unused.db")),
      refresh,
      clock.clone(),
    )
    .with_persist(Arc::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Ok::<(), Error>(())).boxed()
    }));

    Harness {
      scheduler: Arc::new(scheduler),
      source,
      clock,
      saves,
    }
  }

  fn refresh(min: u64, max: u64) -> Refresh {
    Refresh {
      min: secs(min),
      max: secs(max),
      membership: secs(3600),
    }
  }

  fn numbers(snapshot: &Snapshot, collection: &str) -> Vec<u64> {
    snapshot
      .collection(collection)
      .unwrap()
      .items()
      .map(|i| i.number)
      .collect()
  }

  #[tokio::test]
  async fn test_cycle_publishes_snapshot_and_persists() {
    let h = harness(
      MemorySource::new()
        .with_items("a/b", issues())
        .with_members("acme", &["insider"]),
      refresh(60, 600),
    );
    let cancel = CancellationToken::new();
    let mut updates = h.scheduler.subscribe();
    assert!(h.scheduler.is_stale(start()));

    h.scheduler.run_once(&cancel, true).await.unwrap();

    assert!(updates.has_changed().unwrap());
    let snapshot = updates.borrow_and_update().clone();
    assert_eq!(snapshot.generation, 1);
    assert_eq!(numbers(&snapshot, "bugs"), vec![1]);
    assert_eq!(numbers(&snapshot, "external"), vec![2]);
    assert!(snapshot.source_errors.is_empty());
    assert_eq!(h.saves.load(Ordering::SeqCst), 1);

    let state = h.scheduler.state();
    assert_eq!(state.phase, Phase::Idle);
    assert_eq!(state.last_run_at, Some(start()));
    assert_eq!(state.next_run_at, Some(start() + chrono::Duration::seconds(60)));
    assert!(!h.scheduler.is_stale(start()));
    assert!(h.scheduler.is_stale(start() + chrono::Duration::seconds(1201)));
  }

  #[tokio::test]
  async fn test_forced_run_ignores_min_refresh_gate() {
    let h = harness(
      MemorySource::new().with_items("a/b", issues()),
      refresh(60, 600),
    );
    let cancel = CancellationToken::new();

    h.scheduler.run_once(&cancel, false).await.unwrap();
    h.clock.advance(secs(10));
    h.scheduler.run_once(&cancel, false).await.unwrap();
    assert_eq!(h.scheduler.snapshot().generation, 1);

    h.scheduler.run_once(&cancel, true).await.unwrap();
    assert_eq!(h.scheduler.snapshot().generation, 2);

    h.clock.advance(secs(60));
    h.scheduler.run_once(&cancel, false).await.unwrap();
    assert_eq!(h.scheduler.snapshot().generation, 3);
  }

  #[tokio::test]
  async fn test_transient_errors_back_off_within_bounds() {
    let h = harness(MemorySource::new().with_items("a/b", issues()), refresh(1, 60));
    h.source.fail_with(Some(SourceError::RateLimited { reset_at: None }));

    let cancel = CancellationToken::new();
    h.clock.cancel_after(3, cancel.clone());
    h.scheduler.run_loop(&cancel).await.unwrap();

    assert_eq!(h.clock.sleeps(), vec![secs(2), secs(4), secs(8)]);
    let snapshot = h.scheduler.snapshot();
    assert!(snapshot.is_partial());
    assert!(!snapshot.source_errors[0].served_stale);
    assert_eq!(h.scheduler.state().phase, Phase::Stopped);
  }

  #[tokio::test]
  async fn test_interval_recovers_after_clean_cycles() {
    let h = harness(MemorySource::new().with_items("a/b", issues()), refresh(1, 60));
    let cancel = CancellationToken::new();

    h.source.fail_with(Some(SourceError::Network("reset".into())));
    h.clock.cancel_after(3, cancel.clone());
    h.scheduler.run_loop(&cancel).await.unwrap();

    h.source.fail_with(None);
    let cancel = CancellationToken::new();
    h.clock.cancel_after(6, cancel.clone());
    // A stopped loop can be restarted with a fresh token
    h.scheduler.run_loop(&cancel).await.unwrap();

    let sleeps = h.clock.sleeps();
    assert_eq!(sleeps[3..], [secs(4), secs(2), secs(1)]);
    assert!(sleeps.iter().all(|s| *s >= secs(1) && *s <= secs(60)));
  }

  #[tokio::test]
  async fn test_forced_run_reports_transient_error() {
    let h = harness(MemorySource::new().with_items("a/b", issues()), refresh(60, 600));
    h.source.fail_with(Some(SourceError::Server("502 Bad Gateway".into())));

    let cancel = CancellationToken::new();
    let err = h.scheduler.run_once(&cancel, true).await.unwrap_err();
    assert!(err.is_transient());
    // The partial snapshot is still published
    assert_eq!(h.scheduler.snapshot().generation, 1);

    h.clock.advance(secs(60));
    h.scheduler.run_once(&cancel, false).await.unwrap();
  }

  #[tokio::test]
  async fn test_stale_cache_served_when_source_fails() {
    let h = harness(MemorySource::new().with_items("a/b", issues()), refresh(60, 600));
    let cancel = CancellationToken::new();
    h.scheduler.run_once(&cancel, true).await.unwrap();

    h.clock.advance(secs(120));
    h.source.fail_with(Some(SourceError::RateLimited { reset_at: None }));
    h.scheduler.run_once(&cancel, false).await.unwrap();

    let snapshot = h.scheduler.snapshot();
    assert_eq!(snapshot.generation, 2);
    assert_eq!(numbers(&snapshot, "bugs"), vec![1]);
    assert!(snapshot.source_errors.iter().all(|f| f.served_stale));
  }

  #[tokio::test]
  async fn test_fatal_error_stops_loop() {
    // No items registered for a/b: the source reports it inaccessible
    let h = harness(MemorySource::new(), refresh(1, 60));
    let cancel = CancellationToken::new();

    let err = h.scheduler.run_loop(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::SourceFatal { .. }));
    assert_eq!(h.scheduler.state().phase, Phase::Stopped);
    assert_eq!(h.scheduler.snapshot().generation, 0);
    assert_eq!(h.saves.load(Ordering::SeqCst), 0);
    assert!(h.clock.sleeps().is_empty());
  }

  #[tokio::test]
  async fn test_membership_refreshes_on_coarse_cadence() {
    let h = harness(
      MemorySource::new()
        .with_items("a/b", issues())
        .with_members("acme", &["insider"]),
      refresh(60, 600),
    );
    let cancel = CancellationToken::new();

    h.scheduler.run_once(&cancel, false).await.unwrap();
    assert_eq!(h.source.calls(), 2);

    h.clock.advance(secs(120));
    h.scheduler.run_once(&cancel, false).await.unwrap();
    // Issues refetched, membership still fresh
    assert_eq!(h.source.calls(), 3);

    h.clock.advance(secs(3600));
    h.scheduler.run_once(&cancel, false).await.unwrap();
    assert_eq!(h.source.calls(), 5);
  }

  #[tokio::test]
  async fn test_cancelled_token_stops_before_cycle() {
    let h = harness(MemorySource::new().with_items("a/b", issues()), refresh(60, 600));
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
      h.scheduler.run_once(&cancel, true).await,
      Err(Error::Cancelled)
    ));
    h.scheduler.run_loop(&cancel).await.unwrap();
    assert_eq!(h.source.calls(), 0);
    assert_eq!(h.scheduler.state().phase, Phase::Stopped);
  }

  #[tokio::test]
  async fn test_refresh_handle_forces_cycle() {
    let h = harness(MemorySource::new().with_items("a/b", issues()), refresh(60, 600));
    let cancel = CancellationToken::new();
    h.scheduler.run_once(&cancel, false).await.unwrap();
    assert_eq!(numbers(&h.scheduler.snapshot(), "bugs"), vec![1]);
    let calls = h.source.calls();

    let mut relabelled = issues();
    relabelled[0].labels.clear();
    relabelled[1].state = ItemState::Closed;
    h.source.set_items("a/b", relabelled);
    h.clock.advance(secs(10));

    let handle = h.scheduler.refresh_handle(cancel.clone());
    handle.refresh().await.unwrap();

    let snapshot = h.scheduler.snapshot();
    assert_eq!(snapshot.generation, 2);
    // Listing refetched despite a fresh cache entry
    assert_eq!(h.source.calls(), calls + 1);
    assert!(numbers(&snapshot, "bugs").is_empty());
    let external = snapshot.collection("external").unwrap();
    assert_eq!(external.matches[0].item.state, ItemState::Closed);
  }

  #[tokio::test]
  async fn test_unforced_run_refetches_only_after_min_refresh() {
    let h = harness(MemorySource::new().with_items("a/b", issues()), refresh(60, 600));
    let cancel = CancellationToken::new();
    h.scheduler.run_once(&cancel, true).await.unwrap();
    let calls = h.source.calls();

    h.source.set_items("a/b", Vec::new());
    h.clock.advance(secs(30));
    h.scheduler.run_once(&cancel, false).await.unwrap();
    assert_eq!(h.source.calls(), calls);
    assert_eq!(numbers(&h.scheduler.snapshot(), "bugs"), vec![1]);

    h.clock.advance(secs(30));
    h.scheduler.run_once(&cancel, false).await.unwrap();
    assert_eq!(h.source.calls(), calls + 1);
    assert!(numbers(&h.scheduler.snapshot(), "bugs").is_empty());
  }
}
