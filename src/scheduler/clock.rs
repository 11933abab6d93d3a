//! Time source for the scheduler, replaceable in tests.

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  /// Resolves after `duration` has elapsed on this clock.
  fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }

  fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
    tokio::time::sleep(duration).boxed()
  }
}

/// Clock that only moves when told to.
///
/// `sleep` returns immediately after advancing the clock by the requested
/// duration and recording it.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
  sleeps: Mutex<Vec<Duration>>,
  cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
      sleeps: Mutex::new(Vec::new()),
      cancel_after: Mutex::new(None),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = lock(&self.now);
    *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
  }

  /// Every duration passed to `sleep`, in call order.
  pub fn sleeps(&self) -> Vec<Duration> {
    lock(&self.sleeps).clone()
  }

  /// Cancel `token` once `sleep` has been called `count` times.
  pub fn cancel_after(&self, count: usize, token: CancellationToken) {
    *lock(&self.cancel_after) = Some((count, token));
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *lock(&self.now)
  }

  fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
    self.advance(duration);
    let slept = {
      let mut sleeps = lock(&self.sleeps);
      sleeps.push(duration);
      sleeps.len()
    };
    if let Some((count, token)) = lock(&self.cancel_after).as_ref() {
      if slept >= *count {
        token.cancel();
      }
    }
    future::ready(()).boxed()
  }
}
