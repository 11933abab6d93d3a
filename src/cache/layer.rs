//! Fetch-through layer that decides between cached and fresh responses.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{CacheResult, Payload};
use super::store::ResponseCache;
use crate::fingerprint::Fingerprint;
use crate::source::SourceError;

/// Sits between the scheduler and the source, providing transparent caching
/// with offline fallback.
#[derive(Clone)]
pub struct CacheLayer {
  store: Arc<ResponseCache>,
}

impl CacheLayer {
  pub fn new(store: Arc<ResponseCache>) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &Arc<ResponseCache> {
    &self.store
  }

  /// Fetch with a cache-first strategy.
  ///
  /// 1. Cached and younger than `max_age`: return it without calling the source
  /// 2. Otherwise fetch and store the result, stamped `now`
  /// 3. On a transient failure, fall back to the stale entry if there is one
  ///
  /// Fatal failures are returned even when a cached entry exists.
  pub async fn fetch<F, Fut>(
    &self,
    fingerprint: &Fingerprint,
    max_age: Duration,
    now: DateTime<Utc>,
    fetcher: F,
  ) -> Result<CacheResult, SourceError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Payload, SourceError>>,
  {
    let cached = self.store.get(fingerprint);

    if let Some(entry) = &cached {
      if entry.is_fresh(now, max_age) {
        debug!(%fingerprint, "cache hit");
        return Ok(CacheResult::from_cache(entry.clone()));
      }
    }

    match fetcher().await {
      Ok(payload) => {
        let entry = self.store.set(fingerprint.clone(), payload, now);
        Ok(CacheResult::from_network(entry.payload, now))
      }
      Err(err) if err.is_transient() => match cached {
        Some(entry) => {
          warn!(%fingerprint, error = %err, "fetch failed, serving stale cache");
          Ok(CacheResult::offline(entry, err))
        }
        None => Err(err),
      },
      Err(err) => Err(err),
    }
  }
}
