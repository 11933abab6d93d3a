//! Core types for the response cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::fingerprint::Fingerprint;
use crate::model::Item;
use crate::source::SourceError;

/// Raw result of one remote fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Payload {
  Items(Vec<Item>),
  Members(Vec<String>),
}

impl Payload {
  pub fn items(&self) -> &[Item] {
    match self {
      Payload::Items(items) => items,
      Payload::Members(_) => &[],
    }
  }

  pub fn members(&self) -> &[String] {
    match self {
      Payload::Members(members) => members,
      Payload::Items(_) => &[],
    }
  }

  pub fn len(&self) -> usize {
    match self {
      Payload::Items(items) => items.len(),
      Payload::Members(members) => members.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub fingerprint: Fingerprint,
  pub payload: Arc<Payload>,
  pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Younger than `max_age` at `now`. Entries stamped in the future count as fresh.
  pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    match (now - self.fetched_at).to_std() {
      Ok(age) => age < max_age,
      Err(_) => true,
    }
  }
}

/// Indicates where a fetch-through result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the source
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Source failed transiently; serving the last cached payload
  Offline,
}

/// Result from a fetch-through, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub payload: Arc<Payload>,
  pub source: CacheSource,
  /// When the payload was fetched from the source.
  pub fetched_at: DateTime<Utc>,
  /// The transient failure that forced an offline result.
  pub error: Option<SourceError>,
}

impl CacheResult {
  pub fn from_network(payload: Arc<Payload>, fetched_at: DateTime<Utc>) -> Self {
    Self {
      payload,
      source: CacheSource::Network,
      fetched_at,
      error: None,
    }
  }

  pub fn from_cache(entry: CacheEntry) -> Self {
    Self {
      payload: entry.payload,
      source: CacheSource::CacheFresh,
      fetched_at: entry.fetched_at,
      error: None,
    }
  }

  pub fn offline(entry: CacheEntry, error: SourceError) -> Self {
    Self {
      payload: entry.payload,
      source: CacheSource::Offline,
      fetched_at: entry.fetched_at,
      error: Some(error),
    }
  }
}
