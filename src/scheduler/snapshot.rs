use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::engine::CollectionResult;

/// A fetch that failed during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
  /// What was being fetched, e.g. `owner/repo issues (state=all)`.
  pub target: String,
  pub message: String,
  /// Whether the matching data came from a stale cache entry instead.
  pub served_stale: bool,
}

/// Immutable result of one refresh cycle.
#[derive(Debug, Clone)]
pub struct Snapshot {
  /// Zero for the placeholder published before the first cycle.
  pub generation: u64,
  pub generated_at: DateTime<Utc>,
  pub collections: BTreeMap<String, CollectionResult>,
  pub source_errors: Vec<SourceFailure>,
}

impl Snapshot {
  pub fn empty(generated_at: DateTime<Utc>) -> Self {
    Self {
      generation: 0,
      generated_at,
      collections: BTreeMap::new(),
      source_errors: Vec::new(),
    }
  }

  pub fn collection(&self, id: &str) -> Option<&CollectionResult> {
    self.collections.get(id)
  }

  /// True when at least one fetch failed and some data may be missing or stale.
  pub fn is_partial(&self) -> bool {
    !self.source_errors.is_empty()
  }

  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.generated_at
  }
}
