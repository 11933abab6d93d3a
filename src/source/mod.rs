//! The remote data capability consumed by the scheduler.
//!
//! The scheduler only sees [`Source`]; [`GithubSource`] talks to the GitHub
//! REST API and [`MemorySource`] serves canned data for tests.

mod github;
mod memory;

pub use github::GithubSource;
pub use memory::MemorySource;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;

use crate::fingerprint::FetchParams;
use crate::model::Item;

/// Failures reported by a source. Rate limiting, network and server
/// failures are transient; everything else is not.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
  #[error("rate limit exceeded{}", .reset_at.map(|t| format!(" (resets {t})")).unwrap_or_default())]
  RateLimited { reset_at: Option<DateTime<Utc>> },

  #[error("network failure: {0}")]
  Network(String),

  #[error("server error: {0}")]
  Server(String),

  #[error("unexpected response: {0}")]
  Decode(String),

  #[error("unauthorized: {0}")]
  Unauthorized(String),

  #[error("not accessible: {0}")]
  Inaccessible(String),
}

impl SourceError {
  /// Whether retrying on the next cycle can reasonably succeed.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      SourceError::RateLimited { .. }
        | SourceError::Network(_)
        | SourceError::Server(_)
        | SourceError::Decode(_)
    )
  }
}

/// Paginated issue, pull request and membership data for repositories.
///
/// Implementations must be idempotent for identical parameters.
pub trait Source: Send + Sync {
  /// Identifies the remote endpoint; part of every cache fingerprint.
  fn endpoint(&self) -> &str;

  /// Issues only; pull requests are excluded.
  fn fetch_issues<'a>(
    &'a self,
    repo: &'a str,
    params: &'a FetchParams,
  ) -> BoxFuture<'a, Result<Vec<Item>, SourceError>>;

  fn fetch_pull_requests<'a>(
    &'a self,
    repo: &'a str,
    params: &'a FetchParams,
  ) -> BoxFuture<'a, Result<Vec<Item>, SourceError>>;

  /// Logins of the organization's members.
  fn fetch_membership<'a>(&'a self, org: &'a str)
    -> BoxFuture<'a, Result<Vec<String>, SourceError>>;
}
