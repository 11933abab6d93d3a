//! Error taxonomy shared by every stage of the refresh pipeline.

use std::path::PathBuf;
use thiserror::Error;

use crate::source::SourceError;

/// Errors raised while loading configuration, touching the response cache,
/// or running a refresh cycle.
#[derive(Debug, Error)]
pub enum Error {
  /// Malformed or missing configuration. Fatal at load.
  #[error("config {path}: {message}")]
  Config { path: String, message: String },

  /// A rule or collection references something the configuration does not define.
  #[error("rule {rule}: {message}")]
  RuleValidation { rule: String, message: String },

  /// Missing or unusable credentials. Fatal at startup.
  #[error("authentication: {0}")]
  Auth(String),

  /// The cache file could not be read or written.
  #[error("cache {}: {message}", .path.display())]
  CacheIo { path: PathBuf, message: String },

  /// The cache file exists but does not contain a readable response map.
  #[error("cache {} is corrupt: {message}", .path.display())]
  CacheCorrupt { path: PathBuf, message: String },

  /// Rate limiting or network failure. Retried on the next cycle.
  #[error("{target}: {source}")]
  SourceTransient {
    target: String,
    #[source]
    source: SourceError,
  },

  /// Persistent rejection by the remote API (revoked auth, repository gone).
  #[error("{target}: {source}")]
  SourceFatal {
    target: String,
    #[source]
    source: SourceError,
  },

  /// The cancellation token fired while a cycle was in flight.
  #[error("refresh cancelled")]
  Cancelled,
}

impl Error {
  pub(crate) fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
    Error::Config {
      path: path.into(),
      message: message.into(),
    }
  }

  pub(crate) fn rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
    Error::RuleValidation {
      rule: rule.into(),
      message: message.into(),
    }
  }

  /// Wrap a source failure for `target`, keeping its transient/fatal classification.
  pub fn from_source(target: impl Into<String>, source: SourceError) -> Self {
    let target = target.into();
    if source.is_transient() {
      Error::SourceTransient { target, source }
    } else {
      Error::SourceFatal { target, source }
    }
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, Error::SourceTransient { .. })
  }
}

pub type Result<T> = std::result::Result<T, Error>;
