//! Deterministic cache keys for remote fetches.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::model::ItemKind;

/// Which items a listing fetch asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateScope {
  Open,
  All,
}

impl StateScope {
  pub fn as_str(&self) -> &'static str {
    match self {
      StateScope::Open => "open",
      StateScope::All => "all",
    }
  }
}

/// Query parameters passed through to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchParams {
  pub state: StateScope,
}

impl Default for FetchParams {
  fn default() -> Self {
    Self {
      state: StateScope::All,
    }
  }
}

/// One remote fetch, described by its parameters only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchRequest {
  Items {
    repo: String,
    kind: ItemKind,
    params: FetchParams,
  },
  Members {
    org: String,
  },
}

impl FetchRequest {
  /// Key for this request against the source at `endpoint`.
  ///
  /// Repository and organization names are case-insensitive on the remote
  /// side, so they are lowercased before hashing.
  pub fn fingerprint(&self, endpoint: &str) -> Fingerprint {
    let input = match self {
      Self::Items { repo, kind, params } => format!(
        "{}\nitems\n{}\n{}\nstate={}",
        endpoint.trim_end_matches('/'),
        kind.as_str(),
        repo.to_lowercase(),
        params.state.as_str()
      ),
      Self::Members { org } => format!(
        "{}\nmembers\n{}",
        endpoint.trim_end_matches('/'),
        org.to_lowercase()
      ),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
  }

  /// Human-readable target for logs and error reports.
  pub fn description(&self) -> String {
    match self {
      Self::Items { repo, kind, params } => {
        format!("{repo} {kind}s (state={})", params.state.as_str())
      }
      Self::Members { org } => format!("{org} members"),
    }
  }
}

/// Hex-encoded SHA-256 of a request's parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<String> for Fingerprint {
  fn from(s: String) -> Self {
    Fingerprint(s)
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const API: &str = "https://api.github.com";

  fn issues(repo: &str, state: StateScope) -> FetchRequest {
    FetchRequest::Items {
      repo: repo.to_string(),
      kind: ItemKind::Issue,
      params: FetchParams { state },
    }
  }

  #[test]
  fn test_identical_requests_share_a_fingerprint() {
    let a = issues("kubernetes/minikube", StateScope::All).fingerprint(API);
    let b = issues("Kubernetes/Minikube", StateScope::All).fingerprint(API);
    assert_eq!(a, b);
    assert_eq!(a.as_str().len(), 64);
  }

  #[test]
  fn test_every_parameter_changes_the_fingerprint() {
    let base = issues("a/b", StateScope::All);
    let prs = FetchRequest::Items {
      repo: "a/b".to_string(),
      kind: ItemKind::PullRequest,
      params: FetchParams::default(),
    };

    let fps = [
      base.fingerprint(API),
      base.fingerprint("https://ghe.example.com/api/v3"),
      issues("a/c", StateScope::All).fingerprint(API),
      issues("a/b", StateScope::Open).fingerprint(API),
      prs.fingerprint(API),
      FetchRequest::Members {
        org: "a".to_string(),
      }
      .fingerprint(API),
    ];
    for (i, x) in fps.iter().enumerate() {
      for y in &fps[i + 1..] {
        assert_ne!(x, y);
      }
    }
  }
}
