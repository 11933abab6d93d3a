//! Serde-deserializable types matching GitHub REST API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping [`Item`] focused on what rules evaluate.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Item, ItemKind, ItemState, ReviewState};

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiUser {
  pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiLabel {
  pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiMilestone {
  pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiReactions {
  #[serde(default)]
  pub total_count: u32,
}

/// Present on issue listings when the issue is really a pull request.
#[derive(Debug, Deserialize)]
pub struct ApiPullRef {
  pub merged_at: Option<DateTime<Utc>>,
}

// ============================================================================
// /repos/{repo}/issues
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiIssue {
  pub number: u64,
  #[serde(default)]
  pub title: String,
  pub body: Option<String>,
  pub state: String,
  pub user: Option<ApiUser>,
  #[serde(default)]
  pub labels: Vec<ApiLabel>,
  #[serde(default)]
  pub assignees: Vec<ApiUser>,
  pub milestone: Option<ApiMilestone>,
  #[serde(default)]
  pub comments: u32,
  pub reactions: Option<ApiReactions>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub closed_at: Option<DateTime<Utc>>,
  pub pull_request: Option<ApiPullRef>,
}

impl ApiIssue {
  pub fn is_pull_request(&self) -> bool {
    self.pull_request.is_some()
  }

  pub fn into_item(self, repo: &str) -> Item {
    let kind = if self.is_pull_request() {
      ItemKind::PullRequest
    } else {
      ItemKind::Issue
    };
    let merged = self
      .pull_request
      .as_ref()
      .is_some_and(|pr| pr.merged_at.is_some());
    let state = if merged {
      ItemState::Merged
    } else if self.state.eq_ignore_ascii_case("closed") {
      ItemState::Closed
    } else {
      ItemState::Open
    };

    Item {
      repo: repo.to_string(),
      number: self.number,
      kind,
      state,
      title: self.title,
      body: self.body.unwrap_or_default(),
      author: self.user.map(|u| u.login).unwrap_or_default(),
      created_at: self.created_at,
      updated_at: self.updated_at,
      closed_at: self.closed_at,
      labels: self.labels.into_iter().map(|l| l.name).collect(),
      assignees: self.assignees.into_iter().map(|u| u.login).collect(),
      reviewers: BTreeSet::new(),
      review_state: ReviewState::None,
      reactions: self.reactions.map(|r| r.total_count).unwrap_or_default(),
      comments: self.comments,
      milestone: self.milestone.map(|m| m.title),
    }
  }
}

// ============================================================================
// /repos/{repo}/pulls and /pulls/{n}/reviews
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiPull {
  pub number: u64,
  #[serde(default)]
  pub requested_reviewers: Vec<ApiUser>,
}

#[derive(Debug, Deserialize)]
pub struct ApiReview {
  pub user: Option<ApiUser>,
  pub state: String,
}

/// Fold requested reviewers and submitted reviews into an aggregate state.
///
/// Each reviewer's latest approving/blocking review wins over their comments;
/// any outstanding change request blocks, then approval, then comments, then
/// pending requests.
pub fn review_summary(
  requested: &[ApiUser],
  reviews: &[ApiReview],
) -> (ReviewState, BTreeSet<String>) {
  let mut latest: BTreeMap<&str, ReviewState> = BTreeMap::new();
  for review in reviews {
    let Some(user) = review.user.as_ref() else {
      continue;
    };
    let state = match review.state.as_str() {
      "APPROVED" => ReviewState::Approved,
      "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
      "COMMENTED" => ReviewState::Commented,
      "DISMISSED" => {
        latest.remove(user.login.as_str());
        continue;
      }
      _ => continue,
    };
    let entry = latest.entry(user.login.as_str()).or_insert(state);
    if state != ReviewState::Commented || *entry == ReviewState::Commented {
      *entry = state;
    }
  }

  let mut reviewers: BTreeSet<String> = requested.iter().map(|u| u.login.clone()).collect();
  reviewers.extend(latest.keys().map(|l| l.to_string()));

  let has = |s: ReviewState| latest.values().any(|v| *v == s);
  let state = if has(ReviewState::ChangesRequested) {
    ReviewState::ChangesRequested
  } else if has(ReviewState::Approved) {
    ReviewState::Approved
  } else if has(ReviewState::Commented) {
    ReviewState::Commented
  } else if !requested.is_empty() {
    ReviewState::Pending
  } else {
    ReviewState::None
  };
  (state, reviewers)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_issue_conversion() {
    let raw = serde_json::json!({
      "number": 42,
      "title": "Crash on start",
      "body": null,
      "state": "open",
      "user": { "login": "octocat" },
      "labels": [{ "name": "bug" }, { "name": "priority/p1" }],
      "assignees": [{ "login": "hubot" }],
      "milestone": { "title": "v1.2" },
      "comments": 3,
      "reactions": { "total_count": 7, "+1": 7 },
      "created_at": "2024-01-01T00:00:00Z",
      "updated_at": "2024-01-02T00:00:00Z",
      "closed_at": null
    });
    let issue: ApiIssue = serde_json::from_value(raw).unwrap();
    assert!(!issue.is_pull_request());

    let item = issue.into_item("a/b");
    assert_eq!(item.kind, ItemKind::Issue);
    assert_eq!(item.state, ItemState::Open);
    assert_eq!(item.author, "octocat");
    assert!(item.labels.contains("priority/p1"));
    assert_eq!(item.reactions, 7);
    assert_eq!(item.comments, 3);
    assert_eq!(item.milestone.as_deref(), Some("v1.2"));
    assert_eq!(item.body, "");
  }

  #[test]
  fn test_merged_pull_request_conversion() {
    let raw = serde_json::json!({
      "number": 7,
      "title": "Fix crash",
      "state": "closed",
      "user": { "login": "octocat" },
      "created_at": "2024-01-01T00:00:00Z",
      "updated_at": "2024-01-03T00:00:00Z",
      "closed_at": "2024-01-03T00:00:00Z",
      "pull_request": { "merged_at": "2024-01-03T00:00:00Z" }
    });
    let item = serde_json::from_value::<ApiIssue>(raw)
      .unwrap()
      .into_item("a/b");
    assert_eq!(item.kind, ItemKind::PullRequest);
    assert_eq!(item.state, ItemState::Merged);
  }

  fn review(login: &str, state: &str) -> ApiReview {
    ApiReview {
      user: Some(ApiUser {
        login: login.to_string(),
      }),
      state: state.to_string(),
    }
  }

  #[test]
  fn test_review_summary() {
    let requested = vec![ApiUser {
      login: "carol".to_string(),
    }];
    assert_eq!(review_summary(&requested, &[]).0, ReviewState::Pending);
    assert_eq!(review_summary(&[], &[]).0, ReviewState::None);

    let reviews = vec![
      review("alice", "CHANGES_REQUESTED"),
      review("alice", "COMMENTED"),
      review("bob", "COMMENTED"),
    ];
    let (state, reviewers) = review_summary(&requested, &reviews);
    assert_eq!(state, ReviewState::ChangesRequested);
    assert_eq!(
      reviewers.into_iter().collect::<Vec<_>>(),
      vec!["alice", "bob", "carol"]
    );

    let reviews = vec![review("alice", "CHANGES_REQUESTED"), review("alice", "APPROVED")];
    assert_eq!(review_summary(&[], &reviews).0, ReviewState::Approved);

    let reviews = vec![review("alice", "APPROVED"), review("alice", "DISMISSED")];
    assert_eq!(review_summary(&[], &reviews).0, ReviewState::None);
  }
}
