use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Identity of an item: repository plus issue/PR number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
  pub repo: String,
  pub number: u64,
}

impl fmt::Display for ItemId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.repo, self.number)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
  Issue,
  PullRequest,
}

impl ItemKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ItemKind::Issue => "issue",
      ItemKind::PullRequest => "pull-request",
    }
  }
}

impl FromStr for ItemKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "issue" | "issues" => Ok(ItemKind::Issue),
      "pull-request" | "pull-requests" | "pr" | "prs" | "pull" => Ok(ItemKind::PullRequest),
      other => Err(format!("unknown item kind {other:?}")),
    }
  }
}

impl fmt::Display for ItemKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
  Open,
  Closed,
  Merged,
}

impl FromStr for ItemState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "open" => Ok(ItemState::Open),
      "closed" => Ok(ItemState::Closed),
      "merged" => Ok(ItemState::Merged),
      other => Err(format!("unknown item state {other:?}")),
    }
  }
}

/// Aggregate review state of a pull request. Issues are always `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewState {
  #[default]
  None,
  Pending,
  Commented,
  ChangesRequested,
  Approved,
}

impl FromStr for ReviewState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('_', "-").as_str() {
      "none" => Ok(ReviewState::None),
      "pending" => Ok(ReviewState::Pending),
      "commented" => Ok(ReviewState::Commented),
      "changes-requested" => Ok(ReviewState::ChangesRequested),
      "approved" => Ok(ReviewState::Approved),
      other => Err(format!("unknown review state {other:?}")),
    }
  }
}

/// Unified view of a remote issue or pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
  pub repo: String,
  pub number: u64,
  pub kind: ItemKind,
  pub state: ItemState,
  pub title: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub author: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub closed_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub labels: BTreeSet<String>,
  #[serde(default)]
  pub assignees: BTreeSet<String>,
  /// Requested reviewers plus anyone who has already reviewed.
  #[serde(default)]
  pub reviewers: BTreeSet<String>,
  #[serde(default)]
  pub review_state: ReviewState,
  #[serde(default)]
  pub reactions: u32,
  #[serde(default)]
  pub comments: u32,
  #[serde(default)]
  pub milestone: Option<String>,
}

impl Item {
  /// An open item with no labels, people or activity, updated when created.
  pub fn new(
    repo: impl Into<String>,
    number: u64,
    kind: ItemKind,
    created_at: DateTime<Utc>,
  ) -> Self {
    Self {
      repo: repo.into(),
      number,
      kind,
      state: ItemState::Open,
      title: String::new(),
      body: String::new(),
      author: String::new(),
      created_at,
      updated_at: created_at,
      closed_at: None,
      labels: BTreeSet::new(),
      assignees: BTreeSet::new(),
      reviewers: BTreeSet::new(),
      review_state: ReviewState::None,
      reactions: 0,
      comments: 0,
      milestone: None,
    }
  }

  pub fn id(&self) -> ItemId {
    ItemId {
      repo: self.repo.clone(),
      number: self.number,
    }
  }

  pub fn html_url(&self) -> String {
    let segment = match self.kind {
      ItemKind::Issue => "issues",
      ItemKind::PullRequest => "pull",
    };
    format!("https://github.com/{}/{}/{}", self.repo, segment, self.number)
  }
}
