use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::filter::Filter;
use super::item::{Item, ItemKind};

/// Named predicate over items: all filters must hold (AND).
#[derive(Debug, Clone)]
pub struct Rule {
  pub id: String,
  pub name: String,
  /// `owner/name` repositories this rule looks at.
  pub repos: Vec<String>,
  /// `None` means both issues and pull requests.
  pub kind: Option<ItemKind>,
  pub filters: Vec<Filter>,
}

impl Rule {
  /// Item kinds this rule needs fetched.
  pub fn kinds(&self) -> Vec<ItemKind> {
    match self.kind {
      Some(kind) => vec![kind],
      None => vec![ItemKind::Issue, ItemKind::PullRequest],
    }
  }

  /// Whether the item is in one of this rule's repositories and of its kind.
  pub fn covers(&self, item: &Item) -> bool {
    self.kind.map_or(true, |k| k == item.kind)
      && self
        .repos
        .iter()
        .any(|r| r.eq_ignore_ascii_case(&item.repo))
  }
}

/// Ordering applied to a collection's merged matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayPolicy {
  #[default]
  UpdatedDesc,
  UpdatedAsc,
  CreatedDesc,
  CreatedAsc,
  CommentsDesc,
  ReactionsDesc,
  /// First-seen rule order, no further sorting.
  RuleOrder,
}

impl FromStr for DisplayPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "updated-desc" | "recently-updated" => Ok(DisplayPolicy::UpdatedDesc),
      "updated-asc" => Ok(DisplayPolicy::UpdatedAsc),
      "created-desc" | "newest" => Ok(DisplayPolicy::CreatedDesc),
      "created-asc" | "oldest" => Ok(DisplayPolicy::CreatedAsc),
      "comments-desc" => Ok(DisplayPolicy::CommentsDesc),
      "reactions-desc" => Ok(DisplayPolicy::ReactionsDesc),
      "rule-order" => Ok(DisplayPolicy::RuleOrder),
      other => Err(format!("unknown display policy {other:?}")),
    }
  }
}

impl fmt::Display for DisplayPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      DisplayPolicy::UpdatedDesc => "updated-desc",
      DisplayPolicy::UpdatedAsc => "updated-asc",
      DisplayPolicy::CreatedDesc => "created-desc",
      DisplayPolicy::CreatedAsc => "created-asc",
      DisplayPolicy::CommentsDesc => "comments-desc",
      DisplayPolicy::ReactionsDesc => "reactions-desc",
      DisplayPolicy::RuleOrder => "rule-order",
    };
    f.write_str(s)
  }
}

/// Named, de-duplicated, ordered merge of one or more rules' matches.
#[derive(Debug, Clone)]
pub struct Collection {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  pub rule_ids: Vec<String>,
  pub display_policy: DisplayPolicy,
}
