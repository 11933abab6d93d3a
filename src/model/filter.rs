//! The closed filter vocabulary.
//!
//! Each configuration tag maps to exactly one [`Predicate`] variant; operands are
//! parsed when the configuration is loaded so evaluation never fails.

use regex::{Regex, RegexBuilder};

use super::item::{ItemKind, ItemState, ReviewState};
use super::parse::{AgeThreshold, Threshold};

/// Either "anyone/anything" (`*`) or one specific name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
  Any,
  Named(String),
}

impl Selector {
  fn parse(value: &str) -> Result<Self, String> {
    match value.trim() {
      "" => Err("expected a name or '*'".to_string()),
      "*" => Ok(Selector::Any),
      name => Ok(Selector::Named(name.to_string())),
    }
  }

  /// Case-insensitive membership test against a set of names.
  pub fn matches_any<'a>(&self, mut names: impl Iterator<Item = &'a String>) -> bool {
    match self {
      Selector::Any => names.next().is_some(),
      Selector::Named(want) => names.any(|n| n.eq_ignore_ascii_case(want)),
    }
  }
}

#[derive(Debug, Clone)]
pub enum Predicate {
  Label(String),
  Title(Regex),
  Body(Regex),
  Comments(Threshold),
  Reactions(Threshold),
  Created(AgeThreshold),
  Updated(AgeThreshold),
  Closed(AgeThreshold),
  Assignee(Selector),
  Reviewer(Selector),
  ReviewState(ReviewState),
  Milestone(Selector),
  Kind(ItemKind),
  State(ItemState),
  Author(String),
  /// Author belongs to the named organization; needs membership data.
  AuthorMember(String),
}

/// Every tag a configuration may use.
pub const FILTER_TAGS: &[&str] = &[
  "label",
  "title",
  "body",
  "comments",
  "reactions",
  "created",
  "updated",
  "closed",
  "assignee",
  "reviewer",
  "review-state",
  "milestone",
  "kind",
  "state",
  "author",
  "author-member",
];

fn pattern(value: &str) -> Result<Regex, String> {
  RegexBuilder::new(value)
    .case_insensitive(true)
    .build()
    .map_err(|e| format!("invalid pattern {value:?}: {e}"))
}

fn non_empty(value: &str) -> Result<String, String> {
  let v = value.trim();
  if v.is_empty() {
    Err("value must not be empty".to_string())
  } else {
    Ok(v.to_string())
  }
}

impl Predicate {
  /// Build a predicate from a configuration tag and its operand.
  pub fn parse(tag: &str, value: &str) -> Result<Self, String> {
    let predicate = match tag.trim() {
      "label" => Predicate::Label(non_empty(value)?),
      "title" => Predicate::Title(pattern(value)?),
      "body" => Predicate::Body(pattern(value)?),
      "comments" => Predicate::Comments(Threshold::parse(value)?),
      "reactions" => Predicate::Reactions(Threshold::parse(value)?),
      "created" => Predicate::Created(AgeThreshold::parse(value)?),
      "updated" => Predicate::Updated(AgeThreshold::parse(value)?),
      "closed" => Predicate::Closed(AgeThreshold::parse(value)?),
      "assignee" => Predicate::Assignee(Selector::parse(value)?),
      "reviewer" => Predicate::Reviewer(Selector::parse(value)?),
      "review-state" => Predicate::ReviewState(value.parse()?),
      "milestone" => Predicate::Milestone(Selector::parse(value)?),
      "kind" => Predicate::Kind(value.parse()?),
      "state" => Predicate::State(value.parse()?),
      "author" => Predicate::Author(non_empty(value)?),
      "author-member" => Predicate::AuthorMember(non_empty(value)?.to_lowercase()),
      other => {
        return Err(format!(
          "unknown filter tag {other:?} (expected one of: {})",
          FILTER_TAGS.join(", ")
        ))
      }
    };
    Ok(predicate)
  }
}

/// One primitive predicate with an optional negation.
#[derive(Debug, Clone)]
pub struct Filter {
  pub tag: String,
  pub value: String,
  pub predicate: Predicate,
  pub negate: bool,
}

impl Filter {
  pub fn parse(tag: &str, value: &str, negate: bool) -> Result<Self, String> {
    Ok(Self {
      tag: tag.trim().to_string(),
      value: value.to_string(),
      predicate: Predicate::parse(tag, value)?,
      negate,
    })
  }

  /// Organization whose membership this filter needs, if any.
  pub fn member_org(&self) -> Option<&str> {
    match &self.predicate {
      Predicate::AuthorMember(org) => Some(org),
      _ => None,
    }
  }

  /// True for a non-negated `state: open` filter.
  pub fn requires_open(&self) -> bool {
    !self.negate && matches!(self.predicate, Predicate::State(ItemState::Open))
  }
}
