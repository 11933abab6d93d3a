use std::collections::{BTreeMap, BTreeSet};

use crate::config::Ruleset;
use crate::fingerprint::{FetchParams, FetchRequest, StateScope};
use crate::model::ItemKind;

/// Everything one refresh cycle needs from the source, derived from the rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchPlan {
  listings: BTreeMap<(String, ItemKind), StateScope>,
  orgs: BTreeSet<String>,
}

impl FetchPlan {
  /// Only the kinds some rule needs are listed. A listing is narrowed to open
  /// items when every rule reading it requires `state: open`.
  pub fn from_ruleset(ruleset: &Ruleset) -> Self {
    let mut plan = Self::default();

    for rule in ruleset.rules() {
      let scope = if rule.filters.iter().any(|f| f.requires_open()) {
        StateScope::Open
      } else {
        StateScope::All
      };

      for repo in &rule.repos {
        for kind in rule.kinds() {
          plan
            .listings
            .entry((repo.clone(), kind))
            .and_modify(|existing| {
              if scope == StateScope::All {
                *existing = StateScope::All;
              }
            })
            .or_insert(scope);
        }
      }

      plan
        .orgs
        .extend(rule.filters.iter().filter_map(|f| f.member_org()).map(str::to_string));
    }

    plan
  }

  /// Listing requests in repository then kind order.
  pub fn listings(&self) -> impl Iterator<Item = FetchRequest> + '_ {
    self
      .listings
      .iter()
      .map(|((repo, kind), state)| FetchRequest::Items {
        repo: repo.clone(),
        kind: *kind,
        params: FetchParams { state: *state },
      })
  }

  pub fn membership(&self) -> impl Iterator<Item = FetchRequest> + '_ {
    self
      .orgs
      .iter()
      .map(|org| FetchRequest::Members { org: org.clone() })
  }

  pub fn orgs(&self) -> &BTreeSet<String> {
    &self.orgs
  }

  pub fn len(&self) -> usize {
    self.listings.len() + self.orgs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::LoadOptions;

  fn plan(yaml: &str) -> FetchPlan {
    let ruleset = Ruleset::from_yaml(yaml, "test", &LoadOptions::default()).unwrap();
    FetchPlan::from_ruleset(&ruleset)
  }

  #[test]
  fn test_only_needed_kinds_are_listed() {
    let p = plan(
      r#"
settings:
  repos: [a/b, c/d]
rules:
  - id: prs
    kind: pull-request
    repos: [a/b]
  - id: issues
    kind: issue
collections:
  - id: all
    rule-ids: [prs, issues]
"#,
    );
    let requests: Vec<_> = p.listings().collect();
    assert_eq!(
      requests,
      vec![
        FetchRequest::Items {
          repo: "a/b".into(),
          kind: ItemKind::Issue,
          params: FetchParams { state: StateScope::All },
        },
        FetchRequest::Items {
          repo: "a/b".into(),
          kind: ItemKind::PullRequest,
          params: FetchParams { state: StateScope::All },
        },
        FetchRequest::Items {
          repo: "c/d".into(),
          kind: ItemKind::Issue,
          params: FetchParams { state: StateScope::All },
        },
      ]
    );
    assert!(p.orgs().is_empty());
  }

  #[test]
  fn test_open_scope_only_when_every_rule_agrees() {
    let p = plan(
      r#"
settings:
  repos: [a/b]
rules:
  - id: open-bugs
    kind: issue
    filters:
      - {tag: state, value: open}
      - {tag: author-member, value: Kubernetes, negate: true}
  - id: open-prs
    kind: pull-request
    filters:
      - {tag: state, value: open}
  - id: recently-closed
    kind: issue
    filters:
      - {tag: closed, value: "<7d"}
collections:
  - id: c
    rule-ids: [open-bugs, open-prs, recently-closed]
"#,
    );
    let scopes: Vec<_> = p
      .listings()
      .map(|r| match r {
        FetchRequest::Items { kind, params, .. } => (kind, params.state),
        FetchRequest::Members { .. } => unreachable!(),
      })
      .collect();
    assert_eq!(
      scopes,
      vec![
        (ItemKind::Issue, StateScope::All),
        (ItemKind::PullRequest, StateScope::Open),
      ]
    );
    assert_eq!(
      p.membership().collect::<Vec<_>>(),
      vec![FetchRequest::Members {
        org: "kubernetes".into()
      }]
    );
  }
}
