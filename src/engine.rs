//! Matching engine: evaluates rules against items and assembles collections.
//!
//! Evaluation is a pure function of the ruleset, the item set, the evaluation
//! time and membership data. Input order never affects the output.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::config::Ruleset;
use crate::model::{DisplayPolicy, Filter, Item, ItemId, Predicate, Rule};

/// Organization membership, keyed by lowercased org and login.
#[derive(Debug, Clone, Default)]
pub struct Membership {
  orgs: HashMap<String, HashSet<String>>,
}

impl Membership {
  pub fn insert<I, S>(&mut self, org: &str, logins: I)
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    self
      .orgs
      .entry(org.to_lowercase())
      .or_default()
      .extend(logins.into_iter().map(|l| l.as_ref().to_lowercase()));
  }

  /// Unknown organizations have no members.
  pub fn is_member(&self, org: &str, login: &str) -> bool {
    self
      .orgs
      .get(&org.to_lowercase())
      .is_some_and(|m| m.contains(&login.to_lowercase()))
  }

  pub fn has_org(&self, org: &str) -> bool {
    self.orgs.contains_key(&org.to_lowercase())
  }
}

/// Everything a filter may consult besides the item itself.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
  pub now: DateTime<Utc>,
  pub membership: &'a Membership,
}

fn predicate_holds(predicate: &Predicate, item: &Item, ctx: &EvalContext<'_>) -> bool {
  match predicate {
    Predicate::Label(label) => item.labels.iter().any(|l| l.eq_ignore_ascii_case(label)),
    Predicate::Title(re) => re.is_match(&item.title),
    Predicate::Body(re) => re.is_match(&item.body),
    Predicate::Comments(t) => t.matches(item.comments),
    Predicate::Reactions(t) => t.matches(item.reactions),
    Predicate::Created(age) => age.matches(ctx.now - item.created_at),
    Predicate::Updated(age) => age.matches(ctx.now - item.updated_at),
    Predicate::Closed(age) => item.closed_at.is_some_and(|c| age.matches(ctx.now - c)),
    Predicate::Assignee(sel) => sel.matches_any(item.assignees.iter()),
    Predicate::Reviewer(sel) => sel.matches_any(item.reviewers.iter()),
    Predicate::ReviewState(state) => item.review_state == *state,
    Predicate::Milestone(sel) => sel.matches_any(item.milestone.iter()),
    Predicate::Kind(kind) => item.kind == *kind,
    Predicate::State(state) => item.state == *state,
    Predicate::Author(login) => item.author.eq_ignore_ascii_case(login),
    Predicate::AuthorMember(org) => ctx.membership.is_member(org, &item.author),
  }
}

/// Evaluate one filter, applying its negation.
pub fn filter_matches(filter: &Filter, item: &Item, ctx: &EvalContext<'_>) -> bool {
  predicate_holds(&filter.predicate, item, ctx) != filter.negate
}

/// A rule matches when the item is in its scope and every filter holds.
pub fn evaluate(rule: &Rule, item: &Item, ctx: &EvalContext<'_>) -> bool {
  rule.covers(item) && rule.filters.iter().all(|f| filter_matches(f, item, ctx))
}

/// Items matched by one rule, ordered by number then repository.
pub fn rule_matches(rule: &Rule, items: &[Arc<Item>], ctx: &EvalContext<'_>) -> Vec<Arc<Item>> {
  let mut matched: Vec<Arc<Item>> = items
    .iter()
    .filter(|item| evaluate(rule, item, ctx))
    .cloned()
    .collect();
  matched.sort_by(|a, b| identity_order(a, b));
  matched
}

fn identity_order(a: &Item, b: &Item) -> Ordering {
  a.number
    .cmp(&b.number)
    .then_with(|| a.repo.cmp(&b.repo))
}

fn policy_order(policy: DisplayPolicy, a: &Item, b: &Item) -> Ordering {
  match policy {
    DisplayPolicy::UpdatedDesc => b.updated_at.cmp(&a.updated_at),
    DisplayPolicy::UpdatedAsc => a.updated_at.cmp(&b.updated_at),
    DisplayPolicy::CreatedDesc => b.created_at.cmp(&a.created_at),
    DisplayPolicy::CreatedAsc => a.created_at.cmp(&b.created_at),
    DisplayPolicy::CommentsDesc => b.comments.cmp(&a.comments),
    DisplayPolicy::ReactionsDesc => b.reactions.cmp(&a.reactions),
    DisplayPolicy::RuleOrder => Ordering::Equal,
  }
}

/// An item in a collection along with the first rule that matched it.
#[derive(Debug, Clone)]
pub struct Match {
  pub item: Arc<Item>,
  pub rule_id: String,
}

/// Evaluated collection as published in a snapshot.
#[derive(Debug, Clone)]
pub struct CollectionResult {
  pub id: String,
  pub name: String,
  pub description: Option<String>,
  pub display_policy: DisplayPolicy,
  pub matches: Vec<Match>,
}

impl CollectionResult {
  pub fn items(&self) -> impl Iterator<Item = &Arc<Item>> {
    self.matches.iter().map(|m| &m.item)
  }

  pub fn len(&self) -> usize {
    self.matches.len()
  }

  pub fn is_empty(&self) -> bool {
    self.matches.is_empty()
  }
}

/// Evaluate every collection of the ruleset over `items`.
///
/// Each rule is evaluated once; collections merge their rules' matches in rule
/// order, keep the first occurrence of each item, then sort by their display
/// policy with ties broken by ascending item number.
pub fn evaluate_all(
  ruleset: &Ruleset,
  items: &[Arc<Item>],
  ctx: &EvalContext<'_>,
) -> BTreeMap<String, CollectionResult> {
  let mut per_rule: HashMap<&str, Vec<Arc<Item>>> = HashMap::new();

  ruleset
    .collections()
    .iter()
    .map(|collection| {
      let mut seen: HashSet<ItemId> = HashSet::new();
      let mut matches = Vec::new();

      for rule_id in &collection.rule_ids {
        let Some(rule) = ruleset.rule(rule_id) else {
          continue;
        };
        let matched = per_rule
          .entry(rule.id.as_str())
          .or_insert_with(|| rule_matches(rule, items, ctx));
        for item in matched.iter() {
          if seen.insert(item.id()) {
            matches.push(Match {
              item: Arc::clone(item),
              rule_id: rule.id.clone(),
            });
          }
        }
      }

      // Stable: equal keys keep first-seen rule order before the number tie-break
      let policy = collection.display_policy;
      if policy != DisplayPolicy::RuleOrder {
        matches.sort_by(|a, b| {
          policy_order(policy, &a.item, &b.item).then_with(|| identity_order(&a.item, &b.item))
        });
      }

      let result = CollectionResult {
        id: collection.id.clone(),
        name: collection.name.clone(),
        description: collection.description.clone(),
        display_policy: policy,
        matches,
      };
      (collection.id.clone(), result)
    })
    .collect()
}
