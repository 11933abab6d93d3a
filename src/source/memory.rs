use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Source, SourceError};
use crate::fingerprint::{FetchParams, StateScope};
use crate::model::{Item, ItemKind, ItemState};

/// In-memory source with scriptable failures.
#[derive(Default)]
pub struct MemorySource {
  items: Mutex<HashMap<String, Vec<Item>>>,
  members: Mutex<HashMap<String, Vec<String>>>,
  /// Returned by every fetch while set.
  failure: Mutex<Option<SourceError>>,
  calls: AtomicUsize,
}

impl MemorySource {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add items to a repository. Issues and pull requests are told apart by `kind`.
  pub fn with_items(self, repo: &str, items: Vec<Item>) -> Self {
    self.set_items(repo, items);
    self
  }

  pub fn with_members(self, org: &str, logins: &[&str]) -> Self {
    lock(&self.members).insert(
      org.to_lowercase(),
      logins.iter().map(|l| l.to_string()).collect(),
    );
    self
  }

  /// Replace a repository's items.
  pub fn set_items(&self, repo: &str, items: Vec<Item>) {
    lock(&self.items).insert(repo.to_lowercase(), items);
  }

  /// Make every subsequent fetch fail with `error` (or succeed again with `None`).
  pub fn fail_with(&self, error: Option<SourceError>) {
    *lock(&self.failure) = error;
  }

  /// Number of fetches served (including failed ones).
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn listing(
    &self,
    repo: &str,
    kind: ItemKind,
    params: &FetchParams,
  ) -> Result<Vec<Item>, SourceError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(err) = lock(&self.failure).clone() {
      return Err(err);
    }
    let items = lock(&self.items);
    let repo_items = items
      .get(&repo.to_lowercase())
      .ok_or_else(|| SourceError::Inaccessible(format!("{repo} not found")))?;
    Ok(
      repo_items
        .iter()
        .filter(|i| i.kind == kind)
        .filter(|i| params.state == StateScope::All || i.state == ItemState::Open)
        .cloned()
        .collect(),
    )
  }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Source for MemorySource {
  fn endpoint(&self) -> &str {
    "memory"
  }

  fn fetch_issues<'a>(
    &'a self,
    repo: &'a str,
    params: &'a FetchParams,
  ) -> BoxFuture<'a, Result<Vec<Item>, SourceError>> {
    future::ready(self.listing(repo, ItemKind::Issue, params)).boxed()
  }

  fn fetch_pull_requests<'a>(
    &'a self,
    repo: &'a str,
    params: &'a FetchParams,
  ) -> BoxFuture<'a, Result<Vec<Item>, SourceError>> {
    future::ready(self.listing(repo, ItemKind::PullRequest, params)).boxed()
  }

  fn fetch_membership<'a>(
    &'a self,
    org: &'a str,
  ) -> BoxFuture<'a, Result<Vec<String>, SourceError>> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let result = match lock(&self.failure).clone() {
      Some(err) => Err(err),
      None => Ok(
        lock(&self.members)
          .get(&org.to_lowercase())
          .cloned()
          .unwrap_or_default(),
      ),
    };
    future::ready(result).boxed()
  }
}
