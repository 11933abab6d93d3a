//! GitHub REST API adapter.

mod api_types;

use chrono::{TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use super::{Source, SourceError};
use crate::error::{Error, Result};
use crate::fingerprint::FetchParams;
use crate::model::{Item, ItemState};
use api_types::{review_summary, ApiIssue, ApiPull, ApiReview, ApiUser};

pub const DEFAULT_API_URL: &str = "https://api.github.com/";

const PER_PAGE: usize = 100;

/// Concurrent review lookups per repository.
const REVIEW_CONCURRENCY: usize = 8;

/// GitHub API client
#[derive(Clone)]
pub struct GithubSource {
  client: reqwest::Client,
  base: Url,
}

impl GithubSource {
  pub fn new(token: &str) -> Result<Self> {
    Self::with_base_url(token, DEFAULT_API_URL)
  }

  /// Point at a GitHub Enterprise API root such as `https://ghe.example.com/api/v3/`.
  pub fn with_base_url(token: &str, base_url: &str) -> Result<Self> {
    let mut base_url = base_url.to_string();
    if !base_url.ends_with('/') {
      base_url.push('/');
    }
    let base = Url::parse(&base_url)
      .map_err(|e| Error::config("api url", format!("invalid {base_url:?}: {e}")))?;

    let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
      .map_err(|_| Error::Auth("token contains invalid characters".to_string()))?;
    auth.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, auth);
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    headers.insert(
      USER_AGENT,
      HeaderValue::from_static(concat!("triaged/", env!("CARGO_PKG_VERSION"))),
    );
    headers.insert(
      "x-github-api-version",
      HeaderValue::from_static("2022-11-28"),
    );

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(Duration::from_secs(60))
      .build()
      .map_err(|e| Error::config("http client", e.to_string()))?;

    Ok(Self { client, base })
  }

  /// Fetch every page of a listing endpoint.
  async fn get_all<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, &str)],
  ) -> std::result::Result<Vec<T>, SourceError> {
    let url = self
      .base
      .join(path)
      .map_err(|e| SourceError::Decode(format!("bad path {path:?}: {e}")))?;

    let per_page = PER_PAGE.to_string();
    let mut all = Vec::new();
    let mut page = 1usize;

    loop {
      let page_str = page.to_string();
      let response = self
        .client
        .get(url.clone())
        .query(query)
        .query(&[("per_page", per_page.as_str()), ("page", page_str.as_str())])
        .send()
        .await
        .map_err(|e| transport_error(&e))?;

      let status = response.status();
      if !status.is_success() {
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        return Err(classify(status, &headers, path, &body));
      }

      let batch: Vec<T> = response
        .json()
        .await
        .map_err(|e| SourceError::Decode(format!("{path}: {e}")))?;
      trace!(path, page, count = batch.len(), "fetched page");

      let count = batch.len();
      all.extend(batch);

      // Check if we've fetched all pages
      if count < PER_PAGE {
        break;
      }
      page += 1;
    }

    Ok(all)
  }

  /// Issues listing; GitHub includes pull requests here, marked by `pull_request`.
  async fn list_issues(
    &self,
    repo: &str,
    params: &FetchParams,
  ) -> std::result::Result<Vec<ApiIssue>, SourceError> {
    self
      .get_all(
        &format!("repos/{repo}/issues"),
        &[("state", params.state.as_str()), ("sort", "updated")],
      )
      .await
  }

  async fn issues(
    &self,
    repo: &str,
    params: &FetchParams,
  ) -> std::result::Result<Vec<Item>, SourceError> {
    let issues = self.list_issues(repo, params).await?;
    let items: Vec<Item> = issues
      .into_iter()
      .filter(|i| !i.is_pull_request())
      .map(|i| i.into_item(repo))
      .collect();
    debug!(repo, count = items.len(), "fetched issues");
    Ok(items)
  }

  /// Pull requests, joined from the issues listing (counts, labels), the pulls
  /// listing (requested reviewers) and per-PR reviews for open PRs.
  async fn pull_requests(
    &self,
    repo: &str,
    params: &FetchParams,
  ) -> std::result::Result<Vec<Item>, SourceError> {
    let issues = self.list_issues(repo, params).await?;
    let pulls: Vec<ApiPull> = self
      .get_all(
        &format!("repos/{repo}/pulls"),
        &[("state", params.state.as_str())],
      )
      .await?;
    let mut requested: HashMap<u64, Vec<ApiUser>> = pulls
      .into_iter()
      .map(|p| (p.number, p.requested_reviewers))
      .collect();

    let mut items: Vec<Item> = issues
      .into_iter()
      .filter(ApiIssue::is_pull_request)
      .map(|i| i.into_item(repo))
      .collect();

    let open: Vec<u64> = items
      .iter()
      .filter(|i| i.state == ItemState::Open)
      .map(|i| i.number)
      .collect();

    let reviews: HashMap<u64, Vec<ApiReview>> =
      futures::stream::iter(open.into_iter().map(|number| self.reviews(repo, number)))
        .buffer_unordered(REVIEW_CONCURRENCY)
        .try_collect()
        .await?;

    for item in &mut items {
      let requested = requested.remove(&item.number).unwrap_or_default();
      let item_reviews = reviews.get(&item.number).map(Vec::as_slice).unwrap_or(&[]);
      let (state, reviewers) = review_summary(&requested, item_reviews);
      item.review_state = state;
      item.reviewers = reviewers;
    }

    debug!(repo, count = items.len(), "fetched pull requests");
    Ok(items)
  }

  async fn reviews(
    &self,
    repo: &str,
    number: u64,
  ) -> std::result::Result<(u64, Vec<ApiReview>), SourceError> {
    let reviews = self
      .get_all(&format!("repos/{repo}/pulls/{number}/reviews"), &[])
      .await?;
    Ok((number, reviews))
  }

  async fn members(&self, org: &str) -> std::result::Result<Vec<String>, SourceError> {
    let users: Vec<ApiUser> = self.get_all(&format!("orgs/{org}/members"), &[]).await?;
    debug!(org, count = users.len(), "fetched members");
    Ok(users.into_iter().map(|u| u.login).collect())
  }
}

fn transport_error(e: &reqwest::Error) -> SourceError {
  if e.is_decode() {
    SourceError::Decode(e.to_string())
  } else {
    SourceError::Network(e.to_string())
  }
}

/// Map an unsuccessful response onto the transient/fatal taxonomy.
fn classify(status: StatusCode, headers: &HeaderMap, path: &str, body: &str) -> SourceError {
  let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

  let exhausted = header("x-ratelimit-remaining") == Some("0");
  let secondary = body.contains("secondary rate limit");
  if status == StatusCode::TOO_MANY_REQUESTS
    || (status == StatusCode::FORBIDDEN && (exhausted || secondary))
  {
    let reset_at = header("x-ratelimit-reset")
      .and_then(|v| v.parse::<i64>().ok())
      .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    return SourceError::RateLimited { reset_at };
  }

  match status {
    StatusCode::UNAUTHORIZED => SourceError::Unauthorized(format!("{path}: {}", status)),
    StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => {
      SourceError::Inaccessible(format!("{path}: {}", status))
    }
    s if s.is_server_error() => SourceError::Server(format!("{path}: {s}")),
    s => SourceError::Decode(format!("{path}: unexpected status {s}")),
  }
}

impl Source for GithubSource {
  fn endpoint(&self) -> &str {
    self.base.as_str()
  }

  fn fetch_issues<'a>(
    &'a self,
    repo: &'a str,
    params: &'a FetchParams,
  ) -> BoxFuture<'a, std::result::Result<Vec<Item>, SourceError>> {
    self.issues(repo, params).boxed()
  }

  fn fetch_pull_requests<'a>(
    &'a self,
    repo: &'a str,
    params: &'a FetchParams,
  ) -> BoxFuture<'a, std::result::Result<Vec<Item>, SourceError>> {
    self.pull_requests(repo, params).boxed()
  }

  fn fetch_membership<'a>(
    &'a self,
    org: &'a str,
  ) -> BoxFuture<'a, std::result::Result<Vec<String>, SourceError>> {
    self.members(org).boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut h = HeaderMap::new();
    for (k, v) in pairs {
      h.insert(*k, HeaderValue::from_static(v));
    }
    h
  }

  #[test]
  fn test_classify_rate_limit() {
    let h = headers(&[
      ("x-ratelimit-remaining", "0"),
      ("x-ratelimit-reset", "1700000000"),
    ]);
    let err = classify(StatusCode::FORBIDDEN, &h, "repos/a/b/issues", "");
    match err {
      SourceError::RateLimited { reset_at } => {
        assert_eq!(reset_at.unwrap().timestamp(), 1_700_000_000);
      }
      other => panic!("expected rate limit, got {other:?}"),
    }
    assert!(classify(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), "x", "").is_transient());
  }

  #[test]
  fn test_classify_fatal_and_transient() {
    let none = HeaderMap::new();
    assert!(!classify(StatusCode::UNAUTHORIZED, &none, "x", "").is_transient());
    assert!(!classify(StatusCode::NOT_FOUND, &none, "x", "").is_transient());
    assert!(!classify(StatusCode::FORBIDDEN, &none, "x", "").is_transient());
    assert!(classify(StatusCode::BAD_GATEWAY, &none, "x", "").is_transient());
    assert!(classify(
      StatusCode::FORBIDDEN,
      &none,
      "x",
      "You have exceeded a secondary rate limit"
    )
    .is_transient());
  }

  #[test]
  fn test_endpoint_is_normalized() {
    let s = GithubSource::with_base_url("t0ken", "https://ghe.example.com/api/v3").unwrap();
    assert_eq!(s.endpoint(), "https://ghe.example.com/api/v3/");
  }
}
