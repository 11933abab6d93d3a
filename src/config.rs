//! Configuration loading and validation.
//!
//! A configuration document has three sections: `settings`, `collections` and
//! `rules`. Everything is validated here, so a loaded [`Ruleset`] never
//! fails during a refresh.

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{parse_duration, Collection, DisplayPolicy, Filter, ItemKind, Rule};

const DEFAULT_MIN_REFRESH: Duration = Duration::from_secs(60);
const DEFAULT_MAX_REFRESH: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MEMBERSHIP_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
  #[serde(default)]
  settings: RawSettings,
  #[serde(default)]
  collections: Vec<RawCollection>,
  #[serde(default)]
  rules: Vec<RawRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSettings {
  name: Option<String>,
  #[serde(default)]
  repos: Vec<String>,
  min_refresh: Option<String>,
  max_refresh: Option<String>,
  membership_refresh: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawCollection {
  id: String,
  name: Option<String>,
  description: Option<String>,
  #[serde(default, alias = "rules")]
  rule_ids: Vec<String>,
  display_policy: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawRule {
  id: String,
  name: Option<String>,
  #[serde(default)]
  repos: Vec<String>,
  kind: Option<String>,
  #[serde(default)]
  filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
  tag: String,
  #[serde(default)]
  value: serde_yaml::Value,
  #[serde(default)]
  negate: bool,
}

/// Render a scalar YAML operand as text; `value: 5` and `value: "5"` are equivalent.
fn scalar_text(value: &serde_yaml::Value) -> std::result::Result<String, String> {
  match value {
    serde_yaml::Value::Null => Ok(String::new()),
    serde_yaml::Value::Bool(b) => Ok(b.to_string()),
    serde_yaml::Value::Number(n) => Ok(n.to_string()),
    serde_yaml::Value::String(s) => Ok(s.clone()),
    other => Err(format!("filter value must be a scalar, got {other:?}")),
  }
}

/// Top-level `settings` section.
#[derive(Debug, Clone, Default)]
pub struct Settings {
  pub name: Option<String>,
  pub repos: Vec<String>,
  pub min_refresh: Option<Duration>,
  pub max_refresh: Option<Duration>,
  pub membership_refresh: Option<Duration>,
}

/// Process-level inputs that reshape the configuration before validation.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
  /// Replaces every rule's repositories when non-empty.
  pub repos_override: Vec<String>,
  /// Replaces `settings.name`.
  pub name_override: Option<String>,
}

/// Normalize `https://github.com/owner/name` or `owner/name` to `owner/name`.
fn normalize_repo(raw: &str) -> std::result::Result<String, String> {
  let trimmed = raw.trim().trim_end_matches('/');
  let path = trimmed
    .strip_prefix("https://github.com/")
    .or_else(|| trimmed.strip_prefix("http://github.com/"))
    .or_else(|| trimmed.strip_prefix("github.com/"))
    .unwrap_or(trimmed);
  let path = path.strip_suffix(".git").unwrap_or(path);

  let mut parts = path.split('/');
  match (parts.next(), parts.next(), parts.next()) {
    (Some(owner), Some(name), None)
      if !owner.is_empty()
        && !name.is_empty()
        && !path.contains(char::is_whitespace) =>
    {
      Ok(path.to_string())
    }
    _ => Err(format!("repository {raw:?} is not of the form owner/name")),
  }
}

/// Validated rules and collections, immutable after load.
#[derive(Debug, Clone)]
pub struct Ruleset {
  settings: Settings,
  rules: Vec<Rule>,
  collections: Vec<Collection>,
  rule_index: HashMap<String, usize>,
}

impl Ruleset {
  /// Validate and assemble a ruleset.
  ///
  /// Rules without repositories inherit `settings.repos`; a non-empty
  /// `options.repos_override` replaces both.
  pub fn new(
    mut settings: Settings,
    mut rules: Vec<Rule>,
    collections: Vec<Collection>,
    options: &LoadOptions,
  ) -> Result<Self> {
    settings.repos = settings
      .repos
      .iter()
      .map(|r| normalize_repo(r).map_err(|e| Error::config("settings.repos", e)))
      .collect::<Result<_>>()?;

    let overrides: Vec<String> = options
      .repos_override
      .iter()
      .filter(|r| !r.trim().is_empty())
      .map(|r| normalize_repo(r).map_err(|e| Error::config("--repos", e)))
      .collect::<Result<_>>()?;
    if !overrides.is_empty() {
      settings.repos = overrides.clone();
    }
    if let Some(name) = options.name_override.as_deref().filter(|n| !n.trim().is_empty()) {
      settings.name = Some(name.to_string());
    }

    let declared: HashSet<String> = settings.repos.iter().map(|r| r.to_lowercase()).collect();

    let mut rule_index = HashMap::new();
    for (position, rule) in rules.iter_mut().enumerate() {
      if rule.id.trim().is_empty() {
        return Err(Error::rule("<unnamed>", "rule id must not be empty"));
      }
      if rule_index.insert(rule.id.clone(), position).is_some() {
        return Err(Error::rule(&rule.id, "duplicate rule id"));
      }

      if !overrides.is_empty() {
        rule.repos = overrides.clone();
      } else if rule.repos.is_empty() {
        rule.repos = settings.repos.clone();
      }
      if rule.repos.is_empty() {
        return Err(Error::rule(
          &rule.id,
          "no repositories: set rule repos or settings.repos",
        ));
      }

      let mut repos = Vec::with_capacity(rule.repos.len());
      for repo in &rule.repos {
        let repo = normalize_repo(repo).map_err(|e| Error::rule(&rule.id, e))?;
        if !declared.is_empty() && !declared.contains(&repo.to_lowercase()) {
          return Err(Error::rule(
            &rule.id,
            format!("repository {repo} is not listed in settings.repos"),
          ));
        }
        if !repos.contains(&repo) {
          repos.push(repo);
        }
      }
      rule.repos = repos;
    }

    let mut seen_collections = HashSet::new();
    let mut referenced = HashSet::new();
    for collection in &collections {
      if !seen_collections.insert(collection.id.clone()) {
        return Err(Error::config(
          "collections",
          format!("duplicate collection id {:?}", collection.id),
        ));
      }
      if collection.rule_ids.is_empty() {
        return Err(Error::config(
          "collections",
          format!("collection {:?} lists no rules", collection.id),
        ));
      }
      for id in &collection.rule_ids {
        if !rule_index.contains_key(id) {
          return Err(Error::rule(
            id,
            format!("referenced by collection {:?} but never defined", collection.id),
          ));
        }
        referenced.insert(id.as_str());
      }
    }

    for rule in &rules {
      if !referenced.contains(rule.id.as_str()) {
        warn!(rule = %rule.id, "rule is not part of any collection");
      }
    }

    Ok(Self {
      settings,
      rules,
      collections,
      rule_index,
    })
  }

  /// Parse and validate a YAML document. `origin` names it in error messages.
  pub fn from_yaml(contents: &str, origin: &str, options: &LoadOptions) -> Result<Self> {
    let raw: RawConfig =
      serde_yaml::from_str(contents).map_err(|e| Error::config(origin, e.to_string()))?;

    let duration = |field: &str, value: &Option<String>| -> Result<Option<Duration>> {
      value
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| Error::config(origin, format!("settings.{field}: {e}")))
    };

    let settings = Settings {
      name: raw.settings.name.clone(),
      repos: raw.settings.repos.clone(),
      min_refresh: duration("min-refresh", &raw.settings.min_refresh)?,
      max_refresh: duration("max-refresh", &raw.settings.max_refresh)?,
      membership_refresh: duration("membership-refresh", &raw.settings.membership_refresh)?,
    };

    let rules = raw
      .rules
      .into_iter()
      .map(|r| {
        let kind = r
          .kind
          .as_deref()
          .filter(|k| !matches!(k.trim(), "" | "any" | "all"))
          .map(str::parse::<ItemKind>)
          .transpose()
          .map_err(|e| Error::rule(&r.id, e))?;

        let filters = r
          .filters
          .iter()
          .map(|f| {
            let value = scalar_text(&f.value).map_err(|e| Error::rule(&r.id, e))?;
            Filter::parse(&f.tag, &value, f.negate).map_err(|e| Error::rule(&r.id, e))
          })
          .collect::<Result<Vec<_>>>()?;

        Ok(Rule {
          name: r.name.unwrap_or_else(|| r.id.clone()),
          id: r.id,
          repos: r.repos,
          kind,
          filters,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    let collections = raw
      .collections
      .into_iter()
      .map(|c| {
        let display_policy = c
          .display_policy
          .as_deref()
          .map(str::parse::<DisplayPolicy>)
          .transpose()
          .map_err(|e| Error::config(origin, format!("collection {:?}: {e}", c.id)))?
          .unwrap_or_default();
        Ok(Collection {
          name: c.name.unwrap_or_else(|| c.id.clone()),
          id: c.id,
          description: c.description,
          rule_ids: c.rule_ids,
          display_policy,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Self::new(settings, rules, collections, options)
  }

  /// Load a configuration file.
  pub fn load(path: &Path, options: &LoadOptions) -> Result<Self> {
    let origin = path.display().to_string();
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::config(&origin, format!("failed to read: {e}")))?;
    Self::from_yaml(&contents, &origin, options)
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  /// Rules in declaration order.
  pub fn rules(&self) -> &[Rule] {
    &self.rules
  }

  pub fn rule(&self, id: &str) -> Option<&Rule> {
    self.rule_index.get(id).map(|&i| &self.rules[i])
  }

  pub fn collections(&self) -> &[Collection] {
    &self.collections
  }

  /// Every repository referenced by any rule.
  pub fn repos(&self) -> BTreeSet<String> {
    self
      .rules
      .iter()
      .flat_map(|r| r.repos.iter().cloned())
      .collect()
  }

  /// `settings.name`, or the distinct repository short names joined with " + ".
  pub fn site_name(&self) -> String {
    if let Some(name) = self.settings.name.as_deref().filter(|n| !n.is_empty()) {
      return name.to_string();
    }
    let names: BTreeSet<&str> = self
      .rules
      .iter()
      .flat_map(|r| r.repos.iter())
      .filter_map(|r| r.rsplit('/').next())
      .collect();
    names.into_iter().collect::<Vec<_>>().join(" + ")
  }
}

/// Find the configuration file.
///
/// Search order:
/// 1. Explicit path if provided
/// 2. ./triaged.yaml (current directory)
/// 3. $XDG_CONFIG_HOME/triaged/config.yaml
pub fn locate(explicit_path: Option<&Path>) -> Result<PathBuf> {
  if let Some(p) = explicit_path {
    if p.exists() {
      return Ok(p.to_path_buf());
    }
    return Err(Error::config(
      p.display().to_string(),
      "config file not found",
    ));
  }

  let local = PathBuf::from("triaged.yaml");
  if local.exists() {
    return Ok(local);
  }

  if let Some(config_dir) = dirs::config_dir() {
    let xdg_path = config_dir.join("triaged").join("config.yaml");
    if xdg_path.exists() {
      return Ok(xdg_path);
    }
  }

  Err(Error::config(
    "<none>",
    "no configuration file found; pass --config or create ./triaged.yaml",
  ))
}

/// Refresh cadence after combining flags, settings and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refresh {
  pub min: Duration,
  pub max: Duration,
  pub membership: Duration,
}

impl Refresh {
  /// Flags win over `settings`, which win over built-in defaults.
  pub fn resolve(
    settings: &Settings,
    min: Option<Duration>,
    max: Option<Duration>,
    membership: Option<Duration>,
  ) -> Result<Self> {
    let refresh = Self {
      min: min.or(settings.min_refresh).unwrap_or(DEFAULT_MIN_REFRESH),
      max: max.or(settings.max_refresh).unwrap_or(DEFAULT_MAX_REFRESH),
      membership: membership
        .or(settings.membership_refresh)
        .unwrap_or(DEFAULT_MEMBERSHIP_REFRESH),
    };
    if refresh.min.is_zero() {
      return Err(Error::config("min-refresh", "must be greater than zero"));
    }
    if refresh.min > refresh.max {
      return Err(Error::config(
        "min-refresh",
        format!(
          "{:?} is longer than max-refresh {:?}",
          refresh.min, refresh.max
        ),
      ));
    }
    Ok(refresh)
  }
}

impl Default for Refresh {
  fn default() -> Self {
    Self {
      min: DEFAULT_MIN_REFRESH,
      max: DEFAULT_MAX_REFRESH,
      membership: DEFAULT_MEMBERSHIP_REFRESH,
    }
  }
}

/// Read the GitHub token from `token_file`, falling back to `GITHUB_TOKEN`.
pub fn read_token(token_file: Option<&Path>) -> Result<String> {
  let token = match token_file {
    Some(path) => std::fs::read_to_string(path)
      .map_err(|e| Error::Auth(format!("failed to read {}: {e}", path.display())))?,
    None => std::env::var("GITHUB_TOKEN").map_err(|_| {
      Error::Auth("no token: pass --github-token-file or set GITHUB_TOKEN".to_string())
    })?,
  };

  let token = token.trim();
  if token.is_empty() {
    return Err(Error::Auth("token is empty".to_string()));
  }
  Ok(token.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
settings:
  name: Kubernetes triage
  repos:
    - kubernetes/minikube
    - https://github.com/kubernetes/kubectl
  min-refresh: 30s
  max-refresh: 20m
unknown-section:
  ignored: true
collections:
  - id: daily
    name: Daily triage
    rule-ids: [untriaged, stale-prs]
    display-policy: created-asc
rules:
  - id: untriaged
    name: Untriaged issues
    kind: issue
    filters:
      - tag: label
        value: triage/accepted
        negate: true
      - tag: comments
        value: 0
  - id: stale-prs
    repos: [kubernetes/minikube]
    kind: pull-request
    filters:
      - tag: updated
        value: ">14d"
"#;

  fn load(yaml: &str) -> Result<Ruleset> {
    Ruleset::from_yaml(yaml, "test.yaml", &LoadOptions::default())
  }

  #[test]
  fn test_load_sample() {
    let rs = load(SAMPLE).unwrap();
    assert_eq!(rs.rules().len(), 2);
    assert_eq!(rs.collections().len(), 1);
    assert_eq!(
      rs.collections()[0].display_policy,
      DisplayPolicy::CreatedAsc
    );

    let untriaged = rs.rule("untriaged").unwrap();
    assert_eq!(
      untriaged.repos,
      vec!["kubernetes/minikube", "kubernetes/kubectl"]
    );
    assert_eq!(untriaged.kind, Some(ItemKind::Issue));
    assert_eq!(untriaged.filters.len(), 2);
    assert!(untriaged.filters[0].negate);
    assert_eq!(untriaged.filters[1].value, "0");

    assert_eq!(rs.rule("stale-prs").unwrap().repos, vec!["kubernetes/minikube"]);
    assert_eq!(rs.settings().min_refresh, Some(Duration::from_secs(30)));
    assert_eq!(rs.site_name(), "Kubernetes triage");
  }

  #[test]
  fn test_unknown_filter_tag_is_rule_error() {
    let yaml = r#"
settings: { repos: [a/b] }
collections: [{ id: c, rule-ids: [r] }]
rules:
  - id: r
    filters: [{ tag: priority, value: high }]
"#;
    match load(yaml) {
      Err(Error::RuleValidation { rule, message }) => {
        assert_eq!(rule, "r");
        assert!(message.contains("priority"));
      }
      other => panic!("expected rule validation error, got {other:?}"),
    }
  }

  #[test]
  fn test_undeclared_repo_is_rule_error() {
    let yaml = r#"
settings: { repos: [a/b] }
collections: [{ id: c, rule-ids: [r] }]
rules:
  - id: r
    repos: [other/repo]
"#;
    assert!(matches!(load(yaml), Err(Error::RuleValidation { .. })));
  }

  #[test]
  fn test_rule_without_repos_is_rule_error() {
    let yaml = r#"
collections: [{ id: c, rule-ids: [r] }]
rules: [{ id: r }]
"#;
    assert!(matches!(load(yaml), Err(Error::RuleValidation { .. })));
  }

  #[test]
  fn test_collection_with_unknown_rule_is_rule_error() {
    let yaml = r#"
settings: { repos: [a/b] }
collections: [{ id: c, rule-ids: [missing] }]
rules: [{ id: r }]
"#;
    match load(yaml) {
      Err(Error::RuleValidation { rule, .. }) => assert_eq!(rule, "missing"),
      other => panic!("expected rule validation error, got {other:?}"),
    }
  }

  #[test]
  fn test_duplicate_rule_id_is_rejected() {
    let yaml = r#"
settings: { repos: [a/b] }
rules: [{ id: r }, { id: r }]
"#;
    assert!(matches!(load(yaml), Err(Error::RuleValidation { .. })));
  }

  #[test]
  fn test_malformed_yaml_is_config_error() {
    assert!(matches!(
      load("rules: [ { id: "),
      Err(Error::Config { .. })
    ));
    assert!(matches!(
      load("settings: { repos: [a/b], min-refresh: forever }"),
      Err(Error::Config { .. })
    ));
  }

  #[test]
  fn test_repos_override_replaces_everything() {
    let options = LoadOptions {
      repos_override: vec!["me/fork".to_string()],
      ..LoadOptions::default()
    };
    let rs = Ruleset::from_yaml(SAMPLE, "test.yaml", &options).unwrap();
    for rule in rs.rules() {
      assert_eq!(rule.repos, vec!["me/fork"]);
    }
    assert_eq!(rs.repos().into_iter().collect::<Vec<_>>(), vec!["me/fork"]);
  }

  #[test]
  fn test_name_override_wins_over_settings() {
    let options = LoadOptions {
      name_override: Some("Minikube weekly".to_string()),
      ..LoadOptions::default()
    };
    let rs = Ruleset::from_yaml(SAMPLE, "test.yaml", &options).unwrap();
    assert_eq!(rs.site_name(), "Minikube weekly");
    assert_eq!(rs.settings().name.as_deref(), Some("Minikube weekly"));
  }

  #[test]
  fn test_site_name_from_repos() {
    let yaml = r#"
settings: { repos: [kubernetes/minikube, google/triage-party] }
collections: [{ id: c, rule-ids: [r] }]
rules: [{ id: r }]
"#;
    assert_eq!(load(yaml).unwrap().site_name(), "minikube + triage-party");
  }

  #[test]
  fn test_refresh_precedence() {
    let settings = Settings {
      min_refresh: Some(Duration::from_secs(30)),
      max_refresh: Some(Duration::from_secs(600)),
      ..Settings::default()
    };
    let r = Refresh::resolve(&settings, Some(Duration::from_secs(10)), None, None).unwrap();
    assert_eq!(r.min, Duration::from_secs(10));
    assert_eq!(r.max, Duration::from_secs(600));
    assert_eq!(r.membership, DEFAULT_MEMBERSHIP_REFRESH);

    let inverted = Refresh::resolve(
      &settings,
      Some(Duration::from_secs(900)),
      None,
      None,
    );
    assert!(matches!(inverted, Err(Error::Config { .. })));
  }

  #[test]
  fn test_read_token_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("token");
    std::fs::write(&path, "  secret\n").unwrap();
    assert_eq!(read_token(Some(&path)).unwrap(), "secret");

    std::fs::write(&path, "\n").unwrap();
    assert!(matches!(read_token(Some(&path)), Err(Error::Auth(_))));
  }
}
