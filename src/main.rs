use clap::Parser;
use color_eyre::Result;
use futures::future::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use triaged::cache::ResponseCache;
use triaged::config::{self, LoadOptions, Refresh, Ruleset};
use triaged::model::parse_duration;
use triaged::scheduler::{Scheduler, Snapshot};
use triaged::source::GithubSource;

#[derive(Parser, Debug)]
#[command(name = "triaged")]
#[command(about = "Continuously classify GitHub issues and pull requests into triage collections")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./triaged.yaml, then $XDG_CONFIG_HOME/triaged/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache file (default: derived from the config path under the user cache dir)
  #[arg(long)]
  cache_path: Option<PathBuf>,

  /// Site name, overriding `settings.name`
  #[arg(long)]
  name: Option<String>,

  /// Comma-separated owner/name list replacing every configured repository
  #[arg(long, value_delimiter = ',')]
  repos: Vec<String>,

  /// File holding the GitHub token (default: $GITHUB_TOKEN)
  #[arg(long)]
  github_token_file: Option<PathBuf>,

  /// GitHub API root, for GitHub Enterprise
  #[arg(long)]
  api_url: Option<String>,

  /// Refresh once, report collection sizes and exit
  #[arg(long)]
  dry_run: bool,

  /// Shortest time between refreshes, e.g. 90s
  #[arg(long, value_parser = parse_duration)]
  min_refresh: Option<Duration>,

  /// Longest time between refreshes, e.g. 30m
  #[arg(long, value_parser = parse_duration)]
  max_refresh: Option<Duration>,

  /// How long organization membership stays fresh, e.g. 24h
  #[arg(long, value_parser = parse_duration)]
  membership_refresh: Option<Duration>,

  /// Also write logs to a daily rotated file in this directory
  #[arg(long)]
  log_dir: Option<PathBuf>,
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "triaged.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
    .with(file_layer)
    .init();

  guard
}

fn log_snapshot(snapshot: &Snapshot) {
  for collection in snapshot.collections.values() {
    info!(
      collection = %collection.id,
      name = %collection.name,
      items = collection.len(),
      "collection"
    );
  }
  for failure in &snapshot.source_errors {
    warn!(
      request = %failure.target,
      served_stale = failure.served_stale,
      "{}",
      failure.message
    );
  }
}

/// Log every newly published snapshot until the scheduler goes away.
async fn report_updates(mut updates: watch::Receiver<Arc<Snapshot>>) {
  while updates.changed().await.is_ok() {
    let snapshot = updates.borrow_and_update().clone();
    log_snapshot(&snapshot);
  }
}

/// Resolves on SIGINT, or SIGTERM where supported.
async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
      Ok(mut term) => {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {}
          _ = term.recv() => {}
        }
        return;
      }
      Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
    }
  }

  if let Err(e) = tokio::signal::ctrl_c().await {
    error!(error = %e, "cannot listen for Ctrl-C");
    std::future::pending::<()>().await;
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_dir.as_deref());

  // Load configuration
  let config_path = config::locate(args.config.as_deref())?;
  let options = LoadOptions {
    repos_override: args.repos.clone(),
    name_override: args.name.clone(),
  };
  let ruleset = Arc::new(Ruleset::load(&config_path, &options)?);
  info!(
    config = %config_path.display(),
    site = %ruleset.site_name(),
    rules = ruleset.rules().len(),
    collections = ruleset.collections().len(),
    "loaded configuration"
  );

  let refresh = Refresh::resolve(
    ruleset.settings(),
    args.min_refresh,
    args.max_refresh,
    args.membership_refresh,
  )?;

  let token = config::read_token(args.github_token_file.as_deref())?;
  let source = match args.api_url.as_deref() {
    Some(url) => GithubSource::with_base_url(&token, url)?,
    None => GithubSource::new(&token)?,
  };

  let cache_path = match args.cache_path {
    Some(path) => path,
    None => ResponseCache::default_path(&config_path, &options.repos_override)?,
  };
  let cache = Arc::new(ResponseCache::open(&cache_path)?);
  // Fail now rather than after the first refresh if the cache is not writable
  cache.save()?;

  let persist_cache = Arc::clone(&cache);
  let scheduler = Arc::new(
    Scheduler::new(ruleset, Arc::new(source), Arc::clone(&cache), refresh)
      .with_persist(Arc::new(move || Arc::clone(&persist_cache).save_async().boxed())),
  );
  let cancel = CancellationToken::new();

  if args.dry_run {
    let result = scheduler.run_once(&cancel, true).await;
    log_snapshot(&scheduler.snapshot());
    result?;
    return Ok(());
  }

  tokio::spawn({
    let cancel = cancel.clone();
    let cache = Arc::clone(&cache);
    async move {
      shutdown_signal().await;
      info!("shutdown requested");
      cancel.cancel();
      if let Err(e) = cache.save_async().await {
        error!(error = %e, "failed to save cache on shutdown");
      }
    }
  });
  tokio::spawn(report_updates(scheduler.subscribe()));

  let result = scheduler.run_loop(&cancel).await;
  cache.save_async().await?;
  result?;

  Ok(())
}
