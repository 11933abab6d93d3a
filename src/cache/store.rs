use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use super::entry::{CacheEntry, Payload};
use super::storage;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Persistent map from request fingerprint to the last response fetched for it.
///
/// Readers and the single refresh writer share the map behind a read/write
/// lock. [`ResponseCache::save`] copies the map under the read lock and does
/// the disk I/O without holding it.
pub struct ResponseCache {
  path: PathBuf,
  entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
  /// Serializes saves so the newest copy is always renamed last.
  save_lock: Mutex<()>,
}

impl ResponseCache {
  /// An empty cache that persists to `path`. Call [`initialize`](Self::initialize) to load it.
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      entries: RwLock::new(HashMap::new()),
      save_lock: Mutex::new(()),
    }
  }

  /// Create and initialize in one step.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
    let cache = Self::new(path);
    cache.initialize()?;
    Ok(cache)
  }

  /// Default cache location for a configuration file and repository override.
  ///
  /// Distinct configurations, or the same configuration with a different
  /// override, get distinct files.
  pub fn default_path(config_path: &Path, repos_override: &[String]) -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| Error::CacheIo {
        path: config_path.to_path_buf(),
        message: "could not determine cache directory".to_string(),
      })?;
    Ok(Self::path_in(
      &cache_dir.join("triaged"),
      config_path,
      repos_override,
    ))
  }

  fn path_in(dir: &Path, config_path: &Path, repos_override: &[String]) -> PathBuf {
    let absolute = std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());

    let mut hasher = Sha256::new();
    hasher.update(absolute.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(repos_override.join(",").as_bytes());
    let digest = hex::encode(hasher.finalize());

    let stem = config_path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .filter(|s| !s.is_empty())
      .unwrap_or_else(|| "config".to_string());

    dir.join(format!("{stem}-{}.db", &digest[..12]))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Load the persisted map, replacing whatever is in memory.
  ///
  /// A missing file yields an empty cache; an unreadable one is an error.
  pub fn initialize(&self) -> Result<()> {
    let loaded = storage::read_snapshot(&self.path)?;
    let count = loaded.as_ref().map_or(0, HashMap::len);
    *self.entries.write().unwrap_or_else(PoisonError::into_inner) = loaded.unwrap_or_default();
    info!(path = %self.path.display(), entries = count, "loaded response cache");
    Ok(())
  }

  pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
    self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(fingerprint)
      .cloned()
  }

  /// Store a payload, overwriting any previous entry for the fingerprint.
  pub fn set(
    &self,
    fingerprint: Fingerprint,
    payload: impl Into<Arc<Payload>>,
    fetched_at: DateTime<Utc>,
  ) -> CacheEntry {
    let entry = CacheEntry {
      fingerprint: fingerprint.clone(),
      payload: payload.into(),
      fetched_at,
    };
    self
      .entries
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(fingerprint, entry.clone());
    entry
  }

  /// Persist a point-in-time copy of the map. Safe to call concurrently.
  pub fn save(&self) -> Result<()> {
    let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);

    let mut entries: Vec<CacheEntry> = self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect();
    entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

    storage::write_snapshot(&self.path, &entries)?;
    debug!(path = %self.path.display(), entries = entries.len(), "saved response cache");
    Ok(())
  }

  /// [`save`](Self::save) on the blocking thread pool, for async callers.
  pub async fn save_async(self: Arc<Self>) -> Result<()> {
    let path = self.path.clone();
    tokio::task::spawn_blocking(move || self.save())
      .await
      .map_err(|e| Error::CacheIo {
        path,
        message: format!("save task failed: {e}"),
      })?
  }

    pub fn len(&self) -> usize {
    self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Fingerprints currently held, sorted.
  pub fn fingerprints(&self) -> Vec<Fingerprint> {
    let mut keys: Vec<Fingerprint> = self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect();
    keys.sort();
    keys
  }
}
