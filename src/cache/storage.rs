//! On-disk form of the response cache: one SQLite file holding the whole map.
//!
//! The file is never updated in place. Every save writes a complete copy to a
//! temporary file in the same directory and renames it over the old one.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use super::entry::{CacheEntry, Payload};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

const FORMAT_VERSION: &str = "1";

/// Schema for cache files.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS responses (
    fingerprint TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    fetched_at TEXT NOT NULL
);
"#;

fn corrupt(path: &Path, message: impl std::fmt::Display) -> Error {
  Error::CacheCorrupt {
    path: path.to_path_buf(),
    message: message.to_string(),
  }
}

fn io(path: &Path, message: impl std::fmt::Display) -> Error {
  Error::CacheIo {
    path: path.to_path_buf(),
    message: message.to_string(),
  }
}

/// Load a cache file. `Ok(None)` when the file does not exist.
pub fn read_snapshot(path: &Path) -> Result<Option<HashMap<Fingerprint, CacheEntry>>> {
  match std::fs::metadata(path) {
    Ok(meta) if meta.is_file() => {}
    Ok(_) => return Err(io(path, "not a regular file")),
    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(io(path, e)),
  }

  let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
    .map_err(|e| corrupt(path, e))?;

  let version: String = conn
    .query_row("SELECT value FROM meta WHERE key = 'format'", [], |row| {
      row.get(0)
    })
    .map_err(|e| corrupt(path, e))?;
  if version != FORMAT_VERSION {
    return Err(corrupt(path, format!("unsupported format version {version}")));
  }

  let mut stmt = conn
    .prepare("SELECT fingerprint, payload, fetched_at FROM responses")
    .map_err(|e| corrupt(path, e))?;

  let rows = stmt
    .query_map([], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, Vec<u8>>(1)?,
        row.get::<_, String>(2)?,
      ))
    })
    .map_err(|e| corrupt(path, e))?;

  let mut entries = HashMap::new();
  for row in rows {
    let (fingerprint, data, fetched_at) = row.map_err(|e| corrupt(path, e))?;
    let payload: Payload = serde_json::from_slice(&data)
      .map_err(|e| corrupt(path, format!("entry {fingerprint}: {e}")))?;
    let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)
      .map_err(|e| corrupt(path, format!("entry {fingerprint}: {e}")))?
      .with_timezone(&Utc);

    let fingerprint = Fingerprint::from(fingerprint);
    entries.insert(
      fingerprint.clone(),
      CacheEntry {
        fingerprint,
        payload: Arc::new(payload),
        fetched_at,
      },
    );
  }

  Ok(Some(entries))
}

/// Write a complete cache file, replacing `path` atomically.
pub fn write_snapshot(path: &Path, entries: &[CacheEntry]) -> Result<()> {
  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));

  // Ensure parent directory exists
  std::fs::create_dir_all(dir).map_err(|e| io(path, format!("create {}: {e}", dir.display())))?;

  // Temp file in the target directory so the rename stays on one filesystem
  let tmp = tempfile::Builder::new()
    .prefix(".triaged-cache-")
    .suffix(".tmp")
    .tempfile_in(dir)
    .map_err(|e| io(path, format!("create temp file: {e}")))?;

  {
    let mut conn = Connection::open(tmp.path()).map_err(|e| io(path, e))?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| io(path, e))?;

    let tx = conn.transaction().map_err(|e| io(path, e))?;
    tx.execute(
      "INSERT OR REPLACE INTO meta (key, value) VALUES ('format', ?)",
      params![FORMAT_VERSION],
    )
    .map_err(|e| io(path, e))?;
    {
      let mut insert = tx
        .prepare(
          "INSERT OR REPLACE INTO responses (fingerprint, payload, fetched_at) \
           VALUES (?, ?, ?)",
        )
        .map_err(|e| io(path, e))?;
      for entry in entries {
        let data = serde_json::to_vec(entry.payload.as_ref())
          .map_err(|e| io(path, format!("serialize {}: {e}", entry.fingerprint)))?;
        insert
          .execute(params![
            entry.fingerprint.as_str(),
            data,
            entry
              .fetched_at
              .to_rfc3339_opts(SecondsFormat::Nanos, true),
          ])
          .map_err(|e| io(path, e))?;
      }
    }
    tx.commit().map_err(|e| io(path, e))?;
    conn.close().map_err(|(_, e)| io(path, e))?;
  }

  tmp
    .persist(path)
    .map_err(|e| io(path, format!("rename into place: {}", e.error)))?;

  // Flush the directory entry where the platform allows it
  if let Ok(dir_file) = std::fs::File::open(dir) {
    let _ = dir_file.sync_all();
  }

  Ok(())
}
