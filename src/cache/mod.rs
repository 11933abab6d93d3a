//! Persistent response cache for remote fetches.
//!
//! - Keys are request [`Fingerprint`](crate::fingerprint::Fingerprint)s
//! - Entries never expire inside the cache; callers decide staleness
//! - The whole map is persisted by writing a fresh file and renaming it into place
//! - Transient fetch failures fall back to the last cached response

mod entry;
mod layer;
mod storage;
mod store;

pub use entry::{CacheEntry, CacheResult, CacheSource, Payload};
pub use layer::CacheLayer;
pub use store::ResponseCache;
