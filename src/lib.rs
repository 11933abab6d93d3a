//! Mirror of GitHub issue and pull request activity, classified by
//! declarative rules into named collections.
//!
//! The [`scheduler::Scheduler`] fetches through the [`cache::ResponseCache`],
//! evaluates the [`config::Ruleset`] with the [`engine`] and publishes an
//! immutable [`scheduler::Snapshot`] for readers.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod scheduler;
pub mod source;

pub use error::{Error, Result};
