//! Local persistence for notification settings.
//!
//! Everything the notifier remembers between runs is a string value under a
//! string key, stored in a single SQLite table. The controller only sees the
//! [`SettingsStore`] trait, so tests can swap in stores that fail on demand.

mod preferences;
mod schema;
mod types;

use std::future::Future;

pub use schema::Database;
pub use types::DatabaseError;

/// Best-effort string key-value store.
///
/// Callers decide how to react to failures; the notification controller logs
/// them and carries on with defaults.
pub trait SettingsStore: Send + Sync + 'static {
    /// Read the value stored under `key`, `None` if absent.
    fn get(&self, key: &str) -> impl Future<Output = anyhow::Result<Option<String>>> + Send;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Remove `key` if present.
    fn remove(&self, key: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}
