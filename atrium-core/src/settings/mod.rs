//! Settings store boundary
//!
//! The admin backend owns a key-value settings store; this crate only
//! consumes it. [`SettingsStore`] is the seam: the embedding host implements
//! it over whatever backend it uses, and the plugin registry persists enable
//! flags through it. [`MemorySettings`] is the in-memory implementation used
//! by tests and by embedders that bring no store of their own.

mod memory;

pub use memory::MemorySettings;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a settings backend
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The backend rejected or failed the operation
    #[error("settings backend error: {0}")]
    Backend(String),
}

/// Key-value settings store consumed by the plugin registry.
///
/// The registry is the only writer for plugin-prefixed keys; embedders must
/// not mutate those keys directly.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read a single value, `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;

    /// Create or overwrite a value.
    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), SettingsError>;

    /// All `(key, value)` pairs whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, SettingsError>;
}
