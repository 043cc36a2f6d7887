//! Persistence collaborators used by the filters.
//!
//! Both stores are synchronous: filters call them inline while deciding on a
//! sample, so implementations are expected to be fast and local.

pub mod file;
pub mod memory;

use crate::domain::{Setting, SourceMetadata};

pub use file::{JsonFileMetadataStore, JsonFileSettingStore};
pub use memory::{InMemoryMetadataStore, InMemorySettingStore};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Generic persisted key/value settings.
pub trait SettingStore: Send + Sync {
    /// All `(type, value)` pairs stored under `key`.
    fn get_settings(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Insert or replace the row identified by `(setting.key, setting.setting_type)`.
    fn store_setting(&self, setting: &Setting) -> Result<(), StoreError>;
}

/// Per-source metadata.
pub trait MetadataStore: Send + Sync {
    fn get_source_metadata(&self, source_id: &str) -> Result<Option<SourceMetadata>, StoreError>;

    /// Merge `metadata` into whatever is stored for `source_id`.
    fn add_source_metadata(&self, source_id: &str, metadata: &SourceMetadata) -> Result<(), StoreError>;
}
