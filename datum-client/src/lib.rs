//! Domain types and persistence contracts shared by the sample filter chain.
//!
//! `domain` holds the reading model (`Sample`) and the persisted records the
//! filters keep (`Setting`, `SourceMetadata`). `store` defines the key/value
//! collaborators those records are written through, with in-memory and JSON
//! file implementations.

pub mod domain;
pub mod store;

pub use domain::{Sample, SampleType, Setting, SettingFlag, SourceMetadata};
pub use store::{MetadataStore, SettingStore, StoreError};
