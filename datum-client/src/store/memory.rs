use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{MetadataStore, SettingStore, StoreError};
use crate::domain::{Setting, SourceMetadata};

/// Settings kept in memory. Every write is also appended to a history so
/// callers can inspect exactly what was persisted.
#[derive(Default)]
pub struct InMemorySettingStore {
    rows: Mutex<BTreeMap<(String, String), Setting>>,
    history: Mutex<Vec<Setting>>,
}

impl InMemorySettingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-existing rows without recording them in the write history.
    pub fn seed(&self, setting: Setting) {
        self.rows
            .lock()
            .insert((setting.key.clone(), setting.setting_type.clone()), setting);
    }

    pub fn get(&self, key: &str, setting_type: &str) -> Option<Setting> {
        self.rows
            .lock()
            .get(&(key.to_string(), setting_type.to_string()))
            .cloned()
    }

    /// Every setting passed to `store_setting`, oldest first.
    pub fn writes(&self) -> Vec<Setting> {
        self.history.lock().clone()
    }
}

impl SettingStore for InMemorySettingStore {
    fn get_settings(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let rows = self.rows.lock();
        Ok(rows
            .values()
            .filter(|s| s.key == key)
            .map(|s| (s.setting_type.clone(), s.value.clone()))
            .collect())
    }

    fn store_setting(&self, setting: &Setting) -> Result<(), StoreError> {
        self.rows.lock().insert(
            (setting.key.clone(), setting.setting_type.clone()),
            setting.clone(),
        );
        self.history.lock().push(setting.clone());
        Ok(())
    }
}

/// Source metadata kept in memory, with a history of every snapshot passed to
/// `add_source_metadata`.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    sources: Mutex<BTreeMap<String, SourceMetadata>>,
    history: Mutex<Vec<(String, SourceMetadata)>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, source_id: &str, metadata: SourceMetadata) {
        self.sources.lock().insert(source_id.to_string(), metadata);
    }

    /// Snapshots written for `source_id`, oldest first.
    pub fn snapshots(&self, source_id: &str) -> Vec<SourceMetadata> {
        self.history
            .lock()
            .iter()
            .filter(|(id, _)| id == source_id)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn get_source_metadata(&self, source_id: &str) -> Result<Option<SourceMetadata>, StoreError> {
        Ok(self.sources.lock().get(source_id).cloned())
    }

    fn add_source_metadata(&self, source_id: &str, metadata: &SourceMetadata) -> Result<(), StoreError> {
        self.sources
            .lock()
            .entry(source_id.to_string())
            .or_default()
            .merge(metadata);
        self.history
            .lock()
            .push((source_id.to_string(), metadata.clone()));
        Ok(())
    }
}
