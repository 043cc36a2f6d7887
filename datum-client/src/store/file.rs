use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use super::{MetadataStore, SettingStore, StoreError};
use crate::domain::{Setting, SourceMetadata};

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write to a sibling temp file, then rename over the target so a crash never
/// leaves a half-written file behind.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

type SettingRows = BTreeMap<String, BTreeMap<String, Setting>>;

/// Settings persisted as one JSON document, rewritten on every store.
pub struct JsonFileSettingStore {
    path: PathBuf,
    rows: Mutex<SettingRows>,
}

impl JsonFileSettingStore {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let path = path.into();
        let rows = read_json(&path)?;
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }
}

impl SettingStore for JsonFileSettingStore {
    fn get_settings(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let rows = self.rows.lock();
        Ok(rows
            .get(key)
            .map(|by_type| {
                by_type
                    .values()
                    .map(|s| (s.setting_type.clone(), s.value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn store_setting(&self, setting: &Setting) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        rows.entry(setting.key.clone())
            .or_default()
            .insert(setting.setting_type.clone(), setting.clone());
        write_json(&self.path, &*rows)
    }
}

/// Source metadata persisted as one JSON document keyed by source id.
pub struct JsonFileMetadataStore {
    path: PathBuf,
    sources: Mutex<BTreeMap<String, SourceMetadata>>,
}

impl JsonFileMetadataStore {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let path = path.into();
        let sources = read_json(&path)?;
        Ok(Self {
            path,
            sources: Mutex::new(sources),
        })
    }
}

impl MetadataStore for JsonFileMetadataStore {
    fn get_source_metadata(&self, source_id: &str) -> Result<Option<SourceMetadata>, StoreError> {
        Ok(self.sources.lock().get(source_id).cloned())
    }

    fn add_source_metadata(&self, source_id: &str, metadata: &SourceMetadata) -> Result<(), StoreError> {
        let mut sources = self.sources.lock();
        sources
            .entry(source_id.to_string())
            .or_default()
            .merge(metadata);
        write_json(&self.path, &*sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = JsonFileSettingStore::open(&path).unwrap();
        assert!(store.get_settings("k").unwrap().is_empty());
        store.store_setting(&Setting::new("k", "src", "18f")).unwrap();
        drop(store);

        let reopened = JsonFileSettingStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_settings("k").unwrap(),
            vec![("src".to_string(), "18f".to_string())]
        );
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[test]
    fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let store = JsonFileMetadataStore::open(&path).unwrap();
        let mut m = SourceMetadata::default();
        m.put_info_value("wattHours", "vm-reading", "42");
        store.add_source_metadata("meter-1", &m).unwrap();
        drop(store);

        let reopened = JsonFileMetadataStore::open(&path).unwrap();
        let loaded = reopened.get_source_metadata("meter-1").unwrap().unwrap();
        assert_eq!(loaded.info_f64("wattHours", "vm-reading"), Some(42.0));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{not json").unwrap();

        let res = JsonFileSettingStore::open(&path);
        assert!(matches!(res, Err(StoreError::Serialization(_))));
    }
}
