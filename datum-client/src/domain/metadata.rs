use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-like metadata attached to a source.
///
/// `info` holds source-wide values, `property_info` holds values grouped by a
/// property name (virtual meters keep their running state there).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, Value>,
    #[serde(default, rename = "pm", skip_serializing_if = "BTreeMap::is_empty")]
    pub property_info: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default, rename = "t", skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl SourceMetadata {
    pub fn is_empty(&self) -> bool {
        self.info.is_empty() && self.property_info.is_empty() && self.tags.is_empty()
    }

    pub fn info_value(&self, property: &str, key: &str) -> Option<&Value> {
        self.property_info.get(property).and_then(|m| m.get(key))
    }

    pub fn put_info_value(&mut self, property: &str, key: &str, value: impl Into<Value>) {
        self.property_info
            .entry(property.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Integer property info value, accepting either a JSON number or a
    /// numeric string.
    pub fn info_i64(&self, property: &str, key: &str) -> Option<i64> {
        match self.info_value(property, key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Decimal property info value, accepting either a JSON number or a
    /// numeric string.
    pub fn info_f64(&self, property: &str, key: &str) -> Option<f64> {
        match self.info_value(property, key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Merge `other` into `self`: tags are added, `info` and `property_info`
    /// keys from `other` overwrite existing ones.
    pub fn merge(&mut self, other: &SourceMetadata) {
        for (k, v) in &other.info {
            self.info.insert(k.clone(), v.clone());
        }
        for (prop, values) in &other.property_info {
            let target = self.property_info.entry(prop.clone()).or_default();
            for (k, v) in values {
                target.insert(k.clone(), v.clone());
            }
        }
        self.tags.extend(other.tags.iter().cloned());
    }
}
