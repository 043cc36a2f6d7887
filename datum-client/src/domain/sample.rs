use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The kind of a sample property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    Instantaneous,
    Accumulating,
    Status,
    Tag,
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleType::Instantaneous => write!(f, "instantaneous"),
            SampleType::Accumulating => write!(f, "accumulating"),
            SampleType::Status => write!(f, "status"),
            SampleType::Tag => write!(f, "tag"),
        }
    }
}

/// One reading captured from a source at a point in time.
///
/// Filters never mutate a sample they are handed: a changed result is always
/// a new value (usually built from a `clone()` of the input).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub source_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instantaneous: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accumulating: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl Sample {
    pub fn new(source_id: impl Into<String>, ts: OffsetDateTime) -> Self {
        Self {
            source_id: source_id.into(),
            ts,
            instantaneous: BTreeMap::new(),
            accumulating: BTreeMap::new(),
            status: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_instantaneous(mut self, name: impl Into<String>, value: f64) -> Self {
        self.instantaneous.insert(name.into(), value);
        self
    }

    pub fn with_accumulating(mut self, name: impl Into<String>, value: f64) -> Self {
        self.accumulating.insert(name.into(), value);
        self
    }

    pub fn with_status(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.status.insert(name.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// True when none of the instantaneous, accumulating or status maps hold
    /// a property. Tags are not counted as properties.
    pub fn is_empty(&self) -> bool {
        self.instantaneous.is_empty() && self.accumulating.is_empty() && self.status.is_empty()
    }

    /// Numeric value of a property. Status values are parsed when they hold a
    /// number; tags never have a value.
    pub fn numeric(&self, kind: SampleType, name: &str) -> Option<f64> {
        match kind {
            SampleType::Instantaneous => self.instantaneous.get(name).copied(),
            SampleType::Accumulating => self.accumulating.get(name).copied(),
            SampleType::Status => self.status.get(name).and_then(|v| v.trim().parse().ok()),
            SampleType::Tag => None,
        }
    }

    /// Set a numeric property. Status values are stored in their text form and
    /// a tag is added when `value` is non-zero, removed otherwise.
    pub fn put_numeric(&mut self, kind: SampleType, name: &str, value: f64) {
        match kind {
            SampleType::Instantaneous => {
                self.instantaneous.insert(name.to_string(), value);
            }
            SampleType::Accumulating => {
                self.accumulating.insert(name.to_string(), value);
            }
            SampleType::Status => {
                self.status.insert(name.to_string(), value.to_string());
            }
            SampleType::Tag => {
                if value != 0.0 {
                    self.tags.insert(name.to_string());
                } else {
                    self.tags.remove(name);
                }
            }
        }
    }

    pub fn has_property(&self, kind: SampleType, name: &str) -> bool {
        match kind {
            SampleType::Instantaneous => self.instantaneous.contains_key(name),
            SampleType::Accumulating => self.accumulating.contains_key(name),
            SampleType::Status => self.status.contains_key(name),
            SampleType::Tag => self.tags.contains(name),
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        epoch_millis(self.ts)
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_epoch_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample() -> Sample {
        Sample::new("meter-1", datetime!(2024-01-01 00:00:00 UTC))
            .with_instantaneous("watts", 23.4)
            .with_accumulating("wattHours", 1000.0)
            .with_status("phase", "PhaseA")
    }

    #[test]
    fn numeric_reads_each_property_kind() {
        let s = sample().with_status("level", "7.5").with_tag("alarm");

        assert_eq!(s.numeric(SampleType::Instantaneous, "watts"), Some(23.4));
        assert_eq!(s.numeric(SampleType::Accumulating, "wattHours"), Some(1000.0));
        assert_eq!(s.numeric(SampleType::Status, "level"), Some(7.5));
        assert_eq!(s.numeric(SampleType::Status, "phase"), None);
        assert_eq!(s.numeric(SampleType::Tag, "alarm"), None);
    }

    #[test]
    fn put_numeric_on_tag_adds_and_removes() {
        let mut s = sample();
        s.put_numeric(SampleType::Tag, "alarm", 1.0);
        assert!(s.tags.contains("alarm"));
        s.put_numeric(SampleType::Tag, "alarm", 0.0);
        assert!(!s.tags.contains("alarm"));
    }

    #[test]
    fn tags_do_not_count_as_properties() {
        let s = Sample::new("a", datetime!(2024-01-01 00:00:00 UTC)).with_tag("t");
        assert!(s.is_empty());
        assert!(!sample().is_empty());
    }

    #[test]
    fn json_uses_rfc3339_and_omits_empty_maps() {
        let s = Sample::new("a", datetime!(2024-01-01 00:00:00 UTC)).with_instantaneous("watts", 1.0);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"ts\":\"2024-01-01T00:00:00Z\""));
        assert!(!json.contains("accumulating"));

        let parsed: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn epoch_millis_round_trips() {
        let ts = datetime!(2021-05-14 10:00:00.250 UTC);
        let ms = epoch_millis(ts);
        assert_eq!(ms % 1000, 250);
        assert_eq!(from_epoch_millis(ms), Some(ts));
    }
}
