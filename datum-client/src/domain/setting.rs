use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::sample::{epoch_millis, from_epoch_millis};

/// Hints to the setting store about how a row should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SettingFlag {
    /// Do not emit change notifications for this row.
    Volatile,
    /// Do not bump the store's modification date, so the row is left out of
    /// backups.
    IgnoreModificationDate,
}

/// A persisted `(key, type) -> value` record.
///
/// Filters use `key` to identify themselves and `setting_type` for the
/// debounced subject (a source id, or `"<sourceId>;<propertyName>"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub setting_type: String,
    pub value: String,
    #[serde(default)]
    pub flags: BTreeSet<SettingFlag>,
}

impl Setting {
    pub fn new(
        key: impl Into<String>,
        setting_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            setting_type: setting_type.into(),
            value: value.into(),
            flags: BTreeSet::new(),
        }
    }

    /// A timestamp row flagged `Volatile` and `IgnoreModificationDate`, the
    /// form every debounce timestamp is written in.
    pub fn volatile_timestamp(
        key: impl Into<String>,
        setting_type: impl Into<String>,
        ts: OffsetDateTime,
    ) -> Self {
        let mut s = Self::new(key, setting_type, encode_timestamp(ts));
        s.flags.insert(SettingFlag::Volatile);
        s.flags.insert(SettingFlag::IgnoreModificationDate);
        s
    }

    pub fn timestamp(&self) -> Option<OffsetDateTime> {
        decode_timestamp(&self.value)
    }
}

/// Lower-case hex of the epoch milliseconds, `-` prefixed before 1970.
pub fn encode_timestamp(ts: OffsetDateTime) -> String {
    let millis = epoch_millis(ts);
    if millis < 0 {
        format!("-{:x}", millis.unsigned_abs())
    } else {
        format!("{millis:x}")
    }
}

pub fn decode_timestamp(value: &str) -> Option<OffsetDateTime> {
    i64::from_str_radix(value.trim(), 16)
        .ok()
        .and_then(from_epoch_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn timestamp_is_hex_epoch_millis() {
        let ts = datetime!(2024-01-01 00:00:00 UTC);
        let encoded = encode_timestamp(ts);
        assert_eq!(i64::from_str_radix(&encoded, 16).unwrap(), 1_704_067_200_000);
        assert_eq!(decode_timestamp(&encoded), Some(ts));
    }

    #[test]
    fn pre_epoch_timestamp_round_trips() {
        let ts = datetime!(1969-12-31 23:59:59 UTC);
        let encoded = encode_timestamp(ts);
        assert_eq!(encoded, "-3e8");
        assert_eq!(decode_timestamp(&encoded), Some(ts));
    }

    #[test]
    fn garbage_values_do_not_decode() {
        assert_eq!(decode_timestamp("not-hex"), None);
        assert_eq!(decode_timestamp(""), None);
    }

    #[test]
    fn volatile_timestamp_carries_both_flags() {
        let s = Setting::volatile_timestamp("test/valueCaptured", "FILTER_ME", datetime!(2024-01-01 00:00:00 UTC));
        assert!(s.flags.contains(&SettingFlag::Volatile));
        assert!(s.flags.contains(&SettingFlag::IgnoreModificationDate));
        assert_eq!(s.timestamp(), Some(datetime!(2024-01-01 00:00:00 UTC)));
    }
}
