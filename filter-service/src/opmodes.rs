//! Operational modes: named flags other components can condition on.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use time::OffsetDateTime;

pub trait OperationalModes: Send + Sync {
    /// Activate `modes`, optionally until `expire_at`. Returns the modes
    /// active afterwards.
    fn enable_operational_modes(
        &self,
        modes: &BTreeSet<String>,
        expire_at: Option<OffsetDateTime>,
    ) -> BTreeSet<String>;

    /// Deactivate `modes`. Returns the modes active afterwards.
    fn disable_operational_modes(&self, modes: &BTreeSet<String>) -> BTreeSet<String>;

    fn is_operational_mode_active(&self, mode: &str) -> bool;
}

/// In-process registry. Mode names are compared case-insensitively and an
/// expired mode reads as inactive.
#[derive(Default)]
pub struct OperationalModeRegistry {
    active: RwLock<BTreeMap<String, Option<OffsetDateTime>>>,
}

fn normalize(mode: &str) -> String {
    mode.trim().to_lowercase()
}

impl OperationalModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn active_at(
        active: &BTreeMap<String, Option<OffsetDateTime>>,
        now: OffsetDateTime,
    ) -> BTreeSet<String> {
        active
            .iter()
            .filter(|(_, expire)| expire.map_or(true, |e| e > now))
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn active_modes(&self) -> BTreeSet<String> {
        Self::active_at(&self.active.read(), OffsetDateTime::now_utc())
    }
}

impl OperationalModes for OperationalModeRegistry {
    fn enable_operational_modes(
        &self,
        modes: &BTreeSet<String>,
        expire_at: Option<OffsetDateTime>,
    ) -> BTreeSet<String> {
        let now = OffsetDateTime::now_utc();
        let mut active = self.active.write();
        active.retain(|_, expire| expire.map_or(true, |e| e > now));
        for mode in modes {
            let mode = normalize(mode);
            if mode.is_empty() {
                continue;
            }
            tracing::debug!(mode = %mode, expire_at = ?expire_at, "enabling operational mode");
            active.insert(mode, expire_at);
        }
        Self::active_at(&active, now)
    }

    fn disable_operational_modes(&self, modes: &BTreeSet<String>) -> BTreeSet<String> {
        let now = OffsetDateTime::now_utc();
        let mut active = self.active.write();
        for mode in modes {
            if active.remove(&normalize(mode)).is_some() {
                tracing::debug!(mode = %mode, "disabled operational mode");
            }
        }
        Self::active_at(&active, now)
    }

    fn is_operational_mode_active(&self, mode: &str) -> bool {
        let now = OffsetDateTime::now_utc();
        self.active
            .read()
            .get(&normalize(mode))
            .is_some_and(|expire| expire.map_or(true, |e| e > now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn set(modes: &[&str]) -> BTreeSet<String> {
        modes.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn enable_and_disable_report_active_set() {
        let reg = OperationalModeRegistry::new();
        let active = reg.enable_operational_modes(&set(&["Hot", "cold"]), None);
        assert_eq!(active, set(&["cold", "hot"]));
        assert!(reg.is_operational_mode_active("HOT"));

        let active = reg.disable_operational_modes(&set(&["hot"]));
        assert_eq!(active, set(&["cold"]));
        assert!(!reg.is_operational_mode_active("hot"));
    }

    #[test]
    fn expired_modes_are_inactive() {
        let reg = OperationalModeRegistry::new();
        let past = OffsetDateTime::now_utc() - Duration::seconds(5);
        let future = OffsetDateTime::now_utc() + Duration::minutes(5);

        reg.enable_operational_modes(&set(&["old"]), Some(past));
        reg.enable_operational_modes(&set(&["new"]), Some(future));

        assert!(!reg.is_operational_mode_active("old"));
        assert!(reg.is_operational_mode_active("new"));
        assert_eq!(reg.active_modes(), set(&["new"]));
    }

    #[test]
    fn blank_modes_are_ignored() {
        let reg = OperationalModeRegistry::new();
        assert!(reg.enable_operational_modes(&set(&["  "]), None).is_empty());
    }
}
