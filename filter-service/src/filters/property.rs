use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use datum_client::Sample;
use regex::Regex;
use serde::Deserialize;

use super::{
    compile_optional_pattern, compile_pattern, compile_patterns, default_uid, setting_key,
    source_matches, FilterConfigError, FilterContext, Filtered, ModeGate, Parameters,
    SampleFilter,
};
use crate::settings_cache::SettingCache;

/// Minimum interval between updates of any property matching `pattern`.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyLimitConfig {
    pub pattern: String,
    pub min_seconds: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertyPatternConfig {
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default)]
    pub source_id_pattern: Option<String>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub limits: Vec<PropertyLimitConfig>,
    #[serde(default)]
    pub required_operational_mode: Option<String>,
}

struct PropertyLimit {
    pattern: Regex,
    min_interval: Duration,
}

/// Keeps the properties named by the include patterns, removes those named
/// by the exclude patterns, and rate limits individual properties.
pub struct PropertyPatternFilter {
    uid: String,
    setting_key: String,
    source_pattern: Option<Regex>,
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
    limits: Vec<PropertyLimit>,
    gate: ModeGate,
    settings: Arc<SettingCache>,
}

impl PropertyPatternFilter {
    pub fn new(config: &PropertyPatternConfig, ctx: &FilterContext) -> Result<Self, FilterConfigError> {
        let limits = config
            .limits
            .iter()
            .map(|l| {
                Ok(PropertyLimit {
                    pattern: compile_pattern(&l.pattern)?,
                    min_interval: Duration::from_secs(l.min_seconds),
                })
            })
            .collect::<Result<Vec<_>, FilterConfigError>>()?;

        Ok(Self {
            uid: config.uid.clone(),
            setting_key: setting_key(&config.uid),
            source_pattern: compile_optional_pattern(config.source_id_pattern.as_deref())?,
            includes: compile_patterns(&config.includes)?,
            excludes: compile_patterns(&config.excludes)?,
            limits,
            gate: ModeGate::new(config.required_operational_mode.as_deref(), ctx.modes.clone()),
            settings: ctx.settings.clone(),
        })
    }

    fn is_selected(&self, name: &str) -> bool {
        let included = self.includes.is_empty() || self.includes.iter().any(|re| re.is_match(name));
        included && !self.excludes.iter().any(|re| re.is_match(name))
    }

    /// False when `name` is rate limited and its interval has not yet passed.
    /// A property allowed through is recorded as updated at `sample.ts`.
    fn passes_limit(&self, sample: &Sample, name: &str) -> bool {
        let Some(limit) = self.limits.iter().find(|l| l.pattern.is_match(name)) else {
            return true;
        };
        if limit.min_interval.is_zero() {
            return true;
        }
        let subject = format!("{};{}", sample.source_id, name);
        let passed = self
            .settings
            .check_and_record(&self.setting_key, &subject, sample.ts, limit.min_interval);
        if !passed {
            tracing::debug!(
                source_id = %sample.source_id,
                property = %name,
                "property updated too recently; removing"
            );
        }
        passed
    }

    fn keep<V: Clone>(&self, sample: &Sample, props: &BTreeMap<String, V>) -> BTreeMap<String, V> {
        props
            .iter()
            .filter(|(name, _)| self.is_selected(name) && self.passes_limit(sample, name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl SampleFilter for PropertyPatternFilter {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn filter(&self, sample: &Arc<Sample>, _params: &Parameters) -> Filtered {
        if !self.gate.is_open() {
            tracing::trace!(
                source_id = %sample.source_id,
                mode = ?self.gate.mode(),
                "required operational mode inactive; not filtering"
            );
            return Filtered::unchanged(sample);
        }
        if !source_matches(self.source_pattern.as_ref(), &sample.source_id) {
            tracing::trace!(source_id = %sample.source_id, "source does not match pattern; not filtering");
            return Filtered::unchanged(sample);
        }

        let instantaneous = self.keep(sample, &sample.instantaneous);
        let accumulating = self.keep(sample, &sample.accumulating);
        let status = self.keep(sample, &sample.status);

        if instantaneous.is_empty() && accumulating.is_empty() && status.is_empty() {
            tracing::debug!(source_id = %sample.source_id, "all properties removed; dropping sample");
            return Filtered::dropped();
        }

        let untouched = instantaneous.len() == sample.instantaneous.len()
            && accumulating.len() == sample.accumulating.len()
            && status.len() == sample.status.len();
        if untouched {
            return Filtered::unchanged(sample);
        }

        let mut out = (**sample).clone();
        out.instantaneous = instantaneous;
        out.accumulating = accumulating;
        out.status = status;
        Filtered::changed(out)
    }
}
