use std::sync::Arc;
use std::time::Duration;

use datum_client::Sample;
use regex::Regex;
use serde::Deserialize;

use super::{
    compile_optional_pattern, default_uid, setting_key, source_matches, FilterConfigError,
    FilterContext, Filtered, Parameters, SampleFilter,
};
use crate::settings_cache::SettingCache;

fn default_frequency_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceThrottleConfig {
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default)]
    pub source_id_pattern: Option<String>,
    #[serde(default = "default_frequency_seconds")]
    pub frequency_seconds: u64,
}

/// Lets at most one sample per source through every `frequency_seconds`.
pub struct SourceThrottlingFilter {
    uid: String,
    setting_key: String,
    source_pattern: Option<Regex>,
    frequency: Duration,
    settings: Arc<SettingCache>,
}

impl SourceThrottlingFilter {
    pub fn new(config: &SourceThrottleConfig, ctx: &FilterContext) -> Result<Self, FilterConfigError> {
        Ok(Self {
            uid: config.uid.clone(),
            setting_key: setting_key(&config.uid),
            source_pattern: compile_optional_pattern(config.source_id_pattern.as_deref())?,
            frequency: Duration::from_secs(config.frequency_seconds),
            settings: ctx.settings.clone(),
        })
    }
}

impl SampleFilter for SourceThrottlingFilter {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn filter(&self, sample: &Arc<Sample>, _params: &Parameters) -> Filtered {
        if !source_matches(self.source_pattern.as_ref(), &sample.source_id) {
            tracing::trace!(source_id = %sample.source_id, "source does not match pattern; not throttling");
            return Filtered::unchanged(sample);
        }
        if self
            .settings
            .check_and_record(&self.setting_key, &sample.source_id, sample.ts, self.frequency)
        {
            Filtered::unchanged(sample)
        } else {
            tracing::debug!(
                source_id = %sample.source_id,
                frequency_secs = self.frequency.as_secs(),
                "throttling sample"
            );
            Filtered::dropped()
        }
    }
}
