use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use datum_client::Sample;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use time::OffsetDateTime;

use super::{
    compile_optional_pattern, default_uid, round_to, source_matches, FilterConfigError,
    FilterContext, Filtered, ModeGate, Parameters, SampleFilter,
};

fn default_sample_count() -> usize {
    5
}

fn default_decimal_scale() -> u32 {
    3
}

fn default_min_format() -> String {
    "{}_min".to_string()
}

fn default_max_format() -> String {
    "{}_max".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownsampleConfig {
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default)]
    pub source_id_pattern: Option<String>,
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
    /// When set, aggregate by time slot (sample timestamps) instead of count.
    #[serde(default)]
    pub sample_duration_secs: Option<u64>,
    #[serde(default = "default_decimal_scale")]
    pub decimal_scale: u32,
    #[serde(default = "default_min_format")]
    pub min_property_format: String,
    #[serde(default = "default_max_format")]
    pub max_property_format: String,
    #[serde(default)]
    pub required_operational_mode: Option<String>,
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        Self {
            uid: default_uid(),
            source_id_pattern: None,
            sample_count: default_sample_count(),
            sample_duration_secs: None,
            decimal_scale: default_decimal_scale(),
            min_property_format: default_min_format(),
            max_property_format: default_max_format(),
            required_operational_mode: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Stats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Stats {
    fn new(v: f64) -> Self {
        Self {
            count: 1,
            sum: v,
            min: v,
            max: v,
        }
    }

    fn add(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    fn average(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// Running aggregate of one source's samples.
#[derive(Debug, Default)]
struct Aggregate {
    samples: usize,
    started: Option<OffsetDateTime>,
    last_ts: Option<OffsetDateTime>,
    instantaneous: BTreeMap<String, Stats>,
    accumulating: BTreeMap<String, f64>,
    status: BTreeMap<String, String>,
    tags: BTreeSet<String>,
}

impl Aggregate {
    fn add(&mut self, sample: &Sample) {
        self.samples += 1;
        self.started.get_or_insert(sample.ts);
        self.last_ts = Some(sample.ts);
        for (name, v) in &sample.instantaneous {
            self.instantaneous
                .entry(name.clone())
                .and_modify(|s| s.add(*v))
                .or_insert_with(|| Stats::new(*v));
        }
        for (name, v) in &sample.accumulating {
            self.accumulating.insert(name.clone(), *v);
        }
        for (name, v) in &sample.status {
            self.status.insert(name.clone(), v.clone());
        }
        self.tags = sample.tags.clone();
    }
}

/// Collapses consecutive samples of a source into one sample holding the
/// average, minimum and maximum of each instantaneous property.
pub struct DownsampleFilter {
    uid: String,
    source_pattern: Option<Regex>,
    sample_count: usize,
    sample_duration: Option<Duration>,
    decimal_scale: u32,
    min_format: String,
    max_format: String,
    gate: ModeGate,
    aggregates: Mutex<HashMap<String, Aggregate>>,
}

impl DownsampleFilter {
    pub fn new(config: &DownsampleConfig, ctx: &FilterContext) -> Result<Self, FilterConfigError> {
        if config.sample_count == 0 && config.sample_duration_secs.is_none() {
            return Err(FilterConfigError::Invalid(
                "downsample sample_count must be at least 1".to_string(),
            ));
        }
        if config.sample_duration_secs == Some(0) {
            return Err(FilterConfigError::Invalid(
                "downsample sample_duration_secs must be at least 1".to_string(),
            ));
        }
        for format in [&config.min_property_format, &config.max_property_format] {
            if !format.contains("{}") {
                return Err(FilterConfigError::Invalid(format!(
                    "property format '{format}' has no {{}} placeholder"
                )));
            }
        }
        Ok(Self {
            uid: config.uid.clone(),
            source_pattern: compile_optional_pattern(config.source_id_pattern.as_deref())?,
            sample_count: config.sample_count,
            sample_duration: config.sample_duration_secs.map(Duration::from_secs),
            decimal_scale: config.decimal_scale,
            min_format: config.min_property_format.clone(),
            max_format: config.max_property_format.clone(),
            gate: ModeGate::new(config.required_operational_mode.as_deref(), ctx.modes.clone()),
            aggregates: Mutex::new(HashMap::new()),
        })
    }

    fn finish(&self, source_id: &str, agg: Aggregate) -> Option<Sample> {
        let ts = agg.last_ts?;
        let mut out = Sample::new(source_id, ts);
        for (name, stats) in &agg.instantaneous {
            out.instantaneous
                .insert(name.clone(), round_to(stats.average(), self.decimal_scale));
            out.instantaneous.insert(
                self.min_format.replace("{}", name),
                round_to(stats.min, self.decimal_scale),
            );
            out.instantaneous.insert(
                self.max_format.replace("{}", name),
                round_to(stats.max, self.decimal_scale),
            );
        }
        out.accumulating = agg.accumulating;
        out.status = agg.status;
        out.tags = agg.tags;
        tracing::debug!(
            source_id = %source_id,
            samples = agg.samples,
            "emitting downsampled sample"
        );
        Some(out)
    }
}

impl SampleFilter for DownsampleFilter {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn filter(&self, sample: &Arc<Sample>, _params: &Parameters) -> Filtered {
        if !self.gate.is_open() {
            tracing::trace!(
                source_id = %sample.source_id,
                mode = ?self.gate.mode(),
                "required operational mode inactive; not downsampling"
            );
            return Filtered::unchanged(sample);
        }
        if !source_matches(self.source_pattern.as_ref(), &sample.source_id) {
            return Filtered::unchanged(sample);
        }

        let mut aggregates = self.aggregates.lock();
        let agg = aggregates.entry(sample.source_id.clone()).or_default();

        match self.sample_duration {
            Some(slot) => {
                // A sample past the end of the current slot closes it; the
                // sample itself opens the next one.
                let expired = agg.started.is_some_and(|start| sample.ts - start >= slot);
                if expired {
                    let done = std::mem::take(agg);
                    agg.add(sample);
                    match self.finish(&sample.source_id, done) {
                        Some(out) => Filtered::changed(out),
                        None => Filtered::dropped(),
                    }
                } else {
                    agg.add(sample);
                    Filtered::dropped()
                }
            }
            None => {
                agg.add(sample);
                if agg.samples < self.sample_count {
                    tracing::trace!(
                        source_id = %sample.source_id,
                        samples = agg.samples,
                        "collecting sample for downsample"
                    );
                    return Filtered::dropped();
                }
                let done = std::mem::take(agg);
                match self.finish(&sample.source_id, done) {
                    Some(out) => Filtered::changed(out),
                    None => Filtered::dropped(),
                }
            }
        }
    }
}
