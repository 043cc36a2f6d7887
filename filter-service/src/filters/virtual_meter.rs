//! Virtual meters: running totals derived from a sample property.
//!
//! An instantaneous property (say `watts`) is integrated over time with the
//! trapezoid rule; an accumulating property contributes its delta. The total
//! lives in the source's metadata under the reading property name, as three
//! values: the date of the last integrated sample (`vm-date`, epoch millis),
//! the raw input at that date (`vm-value`) and the reading (`vm-reading`).
//! Each new sample is integrated against that snapshot only, so the reading
//! carries across restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use datum_client::domain::{epoch_millis, from_epoch_millis};
use datum_client::{MetadataStore, Sample, SampleType, SourceMetadata};
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use time::OffsetDateTime;

use super::rolling::RollingWindow;
use super::{
    compile_expression, compile_optional_pattern, default_uid, resolve_expression_service,
    round_to, source_matches, FilterConfigError, FilterContext, Filtered, Parameters,
    SampleFilter,
};
use crate::expression::{sample_bindings, CompiledExpression, ExpressionService, Value};

pub const DATE_KEY: &str = "vm-date";
pub const VALUE_KEY: &str = "vm-value";
pub const READING_KEY: &str = "vm-reading";

/// The unit readings are expressed in: an input of 1 held for one unit adds
/// 1 to the reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    #[default]
    Hours,
    Days,
}

impl TimeUnit {
    pub fn millis(self) -> f64 {
        match self {
            TimeUnit::Seconds => 1_000.0,
            TimeUnit::Minutes => 60_000.0,
            TimeUnit::Hours => 3_600_000.0,
            TimeUnit::Days => 86_400_000.0,
        }
    }

    /// Suffix of the default reading property name.
    pub fn label(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "Seconds",
            TimeUnit::Minutes => "Minutes",
            TimeUnit::Hours => "Hours",
            TimeUnit::Days => "Days",
        }
    }
}

fn default_property_type() -> SampleType {
    SampleType::Instantaneous
}

fn default_max_age_seconds() -> u64 {
    3600
}

fn default_rolling_average_count() -> usize {
    1
}

fn default_scale() -> u32 {
    6
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMeterConfig {
    pub property_key: String,
    #[serde(default = "default_property_type")]
    pub property_type: SampleType,
    #[serde(default)]
    pub reading_property_name: Option<String>,
    #[serde(default)]
    pub time_unit: TimeUnit,
    /// A snapshot older than this is not integrated against; 0 disables.
    #[serde(default = "default_max_age_seconds")]
    pub max_age_seconds: u64,
    #[serde(default = "default_rolling_average_count")]
    pub rolling_average_count: usize,
    #[serde(default = "default_scale")]
    pub virtual_meter_scale: u32,
    #[serde(default)]
    pub track_only_when_reading_changes: bool,
    /// Starting reading for a meter with no saved state.
    #[serde(default)]
    pub meter_reading: Option<f64>,
    #[serde(default)]
    pub include_instantaneous_diff_property: bool,
    #[serde(default)]
    pub instantaneous_diff_property_name: Option<String>,
    /// Computes the new reading in place of the built-in integration.
    #[serde(default)]
    pub expression: Option<String>,
}

impl VirtualMeterConfig {
    pub fn new(property_key: impl Into<String>, property_type: SampleType) -> Self {
        Self {
            property_key: property_key.into(),
            property_type,
            reading_property_name: None,
            time_unit: TimeUnit::default(),
            max_age_seconds: default_max_age_seconds(),
            rolling_average_count: default_rolling_average_count(),
            virtual_meter_scale: default_scale(),
            track_only_when_reading_changes: false,
            meter_reading: None,
            include_instantaneous_diff_property: false,
            instantaneous_diff_property_name: None,
            expression: None,
        }
    }

    /// The configured reading name, or the property key followed by the time
    /// unit (`wattsHours`).
    pub fn reading_property_name(&self) -> String {
        match self.reading_property_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}{}", self.property_key, self.time_unit.label()),
        }
    }

    pub fn instantaneous_diff_property_name(&self) -> String {
        match self.instantaneous_diff_property_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}Diff", self.reading_property_name()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMeterFilterConfig {
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default)]
    pub source_id_pattern: Option<String>,
    #[serde(default)]
    pub expression_service_id: Option<String>,
    #[serde(default)]
    pub meters: Vec<VirtualMeterConfig>,
}

/// A meter's persisted snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterState {
    pub date: OffsetDateTime,
    pub value: f64,
    pub reading: f64,
}

impl MeterState {
    /// `None` unless all three values are present.
    pub fn load(meta: &SourceMetadata, reading_name: &str) -> Option<Self> {
        Some(Self {
            date: from_epoch_millis(meta.info_i64(reading_name, DATE_KEY)?)?,
            value: meta.info_f64(reading_name, VALUE_KEY)?,
            reading: meta.info_f64(reading_name, READING_KEY)?,
        })
    }

    pub fn store(&self, meta: &mut SourceMetadata, reading_name: &str) {
        meta.put_info_value(reading_name, DATE_KEY, epoch_millis(self.date));
        meta.put_info_value(reading_name, VALUE_KEY, self.value.to_string());
        meta.put_info_value(reading_name, READING_KEY, self.reading.to_string());
    }
}

struct Meter {
    property_key: String,
    property_type: SampleType,
    reading_name: String,
    unit_millis: f64,
    max_age: Option<Duration>,
    window_size: usize,
    scale: u32,
    track_only_when_reading_changes: bool,
    initial_reading: f64,
    diff_property: Option<String>,
    expression: Option<MeterExpression>,
}

struct MeterExpression {
    text: String,
    compiled: Box<dyn CompiledExpression>,
}

impl Meter {
    fn from_config(
        config: &VirtualMeterConfig,
        evaluator: Option<&dyn ExpressionService>,
    ) -> Result<Self, FilterConfigError> {
        let property_key = config.property_key.trim();
        if property_key.is_empty() {
            return Err(FilterConfigError::Invalid(
                "virtual meter property_key is required".to_string(),
            ));
        }
        if !matches!(
            config.property_type,
            SampleType::Instantaneous | SampleType::Accumulating
        ) {
            return Err(FilterConfigError::Invalid(format!(
                "virtual meter '{property_key}' property_type must be instantaneous or accumulating, not {}",
                config.property_type
            )));
        }
        let expression = match (expression_text(config), evaluator) {
            (Some(text), Some(evaluator)) => Some(MeterExpression {
                compiled: compile_expression(evaluator, text)?,
                text: text.to_string(),
            }),
            _ => None,
        };
        Ok(Self {
            property_key: property_key.to_string(),
            property_type: config.property_type,
            reading_name: config.reading_property_name(),
            unit_millis: config.time_unit.millis(),
            max_age: (config.max_age_seconds > 0).then(|| Duration::from_secs(config.max_age_seconds)),
            window_size: config.rolling_average_count,
            scale: config.virtual_meter_scale,
            track_only_when_reading_changes: config.track_only_when_reading_changes,
            initial_reading: config.meter_reading.unwrap_or(0.0),
            diff_property: config
                .include_instantaneous_diff_property
                .then(|| config.instantaneous_diff_property_name()),
            expression,
        })
    }

    fn uses_window(&self) -> bool {
        self.property_type == SampleType::Instantaneous && self.window_size > 1
    }
}

fn expression_text(config: &VirtualMeterConfig) -> Option<&str> {
    config
        .expression
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
}

/// Adds a running meter reading for each configured property.
pub struct VirtualMeterFilter {
    uid: String,
    source_pattern: Option<Regex>,
    meters: Vec<Meter>,
    metadata: Arc<dyn MetadataStore>,
    sources: Mutex<HashMap<String, Arc<Mutex<SourceMetadata>>>>,
    windows: Mutex<HashMap<String, RollingWindow>>,
}

impl VirtualMeterFilter {
    pub fn new(config: &VirtualMeterFilterConfig, ctx: &FilterContext) -> Result<Self, FilterConfigError> {
        let evaluator = if config.meters.iter().any(|m| expression_text(m).is_some()) {
            Some(resolve_expression_service(
                &ctx.expressions,
                config.expression_service_id.as_deref(),
            )?)
        } else {
            None
        };
        let meters = config
            .meters
            .iter()
            .map(|m| Meter::from_config(m, evaluator.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            uid: config.uid.clone(),
            source_pattern: compile_optional_pattern(config.source_id_pattern.as_deref())?,
            meters,
            metadata: ctx.metadata.clone(),
            sources: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// The cached metadata of `source_id`, loaded on first use. Its lock also
    /// serializes all processing for the source. `None` when the store could
    /// not be read: without the saved snapshots a meter would re-seed and
    /// overwrite its running reading.
    fn source_metadata(&self, source_id: &str) -> Option<Arc<Mutex<SourceMetadata>>> {
        let mut sources = self.sources.lock();
        if let Some(meta) = sources.get(source_id) {
            return Some(meta.clone());
        }
        match self.metadata.get_source_metadata(source_id) {
            Ok(found) => {
                match &found {
                    Some(m) => tracing::info!(
                        source_id = %source_id,
                        properties = ?m.property_info.keys().collect::<Vec<_>>(),
                        "loaded existing source metadata"
                    ),
                    None => tracing::info!(source_id = %source_id, "no existing source metadata"),
                }
                let meta = Arc::new(Mutex::new(found.unwrap_or_default()));
                sources.insert(source_id.to_string(), meta.clone());
                Some(meta)
            }
            Err(e) => {
                // Not cached, so the next sample asks the store again.
                tracing::warn!(
                    error = %e,
                    source_id = %source_id,
                    "failed to load source metadata; not populating virtual meters"
                );
                None
            }
        }
    }

    fn push_window(&self, meter: &Meter, source_id: &str, value: f64) -> Option<f64> {
        if !meter.uses_window() {
            return None;
        }
        let key = format!("{}.{}", source_id, meter.property_key);
        let mut windows = self.windows.lock();
        let window = windows
            .entry(key)
            .or_insert_with(|| RollingWindow::new(meter.window_size));
        Some(window.push(value))
    }

    fn persist(&self, source_id: &str, reading_name: &str, state: &MeterState) {
        let mut snapshot = SourceMetadata::default();
        state.store(&mut snapshot, reading_name);
        if let Err(e) = self.metadata.add_source_metadata(source_id, &snapshot) {
            metrics::counter!("virtual_meter_persist_errors_total").increment(1);
            tracing::warn!(
                error = %e,
                source_id = %source_id,
                meter = %reading_name,
                "failed to persist virtual meter state"
            );
        }
    }

    fn new_reading(
        &self,
        meter: &Meter,
        sample: &Sample,
        params: &Parameters,
        prev: &MeterState,
        curr: f64,
        elapsed_ms: f64,
    ) -> Option<f64> {
        let units = elapsed_ms / meter.unit_millis;
        let Some(expression) = &meter.expression else {
            let increment = match meter.property_type {
                SampleType::Accumulating => curr - prev.value,
                _ => (prev.value + curr) / 2.0 * units,
            };
            return Some(prev.reading + increment);
        };

        let mut bindings = params.clone();
        bindings.extend(sample_bindings(sample));
        bindings.insert("prevReading".into(), Value::Number(prev.reading));
        bindings.insert("prevInput".into(), Value::Number(prev.value));
        bindings.insert("currInput".into(), Value::Number(curr));
        bindings.insert("inputDiff".into(), Value::Number(curr - prev.value));
        bindings.insert("timeUnits".into(), Value::Number(units));
        bindings.insert("prevDate".into(), Value::Number(epoch_millis(prev.date) as f64));
        bindings.insert("currDate".into(), Value::Number(epoch_millis(sample.ts) as f64));

        match expression.compiled.evaluate(&bindings) {
            Ok(v) => match v.as_f64() {
                Some(reading) if reading.is_finite() => Some(reading),
                _ => {
                    tracing::warn!(
                        source_id = %sample.source_id,
                        meter = %meter.reading_name,
                        expression = %expression.text,
                        result = %v,
                        "virtual meter expression did not produce a number"
                    );
                    None
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    source_id = %sample.source_id,
                    meter = %meter.reading_name,
                    expression = %expression.text,
                    "virtual meter expression failed"
                );
                None
            }
        }
    }

    /// Apply one meter. Returns true when `out` was modified.
    fn apply_meter(
        &self,
        meter: &Meter,
        sample: &Sample,
        params: &Parameters,
        meta: &mut SourceMetadata,
        out: &mut Sample,
        produced: &mut Parameters,
    ) -> bool {
        let source_id = sample.source_id.as_str();
        let reading_name = meter.reading_name.as_str();

        if sample.has_property(SampleType::Accumulating, reading_name) {
            tracing::warn!(
                source_id = %source_id,
                meter = %reading_name,
                "accumulating property already present; not populating virtual meter"
            );
            return false;
        }
        let Some(curr) = sample.numeric(meter.property_type, &meter.property_key) else {
            tracing::trace!(
                source_id = %source_id,
                property = %meter.property_key,
                "meter input not available"
            );
            return false;
        };
        let date = sample.ts;

        let Some(prev) = MeterState::load(meta, reading_name) else {
            let state = MeterState {
                date,
                value: curr,
                reading: meta
                    .info_f64(reading_name, READING_KEY)
                    .unwrap_or(meter.initial_reading),
            };
            state.store(meta, reading_name);
            self.push_window(meter, source_id, curr);
            tracing::info!(
                source_id = %source_id,
                meter = %reading_name,
                value = curr,
                reading = state.reading,
                "virtual meter started"
            );
            self.persist(source_id, reading_name, &state);
            return false;
        };

        if prev.date > date {
            tracing::warn!(
                source_id = %source_id,
                meter = %reading_name,
                prev_date = %prev.date,
                sample_date = %date,
                "meter reading date newer than sample; not populating reading"
            );
            return false;
        }

        let elapsed = date - prev.date;
        if meter.max_age.is_some_and(|max| elapsed > max) {
            tracing::warn!(
                source_id = %source_id,
                meter = %reading_name,
                prev_date = %prev.date,
                elapsed_secs = elapsed.whole_seconds(),
                "previous meter reading too old; restarting integration"
            );
            let state = MeterState {
                date,
                value: curr,
                reading: prev.reading,
            };
            state.store(meta, reading_name);
            self.push_window(meter, source_id, curr);
            out.accumulating.insert(reading_name.to_string(), prev.reading);
            self.persist(source_id, reading_name, &state);
            return true;
        }

        let elapsed_ms = elapsed.whole_milliseconds() as f64;
        let Some(reading) = self.new_reading(meter, sample, params, &prev, curr, elapsed_ms) else {
            return false;
        };
        let reading = round_to(reading, meter.scale);
        let reading_diff = reading - prev.reading;
        out.accumulating.insert(reading_name.to_string(), reading);

        if let Some(avg) = self.push_window(meter, source_id, curr) {
            out.put_numeric(meter.property_type, &meter.property_key, round_to(avg, meter.scale));
        }
        if let Some(diff_name) = &meter.diff_property {
            out.instantaneous.insert(diff_name.clone(), reading_diff);
        }

        if meter.track_only_when_reading_changes && reading == prev.reading {
            tracing::debug!(
                source_id = %source_id,
                meter = %reading_name,
                reading,
                "meter reading unchanged; not tracking"
            );
            return true;
        }

        let state = MeterState {
            date,
            value: curr,
            reading,
        };
        state.store(meta, reading_name);
        produced.insert(
            format!("{}_diff", meter.property_key),
            Value::Number(curr - prev.value),
        );
        produced.insert(format!("{reading_name}_diff"), Value::Number(reading_diff));
        tracing::debug!(
            source_id = %source_id,
            meter = %reading_name,
            prev_value = prev.value,
            value = curr,
            elapsed_ms,
            added = reading_diff,
            reading,
            "virtual meter advanced"
        );
        self.persist(source_id, reading_name, &state);
        true
    }
}

impl SampleFilter for VirtualMeterFilter {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn filter(&self, sample: &Arc<Sample>, params: &Parameters) -> Filtered {
        if !source_matches(self.source_pattern.as_ref(), &sample.source_id) {
            return Filtered::unchanged(sample);
        }
        if !self
            .meters
            .iter()
            .any(|m| sample.has_property(m.property_type, &m.property_key))
        {
            return Filtered::unchanged(sample);
        }

        let Some(meta) = self.source_metadata(&sample.source_id) else {
            return Filtered::unchanged(sample);
        };
        let mut meta = meta.lock();
        let mut out = (**sample).clone();
        let mut produced = Parameters::new();
        let mut changed = false;
        for meter in &self.meters {
            changed |= self.apply_meter(meter, sample, params, &mut meta, &mut out, &mut produced);
        }

        if changed {
            Filtered::changed(out).with_params(produced)
        } else {
            Filtered::unchanged(sample).with_params(produced)
        }
    }
}
