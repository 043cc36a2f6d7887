//! Sample filters and the chain that runs them.
//!
//! A filter looks at one sample and returns a `Filtered`: the same `Arc` when
//! it made no change, a new sample when it did, or nothing to drop the
//! reading. Filters may also hand back auxiliary values (`Parameters`) that
//! the chain passes on to every later filter.

pub mod downsample;
pub mod opmode;
pub mod property;
pub mod rolling;
pub mod throttle;
pub mod virtual_meter;

use std::collections::BTreeMap;
use std::sync::Arc;

use datum_client::{MetadataStore, Sample};
use regex::{Regex, RegexBuilder};

use crate::expression::{
    CompiledExpression, ExpressionError, ExpressionService, ExpressionServices, Value,
};
use crate::opmodes::OperationalModes;
use crate::settings_cache::SettingCache;

pub use downsample::{DownsampleConfig, DownsampleFilter};
pub use opmode::{OperationalModeConfig, OperationalModeFilter, UpdatePolicy};
pub use property::{PropertyPatternConfig, PropertyPatternFilter};
pub use rolling::RollingWindow;
pub use throttle::{SourceThrottleConfig, SourceThrottlingFilter};
pub use virtual_meter::{VirtualMeterConfig, VirtualMeterFilter, VirtualMeterFilterConfig};

/// Auxiliary values computed by filters, keyed by name.
pub type Parameters = BTreeMap<String, Value>;

/// The outcome of one filter call.
#[derive(Debug, Clone, Default)]
pub struct Filtered {
    /// `None` means "drop this reading".
    pub sample: Option<Arc<Sample>>,
    pub params: Parameters,
}

impl Filtered {
    /// Pass `sample` through as is, keeping its identity.
    pub fn unchanged(sample: &Arc<Sample>) -> Self {
        Self {
            sample: Some(Arc::clone(sample)),
            params: Parameters::new(),
        }
    }

    pub fn changed(sample: Sample) -> Self {
        Self {
            sample: Some(Arc::new(sample)),
            params: Parameters::new(),
        }
    }

    pub fn dropped() -> Self {
        Self::default()
    }

    pub fn with_params(mut self, params: Parameters) -> Self {
        self.params = params;
        self
    }

    pub fn is_dropped(&self) -> bool {
        self.sample.is_none()
    }

    /// True when the result is the very same allocation as `input`.
    pub fn is_unchanged_from(&self, input: &Arc<Sample>) -> bool {
        self.sample.as_ref().is_some_and(|s| Arc::ptr_eq(s, input))
    }
}

pub trait SampleFilter: Send + Sync {
    /// Instance identifier, also the prefix of the filter's setting key.
    fn uid(&self) -> &str;

    /// Decide on `sample`. `params` holds what earlier filters in the chain
    /// produced for this reading.
    fn filter(&self, sample: &Arc<Sample>, params: &Parameters) -> Filtered;
}

#[derive(thiserror::Error, Debug)]
pub enum FilterConfigError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown expression service '{0}'")]
    UnknownExpressionService(String),
    #[error("invalid expression `{expression}`: {source}")]
    InvalidExpression {
        expression: String,
        #[source]
        source: ExpressionError,
    },
    #[error("invalid filter configuration: {0}")]
    Invalid(String),
}

/// Compile a case-insensitive pattern that matches anywhere in its subject.
pub fn compile_pattern(pattern: &str) -> Result<Regex, FilterConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| FilterConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Like `compile_pattern`, with a missing or blank pattern meaning "any".
pub fn compile_optional_pattern(pattern: Option<&str>) -> Result<Option<Regex>, FilterConfigError> {
    match pattern.map(str::trim) {
        Some(p) if !p.is_empty() => compile_pattern(p).map(Some),
        _ => Ok(None),
    }
}

pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, FilterConfigError> {
    patterns.iter().map(|p| compile_pattern(p)).collect()
}

pub(crate) fn source_matches(pattern: Option<&Regex>, source_id: &str) -> bool {
    pattern.map_or(true, |re| re.is_match(source_id))
}

pub(crate) fn resolve_expression_service(
    services: &ExpressionServices,
    id: Option<&str>,
) -> Result<Arc<dyn ExpressionService>, FilterConfigError> {
    services.get(id).ok_or_else(|| {
        FilterConfigError::UnknownExpressionService(id.unwrap_or("<default>").to_string())
    })
}

pub(crate) fn compile_expression(
    service: &dyn ExpressionService,
    expression: &str,
) -> Result<Box<dyn CompiledExpression>, FilterConfigError> {
    service
        .compile(expression)
        .map_err(|source| FilterConfigError::InvalidExpression {
            expression: expression.to_string(),
            source,
        })
}

/// Round half away from zero to `scale` decimal places.
pub(crate) fn round_to(v: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    (v * factor).round() / factor
}

/// The setting key a filter instance stores its timestamps under.
pub fn setting_key(uid: &str) -> String {
    format!("{uid}/valueCaptured")
}

pub(crate) fn default_uid() -> String {
    "Default".to_string()
}

/// Open unless a required operational mode is configured and inactive.
#[derive(Clone)]
pub struct ModeGate {
    mode: Option<String>,
    modes: Arc<dyn OperationalModes>,
}

impl ModeGate {
    pub fn new(mode: Option<&str>, modes: Arc<dyn OperationalModes>) -> Self {
        let mode = mode.map(str::trim).filter(|m| !m.is_empty()).map(str::to_string);
        Self { mode, modes }
    }

    pub fn is_open(&self) -> bool {
        match &self.mode {
            Some(mode) => self.modes.is_operational_mode_active(mode),
            None => true,
        }
    }

    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }
}

/// Collaborators shared by every filter of a chain.
#[derive(Clone)]
pub struct FilterContext {
    pub settings: Arc<SettingCache>,
    pub metadata: Arc<dyn MetadataStore>,
    pub expressions: ExpressionServices,
    pub modes: Arc<dyn OperationalModes>,
}

/// An ordered list of filters. A dropped result stops the chain.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn SampleFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn SampleFilter>>) -> Self {
        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run `sample` through every filter in order. The returned params hold
    /// everything the filters produced, later values replacing earlier ones.
    pub fn apply(&self, sample: Arc<Sample>) -> Filtered {
        let mut params = Parameters::new();
        let mut current = sample;

        for f in &self.filters {
            metrics::counter!("sample_filter_input_total", "filter" => f.uid().to_string())
                .increment(1);
            let Filtered {
                sample: next,
                params: extra,
            } = f.filter(&current, &params);
            params.extend(extra);

            match next {
                None => {
                    metrics::counter!("sample_filter_dropped_total", "filter" => f.uid().to_string())
                        .increment(1);
                    tracing::trace!(
                        filter = %f.uid(),
                        source_id = %current.source_id,
                        "sample dropped"
                    );
                    return Filtered {
                        sample: None,
                        params,
                    };
                }
                Some(next) => {
                    if !Arc::ptr_eq(&next, &current) {
                        metrics::counter!("sample_filter_changed_total", "filter" => f.uid().to_string())
                            .increment(1);
                    }
                    current = next;
                }
            }
        }

        Filtered {
            sample: Some(current),
            params,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::opmodes::OperationalModeRegistry;
    use datum_client::store::{InMemoryMetadataStore, InMemorySettingStore};
    use time::macros::datetime;

    /// Context over fresh in-memory stores, returned alongside them.
    pub(crate) struct TestContext {
        pub ctx: FilterContext,
        pub settings: Arc<InMemorySettingStore>,
        pub metadata: Arc<InMemoryMetadataStore>,
        pub modes: Arc<OperationalModeRegistry>,
    }

    pub(crate) fn test_context() -> TestContext {
        let settings = Arc::new(InMemorySettingStore::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let modes = Arc::new(OperationalModeRegistry::new());
        let ctx = FilterContext {
            settings: Arc::new(SettingCache::new(settings.clone())),
            metadata: metadata.clone(),
            expressions: ExpressionServices::with_builtin(),
            modes: modes.clone(),
        };
        TestContext {
            ctx,
            settings,
            metadata,
            modes,
        }
    }

    struct Fixed {
        uid: &'static str,
        outcome: fn(&Arc<Sample>) -> Filtered,
    }

    impl SampleFilter for Fixed {
        fn uid(&self) -> &str {
            self.uid
        }

        fn filter(&self, sample: &Arc<Sample>, _params: &Parameters) -> Filtered {
            (self.outcome)(sample)
        }
    }

    fn sample() -> Arc<Sample> {
        Arc::new(Sample::new("meter-1", datetime!(2024-01-01 00:00:00 UTC)).with_instantaneous("watts", 1.0))
    }

    #[test]
    fn empty_chain_keeps_identity() {
        let s = sample();
        let out = FilterChain::default().apply(s.clone());
        assert!(out.is_unchanged_from(&s));
        assert!(out.params.is_empty());
    }

    #[test]
    fn drop_short_circuits_remaining_filters() {
        fn panics(_: &Arc<Sample>) -> Filtered {
            panic!("filter after a drop must not run")
        }
        let chain = FilterChain::new(vec![
            Arc::new(Fixed { uid: "a", outcome: |_| Filtered::dropped() }),
            Arc::new(Fixed { uid: "b", outcome: panics }),
        ]);
        assert!(chain.apply(sample()).is_dropped());
    }

    #[test]
    fn changed_samples_and_params_flow_downstream() {
        fn double(s: &Arc<Sample>) -> Filtered {
            let mut next = (**s).clone();
            next.put_numeric(datum_client::SampleType::Instantaneous, "watts", 2.0);
            let mut p = Parameters::new();
            p.insert("watts_diff".into(), Value::Number(1.0));
            Filtered::changed(next).with_params(p)
        }
        let chain = FilterChain::new(vec![
            Arc::new(Fixed { uid: "a", outcome: double }),
            Arc::new(Fixed { uid: "b", outcome: |s| Filtered::unchanged(s) }),
        ]);
        let input = sample();
        let out = chain.apply(input.clone());
        assert!(!out.is_unchanged_from(&input));
        let s = out.sample.unwrap();
        assert_eq!(s.instantaneous.get("watts"), Some(&2.0));
        assert_eq!(out.params.get("watts_diff"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn patterns_are_case_insensitive_and_unanchored() {
        let re = compile_pattern("^watt").unwrap();
        assert!(re.is_match("WattHours"));
        let re = compile_pattern("hour").unwrap();
        assert!(re.is_match("wattHours"));
        assert!(compile_optional_pattern(Some("  ")).unwrap().is_none());
        assert!(matches!(
            compile_pattern("(unclosed"),
            Err(FilterConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn mode_gate_follows_registry() {
        let t = test_context();
        let gate = ModeGate::new(Some("Hot"), t.ctx.modes.clone());
        assert!(!gate.is_open());
        t.modes
            .enable_operational_modes(&["hot".to_string()].into_iter().collect(), None);
        assert!(gate.is_open());
        assert!(ModeGate::new(None, t.ctx.modes.clone()).is_open());
    }
}
