use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use datum_client::{Sample, SampleType};
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use time::OffsetDateTime;

use super::{
    compile_expression, compile_optional_pattern, default_uid, resolve_expression_service,
    source_matches, FilterConfigError, FilterContext, Filtered, Parameters, SampleFilter,
};
use crate::expression::{sample_bindings, CompiledExpression};
use crate::opmodes::OperationalModes;

/// When the registry is told about an evaluation result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Every evaluation enables or disables its mode.
    #[default]
    Always,
    /// Only a result that differs from this filter's previous result for the
    /// mode reaches the registry. The first evaluation always does.
    OnChange,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModeExpressionConfig {
    pub expression: String,
    pub operational_mode: String,
    #[serde(default)]
    pub expire_seconds: Option<u64>,
    #[serde(default)]
    pub tagged_property_name: Option<String>,
    #[serde(default)]
    pub tagged_property_type: Option<SampleType>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationalModeConfig {
    #[serde(default = "default_uid")]
    pub uid: String,
    #[serde(default)]
    pub source_id_pattern: Option<String>,
    #[serde(default)]
    pub expression_service_id: Option<String>,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    #[serde(default)]
    pub modes: Vec<ModeExpressionConfig>,
}

struct Tagging {
    name: String,
    kind: SampleType,
}

impl Tagging {
    fn apply(&self, sample: &mut Sample, active: bool) {
        match self.kind {
            SampleType::Tag => {
                if active {
                    sample.tags.insert(self.name.clone());
                } else {
                    sample.tags.remove(&self.name);
                }
            }
            SampleType::Status => {
                sample
                    .status
                    .insert(self.name.clone(), active.to_string());
            }
            SampleType::Instantaneous | SampleType::Accumulating => {
                sample.put_numeric(self.kind, &self.name, if active { 1.0 } else { 0.0 });
            }
        }
    }
}

struct ModeRule {
    expression: String,
    compiled: Box<dyn CompiledExpression>,
    mode: String,
    expire_seconds: Option<u64>,
    tagging: Option<Tagging>,
}

/// Turns operational modes on or off from boolean expressions evaluated
/// against each sample, optionally recording the result on the sample.
pub struct OperationalModeFilter {
    uid: String,
    source_pattern: Option<Regex>,
    update_policy: UpdatePolicy,
    rules: Vec<ModeRule>,
    modes: Arc<dyn OperationalModes>,
    last_results: Mutex<HashMap<String, bool>>,
}

impl OperationalModeFilter {
    pub fn new(config: &OperationalModeConfig, ctx: &FilterContext) -> Result<Self, FilterConfigError> {
        let evaluator =
            resolve_expression_service(&ctx.expressions, config.expression_service_id.as_deref())?;
        let rules = config
            .modes
            .iter()
            .map(|m| {
                let mode = m.operational_mode.trim().to_lowercase();
                if mode.is_empty() {
                    return Err(FilterConfigError::Invalid(format!(
                        "operational mode name missing for expression `{}`",
                        m.expression
                    )));
                }
                if m.expression.trim().is_empty() {
                    return Err(FilterConfigError::Invalid(format!(
                        "expression missing for operational mode '{mode}'"
                    )));
                }
                let tagging = m
                    .tagged_property_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(|name| Tagging {
                        name: name.to_string(),
                        kind: m.tagged_property_type.unwrap_or(SampleType::Tag),
                    });
                Ok(ModeRule {
                    compiled: compile_expression(evaluator.as_ref(), &m.expression)?,
                    expression: m.expression.clone(),
                    mode,
                    expire_seconds: m.expire_seconds.filter(|s| *s > 0),
                    tagging,
                })
            })
            .collect::<Result<Vec<_>, FilterConfigError>>()?;

        Ok(Self {
            uid: config.uid.clone(),
            source_pattern: compile_optional_pattern(config.source_id_pattern.as_deref())?,
            update_policy: config.update_policy,
            rules,
            modes: ctx.modes.clone(),
            last_results: Mutex::new(HashMap::new()),
        })
    }

    fn should_notify(&self, mode: &str, active: bool) -> bool {
        let previous = self.last_results.lock().insert(mode.to_string(), active);
        match self.update_policy {
            UpdatePolicy::Always => true,
            UpdatePolicy::OnChange => previous != Some(active),
        }
    }

    fn notify(&self, rule: &ModeRule, active: bool) {
        let modes: BTreeSet<String> = [rule.mode.clone()].into_iter().collect();
        if active {
            let expire_at = rule
                .expire_seconds
                .map(|s| OffsetDateTime::now_utc() + time::Duration::seconds(s as i64));
            let now_active = self.modes.enable_operational_modes(&modes, expire_at);
            tracing::debug!(mode = %rule.mode, active = ?now_active, "operational mode enabled by expression");
        } else {
            let now_active = self.modes.disable_operational_modes(&modes);
            tracing::debug!(mode = %rule.mode, active = ?now_active, "operational mode disabled by expression");
        }
    }
}

impl SampleFilter for OperationalModeFilter {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn filter(&self, sample: &Arc<Sample>, params: &Parameters) -> Filtered {
        if self.rules.is_empty() || !source_matches(self.source_pattern.as_ref(), &sample.source_id) {
            return Filtered::unchanged(sample);
        }

        let mut bindings = params.clone();
        bindings.extend(sample_bindings(sample));

        let mut tagged: Option<Sample> = None;
        for rule in &self.rules {
            let active = match rule.compiled.evaluate(&bindings) {
                Ok(v) => match v.as_bool() {
                    Some(b) => b,
                    None => {
                        tracing::warn!(
                            source_id = %sample.source_id,
                            mode = %rule.mode,
                            expression = %rule.expression,
                            result = %v,
                            "operational mode expression did not produce a boolean"
                        );
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        source_id = %sample.source_id,
                        mode = %rule.mode,
                        expression = %rule.expression,
                        "operational mode expression failed"
                    );
                    continue;
                }
            };

            if self.should_notify(&rule.mode, active) {
                self.notify(rule, active);
            }
            if let Some(tagging) = &rule.tagging {
                let out = tagged.get_or_insert_with(|| (**sample).clone());
                tagging.apply(out, active);
            }
        }

        match tagged {
            Some(out) => Filtered::changed(out),
            None => Filtered::unchanged(sample),
        }
    }
}
