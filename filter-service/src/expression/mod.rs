//! Expression evaluation capability.
//!
//! Filters never embed an expression language. They hold an
//! `Arc<dyn ExpressionService>` resolved by id from an `ExpressionServices`
//! registry at construction time, compile their expressions once, and
//! evaluate the compiled form against each sample's bindings.

pub mod simple;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use datum_client::Sample;

pub use simple::SimpleExpressionService;

/// An expression operand or result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(_) | Value::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(_) | Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Named variables visible to an expression.
pub type Bindings = BTreeMap<String, Value>;

/// Bindings for every property of `sample`, plus `sourceId`.
///
/// Instantaneous values win over accumulating values of the same name, and
/// both win over status values.
pub fn sample_bindings(sample: &Sample) -> Bindings {
    let mut b = Bindings::new();
    for (k, v) in &sample.status {
        b.insert(k.clone(), Value::Text(v.clone()));
    }
    for (k, v) in &sample.accumulating {
        b.insert(k.clone(), Value::Number(*v));
    }
    for (k, v) in &sample.instantaneous {
        b.insert(k.clone(), Value::Number(*v));
    }
    b.insert("sourceId".to_string(), Value::Text(sample.source_id.clone()));
    b
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error at offset {offset}: {reason}")]
    Syntax { offset: usize, reason: String },
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("type error: {0}")]
    Type(String),
}

/// An expression parsed by its service, ready to evaluate repeatedly.
pub trait CompiledExpression: Send + Sync {
    fn evaluate(&self, bindings: &Bindings) -> Result<Value, ExpressionError>;
}

pub trait ExpressionService: Send + Sync {
    /// Identifier configurations use to pick this service.
    fn id(&self) -> &str;

    /// Parse `expression`. Syntax errors are reported here rather than on
    /// evaluation.
    fn compile(&self, expression: &str) -> Result<Box<dyn CompiledExpression>, ExpressionError>;

    /// Compile and evaluate in one step.
    fn evaluate(&self, expression: &str, bindings: &Bindings) -> Result<Value, ExpressionError> {
        self.compile(expression)?.evaluate(bindings)
    }
}

/// Expression services available to filters, keyed by id.
#[derive(Default, Clone)]
pub struct ExpressionServices {
    services: HashMap<String, Arc<dyn ExpressionService>>,
    default_id: Option<String>,
}

impl ExpressionServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding only the built-in `SimpleExpressionService`.
    pub fn with_builtin() -> Self {
        let mut services = Self::new();
        services.register(Arc::new(SimpleExpressionService));
        services
    }

    /// Register `service`. The first registered service becomes the default
    /// used when a configuration names no service id.
    pub fn register(&mut self, service: Arc<dyn ExpressionService>) {
        let id = service.id().to_string();
        if self.default_id.is_none() {
            self.default_id = Some(id.clone());
        }
        self.services.insert(id, service);
    }

    pub fn get(&self, id: Option<&str>) -> Option<Arc<dyn ExpressionService>> {
        let id = match id {
            Some(id) if !id.trim().is_empty() => id.trim(),
            _ => self.default_id.as_deref()?,
        };
        self.services.get(id).cloned()
    }
}
