//! Core data types shared by every stage of the extraction pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One repeated record on a page: field name → extracted value.
pub type Entity = serde_json::Map<String, Value>;

/// Whether a value counts as populated for support-rate purposes.
///
/// `null`, blank strings, empty arrays and empty objects are all empty.
/// Numbers and booleans always count, including `0` and `false`.
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Whether `entity` carries a populated value for `field`.
pub fn has_value(entity: &Entity, field: &str) -> bool {
    entity.get(field).map(is_present).unwrap_or(false)
}

/// Strict drops non-conforming entities; soft demotes weak fields instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    Strict,
    #[default]
    Soft,
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::Strict => write!(f, "strict"),
            ProcessingMode::Soft => write!(f, "soft"),
        }
    }
}

impl std::str::FromStr for ProcessingMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(ProcessingMode::Strict),
            "soft" => Ok(ProcessingMode::Soft),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown processing mode: {other}"
            ))),
        }
    }
}

/// Key under which learning statistics are aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskSignature {
    pub domain: String,
    pub target_type: String,
}

impl TaskSignature {
    pub fn new(domain: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            domain: domain.into().to_ascii_lowercase(),
            target_type: target_type.into().to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for TaskSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.domain, self.target_type)
    }
}

/// Failure scoped to a single field. Never leaves the evidence pass;
/// it is converted into a miss with reason `processing_error`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum FieldFailure {
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("strategy panicked: {0}")]
    Panicked(String),
}

/// Errors raised by the external AI-assisted capability.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("capability timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("capability failed: {0}")]
    Failed(String),

    #[error("no capability configured")]
    Unavailable,
}

/// Errors that can occur in the extraction pipeline.
///
/// Only batch- and plan-scoped failures surface here. Field failures and
/// contract incompatibilities are absorbed into result metadata.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(
        "strict mode dropped all {dropped_count} of {original_count} entities (required: {})",
        .required_fields.join(", ")
    )]
    StrictMode {
        dropped_count: usize,
        original_count: usize,
        required_fields: Vec<String>,
    },

    #[error("plan {plan_id} is not executable: {}", .recommendations.join("; "))]
    PlanInfeasible {
        plan_id: String,
        recommendations: Vec<String>,
    },

    #[error("external capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("contract error: {0}")]
    Contract(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Stable machine-readable code for callers and telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::StrictMode { .. } => "strict_mode_failure",
            PipelineError::PlanInfeasible { .. } => "plan_infeasible",
            PipelineError::Capability(_) => "external_capability_failure",
            PipelineError::Contract(_) => "contract_error",
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::Io(_) => "io_error",
            PipelineError::Json(_) => "json_error",
        }
    }
}

/// Convenience result type.
pub type PipelineResult<T> = Result<T, PipelineError>;
