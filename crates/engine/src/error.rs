//! Engine error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single schema or request validation problem.
///
/// Serialized as `{msg, loc, type}` in `input_validation_error` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Human readable message.
    pub msg: String,

    /// Location of the offending value, outermost first.
    pub loc: Vec<String>,

    /// Machine readable error kind.
    #[serde(rename = "type")]
    pub error_type: String,
}

impl ValidationIssue {
    /// Create a new validation issue.
    pub fn new(msg: impl Into<String>, loc: Vec<String>, error_type: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            loc,
            error_type: error_type.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.loc.is_empty() {
            write!(f, "{}", self.msg)
        } else {
            write!(f, "{}: {}", self.loc.join("."), self.msg)
        }
    }
}

/// Errors that can occur while validating or executing a workflow.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed request or workflow. Never retried.
    #[error("Validation error: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// Action archive could not be fetched from any ref.
    #[error("Download error for {reference}: {message}")]
    Download { reference: String, message: String },

    /// Step exited non-zero or otherwise failed at runtime.
    #[error("Step failed: {message}")]
    StepExecution {
        message: String,
        console_output: String,
    },

    /// Step shape or action type not supported.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Malformed `${{ }}` expression.
    #[error("Expression error: {0}")]
    Expression(String),

    /// Action manifest missing or unreadable.
    #[error("Action manifest error: {0}")]
    Manifest(String),

    /// Run was cancelled while a step was in flight.
    #[error("Run cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Shorthand for a single-issue validation error.
    pub fn validation(msg: impl Into<String>, loc: Vec<String>) -> Self {
        EngineError::Validation(vec![ValidationIssue::new(msg, loc, "value_error")])
    }

    /// Captured console output for step failures, empty otherwise.
    pub fn console_output(&self) -> &str {
        match self {
            EngineError::StepExecution { console_output, .. } => console_output,
            _ => "",
        }
    }

    /// Whether this error denotes an unsupported step shape rather than a
    /// runtime failure.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, EngineError::NotImplemented(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(e: serde_yaml::Error) -> Self {
        EngineError::Yaml(e.to_string())
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(e: zip::result::ZipError) -> Self {
        EngineError::Io(format!("zip: {}", e))
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
