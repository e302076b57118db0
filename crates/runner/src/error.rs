//! Error types for flow execution

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification recorded in sealed run metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SchemaError,
    PolicyViolation,
    NotFoundError,
    AmbiguityError,
    StabilityError,
    ActionError,
    GoalError,
    SealingError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaError => "SchemaError",
            ErrorKind::PolicyViolation => "PolicyViolation",
            ErrorKind::NotFoundError => "NotFoundError",
            ErrorKind::AmbiguityError => "AmbiguityError",
            ErrorKind::StabilityError => "StabilityError",
            ErrorKind::ActionError => "ActionError",
            ErrorKind::GoalError => "GoalError",
            ErrorKind::SealingError => "SealingError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that end a run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("Malformed plan: {0}")]
    Schema(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Selector '{selector}' matched no elements")]
    NotFound { selector: String },

    #[error("Selector '{selector}' is ambiguous: {count} elements matched")]
    Ambiguity { selector: String, count: usize },

    #[error("Selector '{selector}' failed relaxed resolution: {reason}")]
    Stability { selector: String, reason: String },

    #[error("Action '{action}' failed: {reason}")]
    Action { action: String, reason: String },

    #[error("Goal check failed: {0}")]
    Goal(String),

    #[error("Sealing failed: {0}")]
    Sealing(String),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Schema(_) => ErrorKind::SchemaError,
            FlowError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            FlowError::NotFound { .. } => ErrorKind::NotFoundError,
            FlowError::Ambiguity { .. } => ErrorKind::AmbiguityError,
            FlowError::Stability { .. } => ErrorKind::StabilityError,
            FlowError::Action { .. } => ErrorKind::ActionError,
            FlowError::Goal(_) => ErrorKind::GoalError,
            FlowError::Sealing(_) => ErrorKind::SealingError,
        }
    }

    /// Wrap a provider failure for the named action
    pub fn action(action: impl Into<String>, err: DriverError) -> Self {
        FlowError::Action {
            action: action.into(),
            reason: err.to_string(),
        }
    }
}

impl From<flowseal_common::Error> for FlowError {
    fn from(e: flowseal_common::Error) -> Self {
        FlowError::Sealing(e.to_string())
    }
}

/// Failures reported by a page driver
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Driver protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported by driver: {0}")]
    Unsupported(String),

    #[error("Driver session is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Infrastructure failures outside the run's own outcome
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Integrity(#[from] flowseal_common::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_serialize_by_name() {
        let json = serde_json::to_string(&ErrorKind::AmbiguityError).unwrap();
        assert_eq!(json, "\"AmbiguityError\"");
        assert_eq!(ErrorKind::AmbiguityError.to_string(), "AmbiguityError");
    }

    #[test]
    fn test_ambiguity_message_names_selector_and_count() {
        let err = FlowError::Ambiguity {
            selector: "button.buy".to_string(),
            count: 2,
        };
        assert_eq!(err.kind(), ErrorKind::AmbiguityError);
        assert!(err.to_string().contains("button.buy"));
        assert!(err.to_string().contains('2'));
    }

    #[test]
    fn test_driver_error_becomes_action_error() {
        let err = FlowError::action(
            "click",
            DriverError::Timeout {
                operation: "click".to_string(),
                timeout_ms: 500,
            },
        );
        assert_eq!(err.kind(), ErrorKind::ActionError);
        assert!(err.to_string().contains("500ms"));
    }
}
