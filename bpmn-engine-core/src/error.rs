//! Error taxonomy for the engine.
//!
//! Structural misuse (running twice, resuming a running definition) is an
//! [`EngineError`]; failures raised while an activity executes are wrapped in
//! an [`ActivityError`] that remembers the element it came from.

use crate::authoring::validate::ValidationError;
use serde::{Deserialize, Serialize};

/// Delivery failure reported by the broker for mandatory error messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("undelivered message {routing_key} on exchange {exchange}")]
    Undelivered {
        exchange: String,
        routing_key: String,
    },
}

/// An execution error raised by an activity behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ActivityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source_id: None,
            code: None,
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("definition is already running")]
    AlreadyRunning,

    #[error("No executable process")]
    NoExecutableProcess,

    #[error("definition is stopped, resume it to continue")]
    Stopped,

    #[error("cannot recover running definition")]
    CannotRecoverRunning,

    #[error("cannot resume running definition")]
    CannotResumeRunning,

    #[error("Definition is not running")]
    NotRunning,

    #[error("cannot recover running process {0}")]
    CannotRecoverRunningProcess(String),

    #[error("wait for {0} was abandoned")]
    WaitAbandoned(String),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("invalid definition: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<ValidationError>),

    #[error("failed to parse definition: {0}")]
    Parse(String),
}

impl EngineError {
    /// The wrapped activity error, if this is an execution failure.
    pub fn as_activity_error(&self) -> Option<&ActivityError> {
        match self {
            EngineError::Activity(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_render_stable_messages() {
        assert_eq!(
            EngineError::AlreadyRunning.to_string(),
            "definition is already running"
        );
        assert_eq!(
            EngineError::CannotRecoverRunning.to_string(),
            "cannot recover running definition"
        );
        assert_eq!(
            EngineError::CannotResumeRunning.to_string(),
            "cannot resume running definition"
        );
        assert_eq!(EngineError::NotRunning.to_string(), "Definition is not running");
    }

    #[test]
    fn activity_error_is_transparent() {
        let err: EngineError = ActivityError::new("unstable").with_source("task").into();
        assert_eq!(err.to_string(), "unstable");
        assert_eq!(
            err.as_activity_error().and_then(|e| e.source_id.as_deref()),
            Some("task")
        );
    }

    #[test]
    fn invalid_definition_lists_rules() {
        let err = EngineError::Invalid(vec![
            ValidationError {
                rule: "V1".to_string(),
                message: "Duplicate element id: a".to_string(),
            },
            ValidationError {
                rule: "V5".to_string(),
                message: "No process found".to_string(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "invalid definition: [V1] Duplicate element id: a; [V5] No process found"
        );
    }
}
