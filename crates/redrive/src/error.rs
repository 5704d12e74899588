//! Error types for the runtime
//!
//! Errors that terminate a workflow are serialized into an [`ErrorEnvelope`]
//! and stored in the durable log, so a replay (or a handle in another
//! process) observes the same failure as the original run.

use serde::{Deserialize, Serialize};

use crate::appdb::AppDbError;
use crate::sysdb::SysDbError;

/// Serialized form of an error, stored as JSON in `output`/`error` columns.
///
/// Deserializing yields a neutral error value exposing the same fields;
/// the original type is not reconstructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    /// Error kind, e.g. `"RetriesExceeded"` or the application's own name
    pub name: String,

    /// Human-readable message
    pub message: String,

    /// Captured backtrace, if one was available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Underlying cause, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorEnvelope>>,
}

impl ErrorEnvelope {
    /// Create an envelope with just a name and message
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    /// Attach a cause
    pub fn with_cause(mut self, cause: ErrorEnvelope) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Serialize to the JSON string stored in the log
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"name\":\"SerializationFailure\",\"message\":{:?}}}",
                self.message
            )
        })
    }

    /// Rehydrate from a stored JSON string
    ///
    /// Unparseable payloads become an `Unknown` envelope carrying the raw
    /// text, never an error: a corrupt record must still surface.
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::new("Unknown", raw))
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorEnvelope {}

/// Errors raised by workflow execution
///
/// Step errors propagate to the workflow function as values of this type and
/// are recorded on termination; catching one inside a workflow does not erase
/// the operation record.
#[derive(Debug, thiserror::Error)]
pub enum RedriveError {
    /// Invalid request argument; reported to the caller, never recorded
    #[error("invalid argument: {0}")]
    UserDataValidation(String),

    /// Step or workflow name unknown; programming bug, raised synchronously
    #[error("{kind} \"{name}\" is not registered")]
    NotRegistered { kind: &'static str, name: String },

    /// A workflow id was reused with a divergent function or arguments
    #[error("conflicting start for workflow {workflow_id}: {details}")]
    WorkflowConflict {
        workflow_id: String,
        details: String,
    },

    /// Non-transactional step exhausted its retry budget
    #[error("step \"{step_name}\" exceeded {max_attempts} attempts; last error: {last_error}")]
    RetriesExceeded {
        step_name: String,
        max_attempts: u32,
        last_error: String,
    },

    /// External cancellation; the workflow status becomes CANCELLED
    #[error("workflow {0} was cancelled")]
    Cancelled(String),

    /// Replay mode found no recorded outcome for a step
    #[error("replay of workflow {workflow_id} found no recorded outcome for operation {function_id}")]
    Debugger {
        workflow_id: String,
        function_id: i32,
    },

    /// An event key was written more than once from the same workflow
    #[error("event \"{key}\" was already set by workflow {workflow_id}")]
    EventAlreadySet { workflow_id: String, key: String },

    /// Destination workflow of a `send` does not exist
    #[error("destination workflow {0} does not exist")]
    DestinationNotFound(String),

    /// System database failure; fatal to the executor
    #[error("system database error: {0}")]
    SystemDatabase(#[from] SysDbError),

    /// Application database failure, including serialization-retry exhaustion
    #[error("application database error: {0}")]
    AppDatabase(#[from] AppDbError),

    /// Payload could not be serialized or deserialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error raised by application code, or rehydrated from the log
    #[error(transparent)]
    Application(ErrorEnvelope),
}

impl RedriveError {
    /// Application error from a plain message
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(ErrorEnvelope::new(envelope_names::APPLICATION, message))
    }

    /// The envelope recorded for this error in the durable log
    pub fn to_envelope(&self) -> ErrorEnvelope {
        match self {
            Self::Application(envelope) => envelope.clone(),
            Self::RetriesExceeded { last_error, .. } => {
                ErrorEnvelope::new(envelope_names::RETRIES_EXCEEDED, self.to_string())
                    .with_cause(ErrorEnvelope::new(envelope_names::APPLICATION, last_error))
            }
            Self::WorkflowConflict { .. } => {
                ErrorEnvelope::new(envelope_names::WORKFLOW_CONFLICT, self.to_string())
            }
            Self::Cancelled(_) => ErrorEnvelope::new(envelope_names::CANCELLED, self.to_string()),
            Self::NotRegistered { .. } => {
                ErrorEnvelope::new(envelope_names::NOT_REGISTERED, self.to_string())
            }
            other => ErrorEnvelope::new(envelope_names::APPLICATION, other.to_string()),
        }
    }

    /// Whether this error means the workflow was cancelled rather than failed
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<anyhow::Error> for RedriveError {
    fn from(err: anyhow::Error) -> Self {
        let mut envelope = ErrorEnvelope::new(envelope_names::APPLICATION, err.to_string());
        if let Some(source) = err.source() {
            envelope = envelope.with_cause(ErrorEnvelope::new(
                envelope_names::APPLICATION,
                source.to_string(),
            ));
        }
        Self::Application(envelope)
    }
}

/// Well-known envelope names
pub mod envelope_names {
    pub const APPLICATION: &str = "ApplicationError";
    pub const RETRIES_EXCEEDED: &str = "RetriesExceeded";
    pub const WORKFLOW_CONFLICT: &str = "WorkflowConflict";
    pub const CANCELLED: &str = "Cancelled";
    pub const NOT_REGISTERED: &str = "NotRegistered";
    pub const FUNCTION_UNREGISTERED: &str = "function-unregistered";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = ErrorEnvelope::new("ApplicationError", "boom")
            .with_cause(ErrorEnvelope::new("IoError", "connection reset"));

        let json = envelope.to_json();
        let parsed = ErrorEnvelope::from_json(&json);

        assert_eq!(envelope, parsed);
        assert_eq!(parsed.cause.as_ref().unwrap().name, "IoError");
    }

    #[test]
    fn test_envelope_from_garbage() {
        let parsed = ErrorEnvelope::from_json("not json at all");
        assert_eq!(parsed.name, "Unknown");
        assert_eq!(parsed.message, "not json at all");
    }

    #[test]
    fn test_retries_exceeded_envelope() {
        let err = RedriveError::RetriesExceeded {
            step_name: "charge_card".to_string(),
            max_attempts: 3,
            last_error: "gateway timeout".to_string(),
        };

        let envelope = err.to_envelope();
        assert_eq!(envelope.name, envelope_names::RETRIES_EXCEEDED);
        assert_eq!(envelope.cause.unwrap().message, "gateway timeout");
    }

    #[test]
    fn test_cancelled_is_not_failure() {
        let err = RedriveError::Cancelled("wf-1".to_string());
        assert!(err.is_cancelled());
        assert!(!RedriveError::application("boom").is_cancelled());
    }
}
