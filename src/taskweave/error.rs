//! The closed error taxonomy for the engine.
//!
//! Infrastructure failures stay as errors; domain failures (a subtask that
//! failed) are data inside the workflow record, never exceptions. Every
//! variant carries a stable machine-readable code via [`EngineError::code`]
//! so HTTP responses and logs can be matched programmatically.

use std::error::Error;
use std::fmt;

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Every failure the engine can surface, with a stable code per variant.
///
/// # Example
///
/// ```rust
/// use taskweave::error::EngineError;
///
/// let err = EngineError::Validation("task text too long".into());
/// assert_eq!(err.code(), "validation_error");
/// assert_eq!(err.to_string(), "validation error: task text too long");
/// ```
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Request body rejected. HTTP 400; never retried.
    Validation(String),

    /// The inference backend did not answer within the request timeout.
    InferenceTimeout,

    /// The inference backend could not be reached at all.
    InferenceUnreachable(String),

    /// The inference backend answered with a non-2xx status.
    InferenceBackend { status: u16, message: String },

    /// Cyclic dependency or empty decomposition. HTTP 422; the workflow
    /// fails before any dispatch.
    Decomposition(String),

    /// Persona library fsync or parse failure. The orchestrator falls back
    /// to an in-memory persona for the current workflow only.
    PersonaStore(String),

    /// Workflow-memory disk failure. Logged and recovered — a workflow never
    /// fails because its record could not be persisted.
    Storage(String),

    /// Illegal state-machine transition. Always a bug; logged and re-raised.
    State(String),

    /// The caller cancelled the workflow.
    Cancelled,

    /// The per-workflow deadline elapsed; behaviour matches cancellation.
    WorkflowTimeout,
}

impl EngineError {
    /// Taxonomy name of this error kind, e.g. `InferenceUnreachable`. Used
    /// as the preserved failure reason on subtasks.
    pub fn kind_name(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::InferenceTimeout => "InferenceTimeout",
            EngineError::InferenceUnreachable(_) => "InferenceUnreachable",
            EngineError::InferenceBackend { .. } => "InferenceBackend",
            EngineError::Decomposition(_) => "DecompositionError",
            EngineError::PersonaStore(_) => "PersonaStoreError",
            EngineError::Storage(_) => "StorageError",
            EngineError::State(_) => "StateError",
            EngineError::Cancelled => "Cancelled",
            EngineError::WorkflowTimeout => "WorkflowTimeout",
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::InferenceTimeout => "inference_timeout",
            EngineError::InferenceUnreachable(_) => "inference_unreachable",
            EngineError::InferenceBackend { .. } => "inference_backend",
            EngineError::Decomposition(_) => "decomposition_error",
            EngineError::PersonaStore(_) => "persona_store_error",
            EngineError::Storage(_) => "storage_error",
            EngineError::State(_) => "state_error",
            EngineError::Cancelled => "cancelled",
            EngineError::WorkflowTimeout => "workflow_timeout",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {}", msg),
            EngineError::InferenceTimeout => write!(f, "inference request timed out"),
            EngineError::InferenceUnreachable(msg) => {
                write!(f, "inference backend unreachable: {}", msg)
            }
            EngineError::InferenceBackend { status, message } => {
                write!(f, "inference backend error (HTTP {}): {}", status, message)
            }
            EngineError::Decomposition(msg) => write!(f, "decomposition error: {}", msg),
            EngineError::PersonaStore(msg) => write!(f, "persona store error: {}", msg),
            EngineError::Storage(msg) => write!(f, "storage error: {}", msg),
            EngineError::State(msg) => write!(f, "illegal state transition: {}", msg),
            EngineError::Cancelled => write!(f, "workflow cancelled"),
            EngineError::WorkflowTimeout => write!(f, "workflow timed out"),
        }
    }
}

impl Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EngineError::InferenceTimeout.code(), "inference_timeout");
        assert_eq!(EngineError::Cancelled.code(), "cancelled");
        assert_eq!(
            EngineError::InferenceBackend {
                status: 500,
                message: "boom".into()
            }
            .code(),
            "inference_backend"
        );
    }
}
