/// Engine error taxonomy
///
/// Typed failures shared by the status store, the execution engine, and the
/// control-plane operations. Control-plane handlers map these onto HTTP
/// status codes; library callers match on them directly.

use serde::{Deserialize, Serialize};

use crate::store::types::WorkflowStatus;

/// Serialized failure payload persisted in a workflow's `error` column and
/// in failed step records. Kept deliberately small: the message is what an
/// operator inspects before deciding to `resume` or `restart`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Capture a workflow body failure, preserving the error chain.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self { message: format!("{err:#}") }
    }
}

/// Errors surfaced by the durable-execution subsystem.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The identifier is already owned by a concurrent in-flight execution.
    #[error("workflow {0} is already owned by an in-flight execution")]
    DuplicateExecution(String),

    /// The identifier was already bound to a different workflow function.
    #[error("workflow {id} is registered to {existing}, not {requested}")]
    ConflictingName {
        id: String,
        existing: String,
        requested: String,
    },

    /// The operation targets an identifier with no status row.
    #[error("workflow {0} not found")]
    NotFound(String),

    /// The operation is not valid for the execution's current status.
    #[error("operation not valid while workflow {id} is {status}")]
    InvalidState { id: String, status: WorkflowStatus },

    /// Recovery or invocation found a workflow name with no implementation
    /// bound in this process.
    #[error("no workflow named '{0}' is registered in this process")]
    NotRegistered(String),

    /// The target queue was never registered at startup.
    #[error("no queue named '{0}' is registered in this process")]
    UnknownQueue(String),

    /// The workflow body raised; the payload is persisted on the status row
    /// and re-raised to the synchronous caller.
    #[error("workflow {id} failed: {error}")]
    Body { id: String, error: ErrorPayload },

    /// The execution was cancelled by another actor; the body aborted at a
    /// step boundary.
    #[error("workflow {0} was cancelled")]
    Cancelled(String),

    /// The workflow was claimed more times than the configured maximum and
    /// has been dead-lettered.
    #[error("workflow {id} exceeded {max_attempts} recovery attempts")]
    RetriesExceeded { id: String, max_attempts: u32 },

    /// Debug replay hit a step with no recorded result. The original run
    /// and the replay disagree on the step sequence.
    #[error("workflow {id} has no recorded result for step {step_id} ({label})")]
    MissingStepResult {
        id: String,
        step_id: i64,
        label: String,
    },

    /// Transactional storage failure that survived bounded retries.
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    /// Input/output/error payload could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
