/// Core status-store type definitions
///
/// Row-level types for the three system tables (workflow status, step
/// results, queue entries). Status rows are immutable values: transitions
/// produce a new row through a conditional UPDATE inside a transaction,
/// never by mutating a shared in-process object.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow execution.
///
/// `PENDING → (ENQUEUED) → SUCCESS | ERROR | CANCELLED | RETRIES_EXCEEDED`
///
/// A queued workflow waits as `PENDING` and runs as `ENQUEUED`; a directly
/// invoked workflow runs as `PENDING`. Terminal states are absorbing except
/// via the explicit control-plane `resume`/`restart` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Enqueued,
    Success,
    Error,
    Cancelled,
    RetriesExceeded,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Enqueued => "ENQUEUED",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
            Self::RetriesExceeded => "RETRIES_EXCEEDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "ENQUEUED" => Some(Self::Enqueued),
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            "CANCELLED" => Some(Self::Cancelled),
            "RETRIES_EXCEEDED" => Some(Self::RetriesExceeded),
            _ => None,
        }
    }

    /// True for statuses from which no further automatic transition occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Cancelled | Self::RetriesExceeded
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `workflow_status` table.
///
/// `input`, `output`, and `error` hold serialized JSON exactly as produced
/// by the codec; the store never interprets them. `output` and `error` are
/// mutually exclusive and each is written at most once.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub workflow_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub executor_id: Option<String>,
    pub queue_name: Option<String>,
    pub recovery_attempts: i64,
    /// Epoch milliseconds
    pub created_at: i64,
    /// Epoch milliseconds, non-decreasing
    pub updated_at: i64,
}

/// One row of the `step_results` table: the checkpointed outcome of a
/// side-effecting operation inside a workflow body, keyed by the ordinal
/// assigned at call time. Exactly one of `output`/`error` is set. Never
/// mutated once written; on a duplicate insert the first writer wins.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub workflow_id: String,
    pub step_id: i64,
    pub label: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// A non-terminal execution surfaced by the recovery scan.
#[derive(Debug, Clone)]
pub struct PendingWorkflow {
    pub workflow_id: String,
    pub queue_name: Option<String>,
}

/// Outcome of an ownership claim on a workflow identifier.
#[derive(Debug)]
pub enum Claim {
    /// The row is ours (fresh insert or re-claim by the same executor);
    /// the caller should run the body.
    Runnable { recovery_attempts: i64 },
    /// The row is already terminal; the caller must replay the persisted
    /// outcome without invoking the body.
    Finished(StatusRow),
}

/// How a resumed workflow gets back into execution.
#[derive(Debug)]
pub enum ResumeAction {
    /// The workflow belonged to a queue; it is waiting again and the
    /// dispatcher will re-admit it under the queue's limits.
    Requeued { queue_name: String },
    /// The workflow was directly invoked; the caller re-submits it to the
    /// execution engine.
    Direct,
}

/// Filter for the control-plane workflow listing.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<WorkflowStatus>,
    pub name: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Sort by creation time descending instead of ascending.
    pub sort_desc: bool,
}
