/// Status Store Layer
///
/// Transactional persistence for workflow status rows, step results, and
/// queue entries on top of SQLite. Every status transition, step write,
/// and queue-admission decision happens inside a transaction scoped to the
/// affected identifier or queue; conditional updates keyed on the expected
/// prior status give per-identifier total ordering without any global lock.

// Row-level types and the status state machine
pub mod types;

// The transactional system store
pub mod system;

// Re-export commonly used types
pub use system::SystemStore;
pub use types::{Claim, ListFilter, PendingWorkflow, ResumeAction, StatusRow, StepRecord, WorkflowStatus};
