/// Workflow Layer
///
/// Registration and in-body execution surface:
/// - The process-wide name → body registry consulted by the engine and
///   by recovery
/// - The WorkflowContext handed to bodies, with step checkpointing and
///   durable sleep

// Process-wide workflow function registry
pub mod registry;

// Per-execution context with step checkpointing
pub mod context;

// Re-export commonly used types
pub use context::WorkflowContext;
pub use registry::{RegisteredWorkflow, WorkflowFn, WorkflowFuture, WorkflowRegistry};
