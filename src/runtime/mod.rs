/// Runtime Execution Layer
///
/// This module provides the durable execution engine and its background
/// loops:
/// - The workflow engine (claim, run, terminal transition, control ops)
/// - The periodic queue dispatch loop with per-queue admission locks
/// - The cron trigger scheduler for scheduled workflow starts

// Durable execution engine and control-plane operations
pub mod engine;

// Periodic queue dispatch loop
pub mod dispatcher;

// Cron-scheduled workflow triggers
pub mod scheduler;

// Re-export main types
pub use dispatcher::QueueDispatcher;
pub use engine::{WorkflowEngine, WorkflowHandle};
pub use scheduler::{CronSchedulerService, ScheduledTrigger};
