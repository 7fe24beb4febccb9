/// HTTP API Layer
///
/// Control-plane endpoints for operating the engine: health, deactivate,
/// queue metadata, recovery, and per-workflow cancel / resume / restart.
/// The transport is an external collaborator; this layer only binds the
/// engine's operations to routes.

// Admin/control-plane endpoints
pub mod admin;

// Re-export router builder
pub use admin::{create_admin_router, AdminState};
