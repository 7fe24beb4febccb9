/// Duraflow: durable workflow orchestration engine
///
/// Main entry point for the Duraflow server. Initializes configuration and
/// starts the runtime with its admin surface. Workflows, queues, and
/// scheduled triggers are registered by embedding applications through
/// `RuntimeBuilder`; this binary runs the bare control plane:
/// - Admin API at /healthz, /deactivate, /workflow-queues-metadata
/// - Workflow operations at /workflows/{id}/{cancel,resume,restart}
/// - Recovery at /workflow-recovery

use duraflow::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3005 and a SQLite system database)
    let config = Config::default();

    // Start the runtime and serve the admin surface
    start_server(config).await?;

    Ok(())
}
