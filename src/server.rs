/// Runtime wiring and server setup
///
/// Wires together all components: system store, workflow registry, execution
/// engine, queue dispatcher, cron scheduler, and the admin HTTP surface.
/// Embedding applications build a RuntimeBuilder, register workflows and
/// queues, then launch; the launch sequence recovers this executor's own
/// pending work before any background loop starts.

use crate::{
    api::{create_admin_router, AdminState},
    config::Config,
    queue::{Queue, QueueSet},
    runtime::{CronSchedulerService, QueueDispatcher, ScheduledTrigger, WorkflowEngine},
    store::SystemStore,
    workflow::{RegisteredWorkflow, WorkflowContext, WorkflowFuture, WorkflowRegistry},
};
use anyhow::Result;
use axum::Router;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};

/// Startup-time registration of workflows, queues, and scheduled triggers.
///
/// Registration happens exactly once, before launch; the resulting maps are
/// immutable for the process lifetime.
pub struct RuntimeBuilder {
    config: Config,
    registry: Arc<WorkflowRegistry>,
    queues: QueueSet,
    triggers: Vec<ScheduledTrigger>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(WorkflowRegistry::new()),
            queues: QueueSet::new(),
            triggers: Vec::new(),
        }
    }

    /// Register a workflow body under a stable name. The returned opaque
    /// handle is what callers pass to `invoke`/`start`/`enqueue`.
    pub fn register<F>(&self, name: impl Into<String>, body: F) -> Result<RegisteredWorkflow>
    where
        F: Fn(WorkflowContext, Value) -> WorkflowFuture + Send + Sync + 'static,
    {
        self.registry.register(name, Arc::new(body))
    }

    /// Register a queue. Names must be unique and the per-worker share may
    /// not exceed the global cap.
    pub fn queue(&mut self, queue: Queue) -> Result<&mut Self> {
        queue.validate()?;
        if self.queues.contains_key(&queue.name) {
            anyhow::bail!("queue '{}' is already registered", queue.name);
        }
        self.queues.insert(queue.name.clone(), queue);
        Ok(self)
    }

    /// Fire a registered workflow on a cron schedule.
    pub fn schedule(
        &mut self,
        schedule: impl Into<String>,
        workflow: &RegisteredWorkflow,
        input: Value,
    ) -> &mut Self {
        self.triggers.push(ScheduledTrigger {
            schedule: schedule.into(),
            workflow: workflow.name().to_string(),
            input,
        });
        self
    }

    /// Open the system database, recover this executor's pending work, and
    /// start the background loops.
    pub async fn launch(self) -> Result<Runtime> {
        tracing::info!("🗄️ opening system database: {}", self.config.database.path);
        let store = SystemStore::connect(&self.config.database.path).await?;

        tracing::info!(
            "⚙️ initializing workflow engine (executor '{}', {} queue(s), {} workflow(s))",
            self.config.runtime.executor_id,
            self.queues.len(),
            self.registry.names().len()
        );
        let engine = WorkflowEngine::new(
            store,
            Arc::clone(&self.registry),
            Arc::new(self.queues),
            &self.config.runtime,
        );

        // Self-recovery must complete before the dispatcher starts, so a
        // crashed run cannot race its own re-admission.
        let recovered = engine
            .recover_pending(&[self.config.runtime.executor_id.clone()])
            .await?;
        if !recovered.is_empty() {
            tracing::info!("🔁 recovered {} pending workflow(s)", recovered.len());
        }

        tracing::info!("🚀 starting queue dispatcher");
        let dispatcher = QueueDispatcher::new(
            Arc::clone(&engine),
            Duration::from_millis(self.config.runtime.dispatch_interval_ms),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        tracing::info!("⏰ initializing cron scheduler service");
        let scheduler = Arc::new(CronSchedulerService::new(Arc::clone(&engine), self.triggers).await?);
        scheduler.start().await?;

        tracing::info!("✅ runtime launched");
        Ok(Runtime {
            config: self.config,
            engine,
            scheduler,
            dispatcher_handle,
        })
    }
}

/// A launched engine instance with its background loops and admin surface.
pub struct Runtime {
    config: Config,
    engine: Arc<WorkflowEngine>,
    scheduler: Arc<CronSchedulerService>,
    dispatcher_handle: JoinHandle<()>,
}

impl Runtime {
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The admin router, for embedding into an application's own server.
    pub fn admin_router(&self) -> Router {
        create_admin_router(AdminState {
            engine: Arc::clone(&self.engine),
            scheduler: Arc::clone(&self.scheduler),
        })
    }

    /// Serve the admin surface on the configured address until the process
    /// exits.
    pub async fn serve_admin(&self) -> Result<()> {
        let app = self.admin_router();
        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&bind_addr).await?;
        tracing::info!("📡 admin server listening on http://{}", bind_addr);
        axum::serve(listener, app.into_make_service()).await?;
        Ok(())
    }

    /// Cooperative shutdown: stop the background loops, leave in-flight
    /// executions to finish.
    pub async fn shutdown(self) {
        self.engine.deactivate();
        if let Err(err) = self.scheduler.stop().await {
            tracing::warn!("failed to stop the cron scheduler: {}", err);
        }
        if let Err(err) = self.dispatcher_handle.await {
            tracing::warn!("queue dispatcher task ended abnormally: {}", err);
        }
    }
}

/// Initialize logging, launch the runtime, and serve the admin surface.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Duraflow server...");

    let runtime = RuntimeBuilder::new(config).launch().await?;
    runtime.serve_admin().await
}
