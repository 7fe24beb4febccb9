/// Durable workflow execution engine
///
/// Wraps registered workflow bodies with the status state machine: claims
/// the identifier, runs the body with a checkpointing context, and makes
/// exactly one terminal transition per outcome. Re-invoking a finished
/// identifier replays the persisted result without touching the body;
/// re-invoking an in-flight one either fails fast (in-process duplicate)
/// or resumes it (crash recovery, same executor).
///
/// Also hosts the control-plane operations (cancel / resume / restart /
/// recover) consumed by the admin HTTP layer.

use serde_json::Value;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{EngineError, EngineResult, ErrorPayload};
use crate::queue::{QueueMetadata, QueueSet};
use crate::store::{
    Claim, ListFilter, PendingWorkflow, ResumeAction, StatusRow, SystemStore, WorkflowStatus,
};
use crate::workflow::{RegisteredWorkflow, WorkflowContext, WorkflowRegistry};

/// Decode a terminal status row into the caller-visible outcome.
fn terminal_row_to_result(row: StatusRow, max_attempts: u32) -> EngineResult<Value> {
    match row.status {
        WorkflowStatus::Success => {
            Ok(serde_json::from_str(row.output.as_deref().unwrap_or("null"))?)
        }
        WorkflowStatus::Error => {
            let error = row
                .error
                .as_deref()
                .and_then(|raw| serde_json::from_str::<ErrorPayload>(raw).ok())
                .unwrap_or_else(|| {
                    ErrorPayload::new("workflow failed with an unreadable error record")
                });
            Err(EngineError::Body {
                id: row.workflow_id,
                error,
            })
        }
        WorkflowStatus::Cancelled => Err(EngineError::Cancelled(row.workflow_id)),
        WorkflowStatus::RetriesExceeded => Err(EngineError::RetriesExceeded {
            id: row.workflow_id,
            max_attempts,
        }),
        status => Err(EngineError::InvalidState {
            id: row.workflow_id,
            status,
        }),
    }
}

/// Await-able reference to a workflow execution. `result` polls the status
/// row to a terminal state and decodes the persisted outcome, so a handle
/// works for executions owned by this process and for ones running (or
/// waiting) elsewhere.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    workflow_id: String,
    store: SystemStore,
    poll_interval: Duration,
    max_recovery_attempts: u32,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub async fn status(&self) -> EngineResult<Option<WorkflowStatus>> {
        Ok(self
            .store
            .get_status(&self.workflow_id)
            .await?
            .map(|row| row.status))
    }

    /// Block until the execution reaches a terminal state, then return its
    /// output or re-raise its persisted failure.
    pub async fn result(&self) -> EngineResult<Value> {
        loop {
            if let Some(row) = self.store.get_status(&self.workflow_id).await? {
                if row.status.is_terminal() {
                    return terminal_row_to_result(row, self.max_recovery_attempts);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// RAII membership in the in-process active-identifier set. Two concurrent
/// local callers of one identifier observe a single winner; the loser gets
/// DuplicateExecution without ever reaching the store.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    workflow_id: String,
}

impl<'a> ActiveGuard<'a> {
    fn acquire(active: &'a Mutex<HashSet<String>>, workflow_id: &str) -> EngineResult<Self> {
        let mut set = active.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(workflow_id.to_string()) {
            return Err(EngineError::DuplicateExecution(workflow_id.to_string()));
        }
        Ok(Self {
            active,
            workflow_id: workflow_id.to_string(),
        })
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.active.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.workflow_id);
    }
}

/// The durable execution engine. One instance per process, shared behind
/// an Arc by the dispatcher, the scheduler, and the admin layer.
pub struct WorkflowEngine {
    store: SystemStore,
    registry: Arc<WorkflowRegistry>,
    queues: Arc<QueueSet>,
    executor_id: String,
    max_recovery_attempts: u32,
    result_poll_interval: Duration,
    active: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
    self_ref: Weak<Self>,
}

impl WorkflowEngine {
    pub fn new(
        store: SystemStore,
        registry: Arc<WorkflowRegistry>,
        queues: Arc<QueueSet>,
        runtime: &RuntimeConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            store,
            registry,
            queues,
            executor_id: runtime.executor_id.clone(),
            max_recovery_attempts: runtime.max_recovery_attempts,
            result_poll_interval: Duration::from_millis(runtime.result_poll_interval_ms),
            active: Mutex::new(HashSet::new()),
            shutdown,
            self_ref: self_ref.clone(),
        })
    }

    /// The engine is only ever constructed inside an Arc, so while &self
    /// exists the upgrade cannot fail.
    fn strong_self(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("engine dropped while in use")
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub(crate) fn store(&self) -> &SystemStore {
        &self.store
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn queue_metadata(&self) -> Vec<QueueMetadata> {
        let mut metadata: Vec<QueueMetadata> =
            self.queues.values().map(|queue| queue.metadata()).collect();
        metadata.sort_by(|a, b| a.name.cmp(&b.name));
        metadata
    }

    /// Subscribe to the cooperative shutdown signal observed by the
    /// background loops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop accepting new work (queue dispatch, scheduled triggers) without
    /// aborting in-flight executions.
    pub fn deactivate(&self) {
        if !*self.shutdown.borrow() {
            tracing::info!("deactivating: background loops will stop accepting new work");
        }
        self.shutdown.send_replace(true);
    }

    pub fn is_deactivated(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Execute a registered workflow under `workflow_id` (generated when
    /// absent) and return its result synchronously. Idempotent per
    /// identifier: a finished identifier replays its persisted outcome.
    pub async fn invoke(
        &self,
        workflow: &RegisteredWorkflow,
        workflow_id: Option<String>,
        input: Value,
    ) -> EngineResult<Value> {
        let workflow_id = workflow_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.run_workflow(&workflow_id, workflow.name(), input, None)
            .await
    }

    /// Start a registered workflow in the background and return a handle.
    pub fn start(
        &self,
        workflow: &RegisteredWorkflow,
        workflow_id: Option<String>,
        input: Value,
    ) -> WorkflowHandle {
        let workflow_id = workflow_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.start_detached(workflow.name(), workflow_id.clone(), input);
        self.retrieve(&workflow_id)
    }

    /// Spawn a run without waiting on it; failures are logged, the status
    /// row carries the outcome for any handle that cares.
    pub(crate) fn start_detached(&self, name: &str, workflow_id: String, input: Value) {
        let engine = self.strong_self();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine.run_workflow(&workflow_id, &name, input, None).await {
                tracing::debug!("background workflow {} finished: {}", workflow_id, err);
            }
        });
    }

    /// Submit a workflow through a registered queue. The status row is
    /// created waiting (`PENDING`); execution is deferred to the dispatch
    /// loop. Idempotent per identifier.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        workflow: &RegisteredWorkflow,
        workflow_id: Option<String>,
        input: Value,
    ) -> EngineResult<WorkflowHandle> {
        if !self.queues.contains_key(queue_name) {
            return Err(EngineError::UnknownQueue(queue_name.to_string()));
        }
        let workflow_id = workflow_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let input_json = serde_json::to_string(&input)?;
        self.store
            .enqueue(&workflow_id, workflow.name(), Some(&input_json), queue_name)
            .await?;
        tracing::debug!("enqueued workflow {} on queue {}", workflow_id, queue_name);
        Ok(self.retrieve(&workflow_id))
    }

    /// Handle to an existing (or expected) execution without claiming it.
    pub fn retrieve(&self, workflow_id: &str) -> WorkflowHandle {
        WorkflowHandle {
            workflow_id: workflow_id.to_string(),
            store: self.store.clone(),
            poll_interval: self.result_poll_interval,
            max_recovery_attempts: self.max_recovery_attempts,
        }
    }

    /// Re-execute a persisted workflow from its stored name and input.
    /// Used by the dispatcher (after admission), recovery, and resume.
    pub async fn execute_by_id(&self, workflow_id: &str) -> EngineResult<Value> {
        let row = self
            .store
            .get_status(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        if row.status.is_terminal() {
            return terminal_row_to_result(row, self.max_recovery_attempts);
        }
        let input: Value = match row.input.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Value::Null,
        };
        self.run_workflow(workflow_id, &row.name, input, row.queue_name.as_deref())
            .await
    }

    /// Claim → run body → exactly one terminal transition.
    async fn run_workflow(
        &self,
        workflow_id: &str,
        name: &str,
        input: Value,
        queue_name: Option<&str>,
    ) -> EngineResult<Value> {
        let body = self
            .registry
            .resolve(name)
            .ok_or_else(|| EngineError::NotRegistered(name.to_string()))?;

        let _guard = ActiveGuard::acquire(&self.active, workflow_id)?;

        let input_json = serde_json::to_string(&input)?;
        let claim = self
            .store
            .claim_workflow(
                workflow_id,
                name,
                Some(&input_json),
                &self.executor_id,
                queue_name,
                self.max_recovery_attempts,
            )
            .await?;

        match claim {
            Claim::Finished(row) => {
                tracing::debug!(
                    "workflow {} already finished as {}; replaying its outcome",
                    workflow_id,
                    row.status
                );
                return terminal_row_to_result(row, self.max_recovery_attempts);
            }
            Claim::Runnable { recovery_attempts } => {
                if recovery_attempts > 1 {
                    tracing::info!(
                        "re-executing workflow {} (attempt {})",
                        workflow_id,
                        recovery_attempts
                    );
                } else {
                    tracing::info!("executing workflow {} ({})", workflow_id, name);
                }
            }
        }

        let ctx = WorkflowContext::durable(workflow_id.to_string(), self.store.clone());
        let outcome = body.call(ctx, input).await;

        let result = match outcome {
            Ok(output) => {
                let output_json = serde_json::to_string(&output)?;
                if self.store.finalize_success(workflow_id, &output_json).await? {
                    tracing::info!("workflow {} succeeded", workflow_id);
                    Ok(output)
                } else {
                    // Another actor made the terminal transition (cancel).
                    self.current_terminal_outcome(workflow_id).await
                }
            }
            Err(err) => {
                if let Some(EngineError::Cancelled(_)) = err.downcast_ref::<EngineError>() {
                    tracing::info!("workflow {} aborted at a cancellation checkpoint", workflow_id);
                    Err(EngineError::Cancelled(workflow_id.to_string()))
                } else {
                    let payload = ErrorPayload::from_anyhow(&err);
                    let payload_json = serde_json::to_string(&payload)?;
                    if self.store.finalize_error(workflow_id, &payload_json).await? {
                        tracing::warn!("workflow {} failed: {}", workflow_id, payload.message);
                        Err(EngineError::Body {
                            id: workflow_id.to_string(),
                            error: payload,
                        })
                    } else {
                        self.current_terminal_outcome(workflow_id).await
                    }
                }
            }
        };

        // Terminal completion releases the queue occupancy for the next
        // dispatch cycle. Harmless when cancel already evicted the entry.
        if let Some(queue_name) = queue_name {
            let limited = self
                .queues
                .get(queue_name)
                .map(|queue| queue.limiter.is_some())
                .unwrap_or(false);
            if let Err(err) = self.store.release_queue_slot(workflow_id, limited).await {
                tracing::warn!(
                    "failed to release queue slot for workflow {}: {}",
                    workflow_id,
                    err
                );
            }
        }

        result
    }

    async fn current_terminal_outcome(&self, workflow_id: &str) -> EngineResult<Value> {
        let row = self
            .store
            .get_status(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        terminal_row_to_result(row, self.max_recovery_attempts)
    }

    /// Debug/time-travel replay: re-run the body of a historical execution
    /// feeding back its recorded step results. Performs no side effects,
    /// writes no step rows, and never mutates status.
    pub async fn replay(&self, workflow_id: &str) -> EngineResult<Value> {
        let row = self
            .store
            .get_status(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        let body = self
            .registry
            .resolve(&row.name)
            .ok_or_else(|| EngineError::NotRegistered(row.name.clone()))?;
        let input: Value = match row.input.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Value::Null,
        };
        tracing::info!("replaying workflow {} from recorded steps", workflow_id);
        let ctx = WorkflowContext::replay(workflow_id.to_string(), self.store.clone());
        body.call(ctx, input).await.map_err(|err| {
            match err.downcast::<EngineError>() {
                Ok(engine_err) => engine_err,
                Err(other) => EngineError::Body {
                    id: workflow_id.to_string(),
                    error: ErrorPayload::from_anyhow(&other),
                },
            }
        })
    }

    /// Cancel a workflow by identifier. Idempotent: cancelling a terminal
    /// execution is a no-op; a running body aborts at its next step
    /// boundary.
    pub async fn cancel(&self, workflow_id: &str) -> EngineResult<()> {
        let status = self.store.cancel_workflow(workflow_id).await?;
        tracing::info!("cancel of workflow {} left it {}", workflow_id, status);
        Ok(())
    }

    /// Re-admit a non-success-terminal execution for another attempt under
    /// the same identifier.
    pub async fn resume(&self, workflow_id: &str) -> EngineResult<WorkflowHandle> {
        match self
            .store
            .resume_workflow(workflow_id, &self.executor_id)
            .await?
        {
            ResumeAction::Requeued { queue_name } => {
                tracing::info!(
                    "resumed workflow {} back onto queue {}",
                    workflow_id,
                    queue_name
                );
            }
            ResumeAction::Direct => {
                tracing::info!("resumed workflow {}; re-executing", workflow_id);
                let engine = self.strong_self();
                let workflow_id = workflow_id.to_string();
                tokio::spawn(async move {
                    if let Err(err) = engine.execute_by_id(&workflow_id).await {
                        tracing::warn!("resumed workflow {} finished: {}", workflow_id, err);
                    }
                });
            }
        }
        Ok(self.retrieve(workflow_id))
    }

    /// Submit a brand-new execution with a fresh identifier and the
    /// original's input, leaving the original row untouched. Returns the
    /// new identifier.
    pub async fn restart(&self, workflow_id: &str) -> EngineResult<String> {
        let row = self
            .store
            .get_status(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        if !self.registry.contains(&row.name) {
            return Err(EngineError::NotRegistered(row.name));
        }
        let new_id = Uuid::new_v4().to_string();
        match row.queue_name.as_deref() {
            Some(queue_name) if self.queues.contains_key(queue_name) => {
                self.store
                    .enqueue(&new_id, &row.name, row.input.as_deref(), queue_name)
                    .await?;
            }
            _ => {
                let input: Value = match row.input.as_deref() {
                    Some(raw) => serde_json::from_str(raw)?,
                    None => Value::Null,
                };
                self.start_detached(&row.name, new_id.clone(), input);
            }
        }
        tracing::info!("restarted workflow {} as {}", workflow_id, new_id);
        Ok(new_id)
    }

    /// Resume every non-terminal execution owned by the given executors
    /// (empty set = all executors). Queued members are returned to the
    /// waiting state for the dispatcher; direct ones are re-executed here.
    /// A workflow whose name is not registered in this process fails
    /// recovery loudly and is left unchanged, never silently dropped.
    pub async fn recover_pending(
        &self,
        executor_ids: &[String],
    ) -> EngineResult<Vec<WorkflowHandle>> {
        let pending = self.store.get_pending_workflows(executor_ids).await?;
        if !pending.is_empty() {
            tracing::info!("recovering {} pending workflow(s)", pending.len());
        }
        let mut handles = Vec::new();
        for workflow in pending {
            match self.recover_one(&workflow).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    tracing::error!(
                        "failed to recover workflow {}: {}",
                        workflow.workflow_id,
                        err
                    );
                }
            }
        }
        Ok(handles)
    }

    async fn recover_one(&self, workflow: &PendingWorkflow) -> EngineResult<WorkflowHandle> {
        let row = self
            .store
            .get_status(&workflow.workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow.workflow_id.clone()))?;
        if !self.registry.contains(&row.name) {
            return Err(EngineError::NotRegistered(row.name));
        }

        if workflow.queue_name.is_some()
            && self.store.reset_queue_assignment(&workflow.workflow_id).await?
        {
            // Back to waiting; the dispatcher re-admits it under the
            // queue's concurrency and rate limits.
            return Ok(self.retrieve(&workflow.workflow_id));
        }

        // Direct execution: take ownership explicitly, then re-run.
        self.store
            .reassign_executor(&workflow.workflow_id, &self.executor_id)
            .await?;
        let engine = self.strong_self();
        let workflow_id = workflow.workflow_id.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.execute_by_id(&workflow_id).await {
                tracing::warn!("recovered workflow {} finished: {}", workflow_id, err);
            }
        });
        Ok(self.retrieve(&workflow.workflow_id))
    }

    /// Control-plane status lookup.
    pub async fn get_status(&self, workflow_id: &str) -> EngineResult<Option<StatusRow>> {
        self.store.get_status(workflow_id).await
    }

    /// Control-plane listing.
    pub async fn list_workflows(&self, filter: &ListFilter) -> EngineResult<Vec<String>> {
        self.store.list_workflows(filter).await
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("executor_id", &self.executor_id)
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::Queue;
    use crate::workflow::WorkflowFuture;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn test_runtime_config() -> RuntimeConfig {
        let mut runtime = Config::default().runtime;
        runtime.executor_id = "exec-test".to_string();
        runtime.result_poll_interval_ms = 10;
        runtime
    }

    async fn test_engine(queues: Vec<Queue>) -> (Arc<WorkflowEngine>, Arc<WorkflowRegistry>) {
        let store = SystemStore::connect(":memory:").await.expect("open store");
        let registry = Arc::new(WorkflowRegistry::new());
        let queue_set: QueueSet = queues
            .into_iter()
            .map(|queue| (queue.name.clone(), queue))
            .collect::<HashMap<_, _>>();
        let engine = WorkflowEngine::new(
            store,
            Arc::clone(&registry),
            Arc::new(queue_set),
            &test_runtime_config(),
        );
        (engine, registry)
    }

    #[tokio::test]
    async fn same_identifier_executes_the_body_at_most_once() {
        let (engine, registry) = test_engine(vec![]).await;
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_body = Arc::clone(&calls);
        let wf = registry
            .register("count", Arc::new(move |_ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                let calls = Arc::clone(&calls_in_body);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!(7))
                })
            }))
            .unwrap();

        let first = engine
            .invoke(&wf, Some("wf-1".into()), Value::Null)
            .await
            .expect("first run");
        let second = engine
            .invoke(&wf, Some("wf-1".into()), Value::Null)
            .await
            .expect("replayed run");
        assert_eq!(first, serde_json::json!(7));
        assert_eq!(second, serde_json::json!(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupted_run_resumes_without_repeating_completed_steps() {
        let (engine, registry) = test_engine(vec![]).await;
        let first_effects = Arc::new(AtomicU32::new(0));
        let second_effects = Arc::new(AtomicU32::new(0));
        let (c1, c2) = (Arc::clone(&first_effects), Arc::clone(&second_effects));
        let wf = registry
            .register("two-steps", Arc::new(move |mut ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                let c1 = Arc::clone(&c1);
                let c2 = Arc::clone(&c2);
                Box::pin(async move {
                    let a: u32 = ctx
                        .step("one", || async {
                            c1.fetch_add(1, Ordering::SeqCst);
                            Ok(10)
                        })
                        .await?;
                    let b: u32 = ctx
                        .step("two", || async {
                            c2.fetch_add(1, Ordering::SeqCst);
                            Ok(32)
                        })
                        .await?;
                    Ok(serde_json::json!(a + b))
                })
            }))
            .unwrap();

        // Simulate a crash after step one: claim the identifier and run
        // only the first step, then drop everything mid-flight.
        let store = engine.store().clone();
        store
            .claim_workflow("wf-crash", "two-steps", Some("null"), "exec-test", None, 50)
            .await
            .unwrap();
        let mut ctx = WorkflowContext::durable("wf-crash".to_string(), store.clone());
        let partial: u32 = ctx
            .step("one", || async {
                first_effects.fetch_add(1, Ordering::SeqCst);
                Ok(10)
            })
            .await
            .unwrap();
        assert_eq!(partial, 10);
        drop(ctx);

        // Recovery path: the full body runs, step one replays its record.
        let output = engine
            .invoke(&wf, Some("wf-crash".into()), Value::Null)
            .await
            .expect("recovered run");
        assert_eq!(output, serde_json::json!(42));
        assert_eq!(first_effects.load(Ordering::SeqCst), 1);
        assert_eq!(second_effects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn body_failure_is_persisted_and_replayed_without_rerunning() {
        let (engine, registry) = test_engine(vec![]).await;
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_body = Arc::clone(&calls);
        let wf = registry
            .register("explode", Arc::new(move |_ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                let calls = Arc::clone(&calls_in_body);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("payment gateway unreachable")
                })
            }))
            .unwrap();

        let err = engine
            .invoke(&wf, Some("wf-err".into()), Value::Null)
            .await
            .expect_err("body failure");
        match &err {
            EngineError::Body { error, .. } => {
                assert!(error.message.contains("payment gateway unreachable"));
            }
            other => panic!("expected Body error, got {other:?}"),
        }
        let row = engine.get_status("wf-err").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Error);
        assert!(row.error.is_some());
        assert!(row.output.is_none());

        let err = engine
            .invoke(&wf, Some("wf-err".into()), Value::Null)
            .await
            .expect_err("replayed failure");
        assert!(matches!(err, EngineError::Body { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_body_at_the_next_step_boundary() {
        let (engine, registry) = test_engine(vec![]).await;
        let reached_step_one = Arc::new(Notify::new());
        let proceed = Arc::new(Notify::new());
        let second_effects = Arc::new(AtomicU32::new(0));
        let (n1, n2, c2) = (
            Arc::clone(&reached_step_one),
            Arc::clone(&proceed),
            Arc::clone(&second_effects),
        );
        let wf = registry
            .register("pausable", Arc::new(move |mut ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                let n1 = Arc::clone(&n1);
                let n2 = Arc::clone(&n2);
                let c2 = Arc::clone(&c2);
                Box::pin(async move {
                    ctx.step("one", || async { Ok(1u32) }).await?;
                    n1.notify_one();
                    n2.notified().await;
                    ctx.step("two", || async {
                        c2.fetch_add(1, Ordering::SeqCst);
                        Ok(2u32)
                    })
                    .await?;
                    Ok(Value::Null)
                })
            }))
            .unwrap();

        let handle = engine.start(&wf, Some("wf-cancel".into()), Value::Null);
        reached_step_one.notified().await;
        engine.cancel("wf-cancel").await.expect("cancel");
        proceed.notify_one();

        let err = handle.result().await.expect_err("cancelled run");
        assert!(matches!(err, EngineError::Cancelled(_)));
        let row = engine.get_status("wf-cancel").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Cancelled);
        assert!(row.output.is_none());
        assert!(row.error.is_none());
        assert_eq!(second_effects.load(Ordering::SeqCst), 0);

        // Idempotent: a second cancel is a no-op, not an error.
        engine.cancel("wf-cancel").await.expect("second cancel");
    }

    #[tokio::test]
    async fn restart_copies_the_input_and_leaves_the_original_untouched() {
        let (engine, registry) = test_engine(vec![]).await;
        let wf = registry
            .register("double", Arc::new(|_ctx: WorkflowContext, input: Value| -> WorkflowFuture {
                Box::pin(async move {
                    let n = input.as_i64().unwrap_or(0);
                    Ok(serde_json::json!(n * 2))
                })
            }))
            .unwrap();

        let output = engine
            .invoke(&wf, Some("wf-orig".into()), serde_json::json!(21))
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!(42));
        let original = engine.get_status("wf-orig").await.unwrap().unwrap();

        let new_id = engine.restart("wf-orig").await.expect("restart");
        assert_ne!(new_id, "wf-orig");
        let result = engine.retrieve(&new_id).result().await.expect("rerun");
        assert_eq!(result, serde_json::json!(42));

        let copy = engine.get_status(&new_id).await.unwrap().unwrap();
        assert_eq!(copy.input, original.input);
        let after = engine.get_status("wf-orig").await.unwrap().unwrap();
        assert_eq!(after.status, original.status);
        assert_eq!(after.output, original.output);
        assert_eq!(after.updated_at, original.updated_at);

        let err = engine.restart("missing").await.expect_err("unknown id");
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn resume_after_error_reopens_and_finishes_with_fresh_output() {
        let (engine, registry) = test_engine(vec![]).await;
        let should_fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = Arc::clone(&should_fail);
        let wf = registry
            .register("flaky", Arc::new(move |_ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                let flag = Arc::clone(&flag);
                Box::pin(async move {
                    if flag.load(Ordering::SeqCst) {
                        anyhow::bail!("transient outage")
                    }
                    Ok(serde_json::json!("recovered"))
                })
            }))
            .unwrap();

        let err = engine
            .invoke(&wf, Some("a1".into()), Value::Null)
            .await
            .expect_err("first attempt fails");
        assert!(matches!(err, EngineError::Body { .. }));

        should_fail.store(false, Ordering::SeqCst);
        let handle = engine.resume("a1").await.expect("resume");
        let output = handle.result().await.expect("second attempt");
        assert_eq!(output, serde_json::json!("recovered"));
        let row = engine.get_status("a1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Success);
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn concurrent_local_callers_observe_a_single_winner() {
        let (engine, registry) = test_engine(vec![]).await;
        let release = Arc::new(Notify::new());
        let release_in_body = Arc::clone(&release);
        let wf = registry
            .register("slow", Arc::new(move |_ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                let release = Arc::clone(&release_in_body);
                Box::pin(async move {
                    release.notified().await;
                    Ok(Value::Null)
                })
            }))
            .unwrap();

        let handle = engine.start(&wf, Some("wf-busy".into()), Value::Null);
        // Give the spawned task a chance to take the active slot.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = engine
            .invoke(&wf, Some("wf-busy".into()), Value::Null)
            .await
            .expect_err("second caller loses");
        assert!(matches!(err, EngineError::DuplicateExecution(_)));

        release.notify_one();
        handle.result().await.expect("winner completes");
    }

    #[tokio::test]
    async fn debug_replay_reproduces_the_output_without_new_effects() {
        let (engine, registry) = test_engine(vec![]).await;
        let effects = Arc::new(AtomicU32::new(0));
        let effects_in_body = Arc::clone(&effects);
        let wf = registry
            .register("effectful", Arc::new(move |mut ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                let effects = Arc::clone(&effects_in_body);
                Box::pin(async move {
                    let n: u32 = ctx
                        .step("emit", || async {
                            effects.fetch_add(1, Ordering::SeqCst);
                            Ok(11)
                        })
                        .await?;
                    Ok(serde_json::json!(n * 3))
                })
            }))
            .unwrap();

        let output = engine
            .invoke(&wf, Some("wf-replay".into()), Value::Null)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!(33));
        assert_eq!(effects.load(Ordering::SeqCst), 1);

        let replayed = engine.replay("wf-replay").await.expect("time travel");
        assert_eq!(replayed, output);
        assert_eq!(effects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_reruns_owned_work_and_reports_unregistered_names() {
        let (engine, registry) = test_engine(vec![]).await;
        let wf = registry
            .register("recoverable", Arc::new(|_ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                Box::pin(async move { Ok(serde_json::json!("done")) })
            }))
            .unwrap();
        let _ = wf;

        let store = engine.store().clone();
        store
            .claim_workflow("wf-mine", "recoverable", Some("null"), "exec-test", None, 50)
            .await
            .unwrap();
        store
            .claim_workflow("wf-ghost", "vanished", Some("null"), "exec-test", None, 50)
            .await
            .unwrap();

        let handles = engine
            .recover_pending(&["exec-test".to_string()])
            .await
            .expect("recovery scan");
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].workflow_id(), "wf-mine");
        let output = handles[0].result().await.expect("recovered run");
        assert_eq!(output, serde_json::json!("done"));

        // The unregistered workflow is left exactly as it was.
        let ghost = engine.get_status("wf-ghost").await.unwrap().unwrap();
        assert_eq!(ghost.status, WorkflowStatus::Pending);
        assert_eq!(ghost.executor_id.as_deref(), Some("exec-test"));
    }

    #[tokio::test]
    async fn recovery_takes_over_a_dead_executors_direct_work() {
        let (engine, registry) = test_engine(vec![]).await;
        registry
            .register("orphaned", Arc::new(|_ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                Box::pin(async move { Ok(serde_json::json!(1)) })
            }))
            .unwrap();

        let store = engine.store().clone();
        store
            .claim_workflow("wf-dead", "orphaned", Some("null"), "exec-dead", None, 50)
            .await
            .unwrap();

        let handles = engine
            .recover_pending(&["exec-dead".to_string()])
            .await
            .expect("takeover");
        assert_eq!(handles.len(), 1);
        handles[0].result().await.expect("runs on the live executor");
        let row = engine.get_status("wf-dead").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Success);
        assert_eq!(row.executor_id.as_deref(), Some("exec-test"));
    }

    #[tokio::test]
    async fn durable_sleep_is_checkpointed() {
        let (engine, registry) = test_engine(vec![]).await;
        let wf = registry
            .register("napper", Arc::new(|mut ctx: WorkflowContext, _input: Value| -> WorkflowFuture {
                Box::pin(async move {
                    ctx.sleep(Duration::from_millis(20)).await?;
                    Ok(serde_json::json!("rested"))
                })
            }))
            .unwrap();

        let output = engine
            .invoke(&wf, Some("wf-nap".into()), Value::Null)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!("rested"));

        // The deadline is recorded as step 0; a replay would not sleep
        // past it again.
        let record = engine
            .store()
            .lookup_step("wf-nap", 0)
            .await
            .unwrap()
            .expect("sleep checkpoint");
        assert_eq!(record.label, "sleep");
    }
}
