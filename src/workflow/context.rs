/// Workflow execution context
///
/// Handed to every workflow body. Its `step` method is the checkpointing
/// boundary that makes bodies safe to replay: each side-effecting
/// operation is assigned an ordinal at call time, consults the step-result
/// table before doing work, and records its outcome exactly once. Step
/// boundaries are also where cooperative cancellation is observed.

use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::error::{EngineError, ErrorPayload};
use crate::store::{StepRecord, SystemStore, WorkflowStatus};

/// How the body's steps interact with recorded results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionMode {
    /// Normal durable execution: replay recorded steps, perform and record
    /// the rest.
    Durable,
    /// Debug/time-travel replay: feed back recorded results only. Never
    /// performs an operation, never writes a step row; a step with no
    /// recorded result is a determinism failure.
    Replay,
}

/// Per-execution context passed by value into the workflow body.
pub struct WorkflowContext {
    workflow_id: String,
    store: SystemStore,
    next_step_id: i64,
    mode: ExecutionMode,
}

impl WorkflowContext {
    pub(crate) fn durable(workflow_id: String, store: SystemStore) -> Self {
        Self {
            workflow_id,
            store,
            next_step_id: 0,
            mode: ExecutionMode::Durable,
        }
    }

    pub(crate) fn replay(workflow_id: String, store: SystemStore) -> Self {
        Self {
            workflow_id,
            store,
            next_step_id: 0,
            mode: ExecutionMode::Replay,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    fn take_step_id(&mut self) -> i64 {
        let id = self.next_step_id;
        self.next_step_id += 1;
        id
    }

    /// Run a side-effecting operation at most once across any number of
    /// replays of this workflow.
    ///
    /// If a result is already recorded for this ordinal, it is returned
    /// (or re-raised, for a recorded failure) without invoking `op`.
    /// Otherwise the operation runs and its outcome is recorded; on a
    /// concurrent duplicate the first writer wins and its result is the
    /// one returned.
    pub async fn step<T, F, Fut>(&mut self, label: &str, op: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let step_id = self.take_step_id();

        if let Some(recorded) = self.store.lookup_step(&self.workflow_id, step_id).await? {
            tracing::debug!(
                "replaying step {} ({}) of workflow {}",
                step_id,
                label,
                self.workflow_id
            );
            return decode_record(&recorded);
        }

        if self.mode == ExecutionMode::Replay {
            return Err(EngineError::MissingStepResult {
                id: self.workflow_id.clone(),
                step_id,
                label: label.to_string(),
            }
            .into());
        }

        // Step boundaries are the cancellation checkpoints: a body whose
        // execution was cancelled by another actor aborts here instead of
        // performing further effects.
        let status = self
            .store
            .get_status(&self.workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(self.workflow_id.clone()))?;
        if status.status == WorkflowStatus::Cancelled {
            return Err(EngineError::Cancelled(self.workflow_id.clone()).into());
        }

        tracing::debug!(
            "running step {} ({}) of workflow {}",
            step_id,
            label,
            self.workflow_id
        );
        match op().await {
            Ok(value) => {
                let serialized = serde_json::to_string(&value).map_err(EngineError::Codec)?;
                let winner = self
                    .store
                    .record_step(&self.workflow_id, step_id, label, Some(&serialized), None)
                    .await?;
                decode_record(&winner)
            }
            Err(err) => {
                let payload = serde_json::to_string(&ErrorPayload::from_anyhow(&err))
                    .map_err(EngineError::Codec)?;
                self.store
                    .record_step(&self.workflow_id, step_id, label, None, Some(&payload))
                    .await?;
                Err(err)
            }
        }
    }

    /// Durable sleep: the deadline is checkpointed on first execution, so
    /// a replay sleeps only the remainder. Debug replays do not sleep.
    pub async fn sleep(&mut self, duration: Duration) -> anyhow::Result<()> {
        let step_id = self.take_step_id();
        let now = chrono::Utc::now().timestamp_millis();

        let deadline_ms = match self.store.lookup_step(&self.workflow_id, step_id).await? {
            Some(recorded) => decode_record::<i64>(&recorded)?,
            None => {
                if self.mode == ExecutionMode::Replay {
                    return Err(EngineError::MissingStepResult {
                        id: self.workflow_id.clone(),
                        step_id,
                        label: "sleep".to_string(),
                    }
                    .into());
                }
                let deadline = now + duration.as_millis() as i64;
                self.store
                    .record_step(
                        &self.workflow_id,
                        step_id,
                        "sleep",
                        Some(&deadline.to_string()),
                        None,
                    )
                    .await?;
                deadline
            }
        };

        let remaining = deadline_ms - now;
        if self.mode == ExecutionMode::Durable && remaining > 0 {
            tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
        }
        Ok(())
    }
}

fn decode_record<T: DeserializeOwned>(record: &StepRecord) -> anyhow::Result<T> {
    if let Some(output) = &record.output {
        return Ok(serde_json::from_str(output).map_err(EngineError::Codec)?);
    }
    let message = record
        .error
        .as_deref()
        .and_then(|raw| serde_json::from_str::<ErrorPayload>(raw).ok())
        .map(|payload| payload.message)
        .unwrap_or_else(|| "step failed with an unreadable error record".to_string());
    Err(anyhow::anyhow!(message))
}
