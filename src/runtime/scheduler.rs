/// Background cron scheduler service
///
/// Fires registered workflows on cron schedules using tokio-cron-scheduler.
/// Every fire starts the workflow under a deterministic identifier derived
/// from the trigger name and the fire time, so concurrent executors running
/// the same schedule deduplicate through the ordinary identifier claim.

use crate::runtime::engine::WorkflowEngine;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// One cron-scheduled workflow invocation, registered at startup.
#[derive(Debug, Clone)]
pub struct ScheduledTrigger {
    /// Cron expression (tokio-cron-scheduler syntax, seconds included)
    pub schedule: String,
    /// Registered workflow name to start on each fire
    pub workflow: String,
    /// Fixed input handed to every fire
    pub input: Value,
}

/// Scheduler service owning the cron jobs for all registered triggers.
///
/// Deactivation stops new fires without aborting workflows already started.
pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_ids: Arc<RwLock<HashMap<String, Uuid>>>,
    engine: Arc<WorkflowEngine>,
    triggers: Vec<ScheduledTrigger>,
}

impl CronSchedulerService {
    pub async fn new(engine: Arc<WorkflowEngine>, triggers: Vec<ScheduledTrigger>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_ids: Arc::new(RwLock::new(HashMap::new())),
            engine,
            triggers,
        })
    }

    /// Register all triggers and start the scheduler.
    pub async fn start(&self) -> Result<()> {
        if self.triggers.is_empty() {
            tracing::debug!("no scheduled triggers registered; scheduler stays idle");
            return Ok(());
        }
        tracing::info!("⏰ starting cron scheduler ({} trigger(s))", self.triggers.len());
        for trigger in &self.triggers {
            self.register_trigger(trigger).await?;
        }
        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }
        tracing::info!("✅ cron scheduler started");
        Ok(())
    }

    /// Stop firing triggers. Idempotent; in-flight workflows are untouched.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut job_ids = self.job_ids.write().await;
            job_ids.clear();
        }
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        tracing::info!("⏹️ cron scheduler stopped");
        Ok(())
    }

    async fn register_trigger(&self, trigger: &ScheduledTrigger) -> Result<()> {
        let job_key = format!("{}:{}", trigger.workflow, trigger.schedule);
        tracing::info!(
            "⏰ registering scheduled trigger: {} ({})",
            trigger.workflow,
            trigger.schedule
        );

        let engine = Arc::clone(&self.engine);
        let workflow = trigger.workflow.clone();
        let input = trigger.input.clone();

        let job = Job::new_async(trigger.schedule.as_str(), move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            let workflow = workflow.clone();
            let input = input.clone();

            Box::pin(async move {
                if engine.is_deactivated() {
                    tracing::debug!("skipping scheduled fire of {}: deactivated", workflow);
                    return;
                }
                // One identifier per (workflow, fire second): replicas that
                // fire together collapse onto a single execution.
                let workflow_id = format!("sched-{}-{}", workflow, Utc::now().timestamp());
                tracing::debug!("🔔 scheduled trigger fired: {}", workflow_id);
                engine.start_detached(&workflow, workflow_id, input);
            })
        })?;

        let job_id = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        {
            let mut job_ids = self.job_ids.write().await;
            job_ids.insert(job_key, job_id);
        }
        Ok(())
    }
}
