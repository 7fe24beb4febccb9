/// Background queue dispatch loop
///
/// Runs on a fixed cadence (not event-driven) and, per registered queue,
/// admits waiting workflows up to the queue's concurrency and rate limits,
/// then hands them to the execution engine. Admission for a given queue is
/// serialized by a per-queue mutex so concurrent cycles cannot double-count
/// its slots, while unrelated queues dispatch independently.
///
/// Stops accepting new work on the engine's cooperative shutdown signal;
/// in-flight executions are left to finish.

use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;

use crate::runtime::engine::WorkflowEngine;

pub struct QueueDispatcher {
    engine: Arc<WorkflowEngine>,
    interval: Duration,
    /// Per-queue admission locks; never a single global mutex.
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl QueueDispatcher {
    pub fn new(engine: Arc<WorkflowEngine>, interval: Duration) -> Self {
        let locks = engine
            .queues()
            .keys()
            .map(|name| (name.clone(), Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            engine,
            interval,
            locks,
        }
    }

    /// Run the dispatch loop until deactivation.
    pub async fn run(self) {
        let mut shutdown = self.engine.shutdown_signal();
        if *shutdown.borrow() {
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "🚀 queue dispatcher started ({} queue(s), every {:?})",
            self.engine.queues().len(),
            self.interval
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.dispatch_cycle().await;
                }
            }
        }
        tracing::info!("⏹️ queue dispatcher stopped");
    }

    /// One admission pass over every registered queue. Public so tests and
    /// embedding applications can drive dispatch without the timer.
    pub async fn dispatch_cycle(&self) {
        for queue in self.engine.queues().values() {
            let Some(lock) = self.locks.get(&queue.name) else {
                continue;
            };
            let _guard = lock.lock().await;
            match self
                .engine
                .store()
                .start_queued_workflows(queue, self.engine.executor_id())
                .await
            {
                Ok(admitted) => {
                    if !admitted.is_empty() {
                        tracing::debug!(
                            "[{}] admitted {} workflow(s)",
                            queue.name,
                            admitted.len()
                        );
                    }
                    for workflow_id in admitted {
                        self.spawn_admitted(workflow_id);
                    }
                }
                Err(err) => {
                    // Transient storage contention is expected under
                    // concurrent dispatch; the next cycle retries.
                    tracing::warn!("dispatch failed for queue {}: {}", queue.name, err);
                }
            }
        }
    }

    fn spawn_admitted(&self, workflow_id: String) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(err) = engine.execute_by_id(&workflow_id).await {
                tracing::debug!("queued workflow {} finished: {}", workflow_id, err);
            }
        });
    }
}
