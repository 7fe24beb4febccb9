/// Queue configuration
///
/// A queue is a named, process-wide admission-control policy: a global cap
/// on simultaneously running members, a per-executor cap, and an optional
/// rate limiter. Queues are registered once at startup and are immutable
/// for the process lifetime; they are configuration, not persisted state,
/// and are reported as-is to the control plane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Limit the number of workflows a queue may start within a time window.
///
/// With a limit of 5 and a period of 10 seconds, no more than 5 members
/// are admitted per trailing 10-second window, regardless of how many
/// concurrency slots are free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    /// Window length in seconds.
    pub period: f64,
}

impl RateLimit {
    pub fn new(limit: u32, period: f64) -> Self {
        Self { limit, period }
    }

    pub fn period_ms(&self) -> i64 {
        (self.period * 1000.0) as i64
    }
}

/// A named admission-control policy governing when enqueued workflows run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    /// Global cap on simultaneously running members across all executors.
    pub concurrency: Option<u32>,
    /// Cap on running members owned by a single executor instance.
    pub worker_concurrency: Option<u32>,
    pub limiter: Option<RateLimit>,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            worker_concurrency: None,
            limiter: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_worker_concurrency(mut self, worker_concurrency: u32) -> Self {
        self.worker_concurrency = Some(worker_concurrency);
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimit) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// A per-executor share wider than the global cap can never be used.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let (Some(worker), Some(global)) = (self.worker_concurrency, self.concurrency) {
            if worker > global {
                anyhow::bail!(
                    "queue '{}': worker_concurrency ({}) must be less than or equal to concurrency ({})",
                    self.name,
                    worker,
                    global
                );
            }
        }
        Ok(())
    }

    pub fn metadata(&self) -> QueueMetadata {
        QueueMetadata {
            name: self.name.clone(),
            concurrency: self.concurrency,
            worker_concurrency: self.worker_concurrency,
            rate_limit: self.limiter.clone(),
        }
    }
}

/// Queue descriptor reported by the control plane; unset fields are
/// omitted from the wire representation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_concurrency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

/// The process-wide queue registry: built at startup, immutable afterwards.
pub type QueueSet = HashMap<String, Queue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_share_wider_than_global_cap_is_rejected() {
        let queue = Queue::new("q").with_concurrency(2).with_worker_concurrency(5);
        assert!(queue.validate().is_err());

        let queue = Queue::new("q").with_concurrency(5).with_worker_concurrency(5);
        assert!(queue.validate().is_ok());
    }

    #[test]
    fn metadata_omits_unset_fields() {
        let bare = Queue::new("bare").metadata();
        let json = serde_json::to_value(&bare).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "bare" }));

        let full = Queue::new("full")
            .with_concurrency(4)
            .with_worker_concurrency(2)
            .with_limiter(RateLimit::new(3, 60.0))
            .metadata();
        let json = serde_json::to_value(&full).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "full",
                "concurrency": 4,
                "workerConcurrency": 2,
                "rateLimit": { "limit": 3, "period": 60.0 }
            })
        );
    }
}
