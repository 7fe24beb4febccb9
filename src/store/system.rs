/// SQLite persistence layer for the durable-execution system tables
///
/// Owns the three system tables (workflow_status, step_results,
/// workflow_queue) and every transaction that touches them. All status
/// transitions are conditional updates keyed on the expected prior status,
/// so two concurrent actors can never both believe they own the same
/// execution; the losing side observes zero affected rows and re-reads.

use crate::error::{EngineError, EngineResult};
use crate::queue::Queue;
use crate::store::types::{
    Claim, ListFilter, PendingWorkflow, ResumeAction, StatusRow, StepRecord, WorkflowStatus,
};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::time::Duration;

/// Bounded retry budget for transient storage failures on status writes.
/// A write that exhausts this budget surfaces as a fatal StoreError; the
/// engine never silently drops a transition.
const WRITE_RETRY_ATTEMPTS: u32 = 5;
const WRITE_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Identifier prefix used by scheduled triggers. These are legitimately
/// re-submitted with slightly different inputs (the fire timestamp), so
/// the input-immutability warning is suppressed for them.
const SCHEDULED_ID_PREFIX: &str = "sched-";

/// Transactional store for workflow status rows, step results, and queue
/// entries.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct SystemStore {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("5") | Some("6") | Some("261") | Some("517")
        ),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Retry a status write with exponential backoff on transient failures.
async fn with_write_retries<T, F, Fut>(op: &str, mut f: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay = WRITE_RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < WRITE_RETRY_ATTEMPTS && is_retryable(&err) => {
                attempt += 1;
                tracing::warn!(
                    "transient storage failure during {} (attempt {}): {}",
                    op,
                    attempt,
                    err
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

fn parse_status(value: &str) -> EngineResult<WorkflowStatus> {
    WorkflowStatus::parse(value).ok_or_else(|| {
        EngineError::Store(sqlx::Error::Decode(
            format!("unknown workflow status '{value}'").into(),
        ))
    })
}

fn row_to_status(row: &SqliteRow) -> EngineResult<StatusRow> {
    Ok(StatusRow {
        workflow_id: row.get("workflow_id"),
        name: row.get("name"),
        status: parse_status(&row.get::<String, _>("status"))?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        executor_id: row.get("executor_id"),
        queue_name: row.get("queue_name"),
        recovery_attempts: row.get("recovery_attempts"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl SystemStore {
    /// Wrap an existing connection pool. Callers must run `init_schema`
    /// before first use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if necessary) the system database at `path` and
    /// initialize its schema. `":memory:"` yields an ephemeral store.
    pub async fn connect(path: &str) -> EngineResult<Self> {
        let pool = if path == ":memory:" {
            // A pooled in-memory database is one database per connection;
            // pin the pool to a single connection so all actors share it.
            let options = SqliteConnectOptions::new().in_memory(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .busy_timeout(Duration::from_secs(5));
            SqlitePool::connect_with(options).await?
        };

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the system schema.
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_status (
                workflow_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                input TEXT,
                output TEXT,
                error TEXT,
                executor_id TEXT,
                queue_name TEXT,
                recovery_attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_results (
                workflow_id TEXT NOT NULL,
                step_id INTEGER NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                output TEXT,
                error TEXT,
                PRIMARY KEY (workflow_id, step_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_queue (
                workflow_id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workflow_status_status ON workflow_status(status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workflow_status_executor ON workflow_status(executor_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workflow_queue_name ON workflow_queue(queue_name)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Claim ownership of a workflow identifier for execution.
    ///
    /// A single statement inserts the status row or, when the identifier
    /// already exists, re-claims it only if the row is non-terminal and its
    /// executor is unset or already us. A claim that updates nothing falls
    /// through to a read: terminal rows replay their persisted outcome,
    /// rows owned by a live foreign executor are a duplicate execution.
    ///
    /// Every successful claim increments `recovery_attempts`; beyond
    /// `max_recovery_attempts` the row is dead-lettered as
    /// RETRIES_EXCEEDED and evicted from its queue.
    pub async fn claim_workflow(
        &self,
        workflow_id: &str,
        name: &str,
        input: Option<&str>,
        executor_id: &str,
        queue_name: Option<&str>,
        max_recovery_attempts: u32,
    ) -> EngineResult<Claim> {
        let now = now_ms();
        let row = with_write_retries("workflow claim", || {
            sqlx::query(
                r#"
                INSERT INTO workflow_status
                    (workflow_id, name, status, input, executor_id, queue_name,
                     recovery_attempts, created_at, updated_at)
                VALUES (?1, ?2, 'PENDING', ?3, ?4, ?5, 1, ?6, ?6)
                ON CONFLICT(workflow_id) DO UPDATE SET
                    executor_id = excluded.executor_id,
                    recovery_attempts = workflow_status.recovery_attempts + 1,
                    updated_at = excluded.updated_at
                WHERE workflow_status.status IN ('PENDING', 'ENQUEUED')
                  AND (workflow_status.executor_id IS NULL
                       OR workflow_status.executor_id = excluded.executor_id)
                RETURNING name, status, input, recovery_attempts
                "#,
            )
            .bind(workflow_id)
            .bind(name)
            .bind(input)
            .bind(executor_id)
            .bind(queue_name)
            .bind(now)
            .fetch_optional(&self.pool)
        })
        .await?;

        let Some(row) = row else {
            // The conflicting row could not be claimed: it is either
            // terminal (idempotent replay) or owned by another executor.
            let existing = self
                .get_status(workflow_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
            if existing.status.is_terminal() {
                return Ok(Claim::Finished(existing));
            }
            return Err(EngineError::DuplicateExecution(workflow_id.to_string()));
        };

        let existing_name: String = row.get("name");
        if existing_name != name {
            return Err(EngineError::ConflictingName {
                id: workflow_id.to_string(),
                existing: existing_name,
                requested: name.to_string(),
            });
        }

        let stored_input: Option<String> = row.get("input");
        if let (Some(stored), Some(provided)) = (stored_input.as_deref(), input) {
            if stored != provided && !workflow_id.starts_with(SCHEDULED_ID_PREFIX) {
                // The stored input wins; the identifier is the contract.
                tracing::warn!(
                    "workflow {} invoked again with different inputs; keeping the stored input",
                    workflow_id
                );
            }
        }

        let recovery_attempts: i64 = row.get("recovery_attempts");
        if recovery_attempts > max_recovery_attempts as i64 + 1 {
            self.dead_letter(workflow_id).await?;
            return Err(EngineError::RetriesExceeded {
                id: workflow_id.to_string(),
                max_attempts: max_recovery_attempts,
            });
        }

        Ok(Claim::Runnable { recovery_attempts })
    }

    /// Mark a workflow RETRIES_EXCEEDED and evict it from its queue.
    async fn dead_letter(&self, workflow_id: &str) -> EngineResult<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM workflow_queue WHERE workflow_id = ?1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE workflow_status
            SET status = 'RETRIES_EXCEEDED', updated_at = ?2
            WHERE workflow_id = ?1 AND status IN ('PENDING', 'ENQUEUED')
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::warn!("workflow {} dead-lettered as RETRIES_EXCEEDED", workflow_id);
        Ok(())
    }

    /// Terminal SUCCESS transition. Returns false when another actor got
    /// there first (e.g. a concurrent cancel); the caller must re-read.
    pub async fn finalize_success(&self, workflow_id: &str, output: &str) -> EngineResult<bool> {
        let now = now_ms();
        let result = with_write_retries("success finalization", || {
            sqlx::query(
                r#"
                UPDATE workflow_status
                SET status = 'SUCCESS', output = ?2, updated_at = ?3
                WHERE workflow_id = ?1
                  AND status IN ('PENDING', 'ENQUEUED')
                  AND output IS NULL AND error IS NULL
                "#,
            )
            .bind(workflow_id)
            .bind(output)
            .bind(now)
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal ERROR transition; same contract as `finalize_success`.
    pub async fn finalize_error(&self, workflow_id: &str, error: &str) -> EngineResult<bool> {
        let now = now_ms();
        let result = with_write_retries("error finalization", || {
            sqlx::query(
                r#"
                UPDATE workflow_status
                SET status = 'ERROR', error = ?2, updated_at = ?3
                WHERE workflow_id = ?1
                  AND status IN ('PENDING', 'ENQUEUED')
                  AND output IS NULL AND error IS NULL
                "#,
            )
            .bind(workflow_id)
            .bind(error)
            .bind(now)
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Fetch a full status row by identifier.
    pub async fn get_status(&self, workflow_id: &str) -> EngineResult<Option<StatusRow>> {
        let row = sqlx::query("SELECT * FROM workflow_status WHERE workflow_id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_status(&row)?)),
            None => Ok(None),
        }
    }

    /// Record a step outcome. First writer wins: on a concurrent duplicate
    /// the already-recorded row is returned instead of ours.
    pub async fn record_step(
        &self,
        workflow_id: &str,
        step_id: i64,
        label: &str,
        output: Option<&str>,
        error: Option<&str>,
    ) -> EngineResult<StepRecord> {
        debug_assert!(output.is_none() || error.is_none());
        let insert = sqlx::query(
            r#"
            INSERT INTO step_results (workflow_id, step_id, label, output, error)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(workflow_id)
        .bind(step_id)
        .bind(label)
        .bind(output)
        .bind(error)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => Ok(StepRecord {
                workflow_id: workflow_id.to_string(),
                step_id,
                label: label.to_string(),
                output: output.map(str::to_string),
                error: error.map(str::to_string),
            }),
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                tracing::debug!(
                    "step {} of workflow {} was recorded concurrently; using the stored result",
                    step_id,
                    workflow_id
                );
                self.lookup_step(workflow_id, step_id)
                    .await?
                    .ok_or(EngineError::Store(err))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read-before-write lookup for step replay.
    pub async fn lookup_step(
        &self,
        workflow_id: &str,
        step_id: i64,
    ) -> EngineResult<Option<StepRecord>> {
        let row = sqlx::query(
            "SELECT label, output, error FROM step_results WHERE workflow_id = ?1 AND step_id = ?2",
        )
        .bind(workflow_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| StepRecord {
            workflow_id: workflow_id.to_string(),
            step_id,
            label: row.get("label"),
            output: row.get("output"),
            error: row.get("error"),
        }))
    }

    /// Create a waiting status row plus its queue entry. Idempotent per
    /// identifier: re-enqueueing an existing workflow changes nothing.
    pub async fn enqueue(
        &self,
        workflow_id: &str,
        name: &str,
        input: Option<&str>,
        queue_name: &str,
    ) -> EngineResult<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO workflow_status
                (workflow_id, name, status, input, executor_id, queue_name,
                 recovery_attempts, created_at, updated_at)
            VALUES (?1, ?2, 'PENDING', ?3, NULL, ?4, 0, ?5, ?5)
            ON CONFLICT(workflow_id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(name)
        .bind(input)
        .bind(queue_name)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO workflow_queue (workflow_id, queue_name, enqueued_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(workflow_id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(queue_name)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// One admission pass over a queue, inside a single transaction.
    ///
    /// Computes the remaining admission slots from the queue's global and
    /// per-worker concurrency against currently running members, caps them
    /// by the rate limiter's current window, then admits waiting entries
    /// FIFO by enqueue time (ties broken by identifier). Admission flips
    /// the status PENDING → ENQUEUED conditionally, assigns this executor,
    /// and stamps `started_at`. Returns the admitted identifiers.
    pub async fn start_queued_workflows(
        &self,
        queue: &Queue,
        executor_id: &str,
    ) -> EngineResult<Vec<String>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        // Rate limiter: a window that has not elapsed yields zero
        // additional admissions regardless of free concurrency slots.
        let mut recent_admissions: i64 = 0;
        if let Some(limiter) = &queue.limiter {
            recent_admissions = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM workflow_queue
                WHERE queue_name = ?1 AND started_at IS NOT NULL AND started_at > ?2
                "#,
            )
            .bind(&queue.name)
            .bind(now - limiter.period_ms())
            .fetch_one(&mut *tx)
            .await?;
            if recent_admissions >= limiter.limit as i64 {
                tx.commit().await?;
                return Ok(Vec::new());
            }
        }

        // Currently running members, grouped by executor for the worker share.
        let running = sqlx::query(
            r#"
            SELECT ws.executor_id AS executor_id, COUNT(*) AS task_count
            FROM workflow_queue wq
            JOIN workflow_status ws ON wq.workflow_id = ws.workflow_id
            WHERE wq.queue_name = ?1
              AND wq.started_at IS NOT NULL
              AND wq.completed_at IS NULL
            GROUP BY ws.executor_id
            "#,
        )
        .bind(&queue.name)
        .fetch_all(&mut *tx)
        .await?;

        let mut running_total: i64 = 0;
        let mut running_here: i64 = 0;
        for row in &running {
            let owner: Option<String> = row.get("executor_id");
            let count: i64 = row.get("task_count");
            running_total += count;
            if owner.as_deref() == Some(executor_id) {
                running_here = count;
            }
        }

        let mut slots = i64::MAX;
        if let Some(worker_concurrency) = queue.worker_concurrency {
            slots = slots.min((worker_concurrency as i64 - running_here).max(0));
        }
        if let Some(concurrency) = queue.concurrency {
            if running_total > concurrency as i64 {
                tracing::warn!(
                    "queue {} is running {} members above its concurrency limit {}",
                    queue.name,
                    running_total,
                    concurrency
                );
            }
            slots = slots.min((concurrency as i64 - running_total).max(0));
        }
        if slots == 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut candidate_sql = String::from(
            r#"
            SELECT workflow_id FROM workflow_queue
            WHERE queue_name = ?1 AND started_at IS NULL AND completed_at IS NULL
            ORDER BY enqueued_at ASC, workflow_id ASC
            "#,
        );
        if slots != i64::MAX {
            candidate_sql.push_str(" LIMIT ?2");
        }
        let mut candidates_query = sqlx::query_scalar::<_, String>(&candidate_sql).bind(&queue.name);
        if slots != i64::MAX {
            candidates_query = candidates_query.bind(slots);
        }
        let candidates = candidates_query.fetch_all(&mut *tx).await?;

        let mut admitted = Vec::new();
        for workflow_id in candidates {
            if let Some(limiter) = &queue.limiter {
                if admitted.len() as i64 + recent_admissions >= limiter.limit as i64 {
                    break;
                }
            }
            let updated = sqlx::query(
                r#"
                UPDATE workflow_status
                SET status = 'ENQUEUED', executor_id = ?2, updated_at = ?3
                WHERE workflow_id = ?1 AND status = 'PENDING'
                "#,
            )
            .bind(&workflow_id)
            .bind(executor_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                // Cancelled or claimed since the candidate scan; skip it.
                continue;
            }
            sqlx::query("UPDATE workflow_queue SET started_at = ?2 WHERE workflow_id = ?1")
                .bind(&workflow_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            admitted.push(workflow_id);
        }

        // For limited queues, completed entries are kept until their
        // admission no longer counts against the window, then collected.
        if let Some(limiter) = &queue.limiter {
            sqlx::query(
                r#"
                DELETE FROM workflow_queue
                WHERE queue_name = ?1 AND completed_at IS NOT NULL AND started_at < ?2
                "#,
            )
            .bind(&queue.name)
            .bind(now - limiter.period_ms())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(admitted)
    }

    /// Release a queue member's occupancy after a terminal transition.
    /// Limited queues keep the entry (stamped completed) for window
    /// accounting; unlimited queues drop it immediately.
    pub async fn release_queue_slot(&self, workflow_id: &str, limited: bool) -> EngineResult<()> {
        if limited {
            sqlx::query(
                "UPDATE workflow_queue SET completed_at = ?2 WHERE workflow_id = ?1",
            )
            .bind(workflow_id)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("DELETE FROM workflow_queue WHERE workflow_id = ?1")
                .bind(workflow_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Return a queued workflow to the waiting state so the dispatcher can
    /// re-admit it under the queue's limits. Returns false when the
    /// workflow is no longer an active queue member.
    pub async fn reset_queue_assignment(&self, workflow_id: &str) -> EngineResult<bool> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let reset = sqlx::query(
            r#"
            UPDATE workflow_queue SET started_at = NULL
            WHERE workflow_id = ?1 AND completed_at IS NULL
            "#,
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await?;
        if reset.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE workflow_status
            SET status = 'PENDING', executor_id = NULL, updated_at = ?2
            WHERE workflow_id = ?1 AND status IN ('PENDING', 'ENQUEUED')
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Cancel a workflow: evict it from its queue and set CANCELLED if it
    /// is still non-terminal. Idempotent; cancelling a terminal execution
    /// is a no-op. Returns the resulting status.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> EngineResult<WorkflowStatus> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_status WHERE workflow_id = ?1")
                .bind(workflow_id)
                .fetch_optional(&mut *tx)
                .await?;
        let status = parse_status(
            &status.ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?,
        )?;
        if status.is_terminal() {
            tx.commit().await?;
            return Ok(status);
        }
        sqlx::query("DELETE FROM workflow_queue WHERE workflow_id = ?1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE workflow_status
            SET status = 'CANCELLED', updated_at = ?2
            WHERE workflow_id = ?1 AND status IN ('PENDING', 'ENQUEUED')
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(WorkflowStatus::Cancelled)
    }

    /// Reopen a non-success-terminal workflow for another attempt under the
    /// same identifier. Clears the persisted outcome and the recovery
    /// attempt counter. Queued workflows go back to waiting with a fresh
    /// queue entry; direct workflows are claimed by `executor_id` and the
    /// caller re-submits them to the engine.
    pub async fn resume_workflow(
        &self,
        workflow_id: &str,
        executor_id: &str,
    ) -> EngineResult<ResumeAction> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT status, queue_name FROM workflow_status WHERE workflow_id = ?1",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        let status = parse_status(&row.get::<String, _>("status"))?;
        let queue_name: Option<String> = row.get("queue_name");

        if !matches!(
            status,
            WorkflowStatus::Error | WorkflowStatus::Cancelled | WorkflowStatus::RetriesExceeded
        ) {
            return Err(EngineError::InvalidState {
                id: workflow_id.to_string(),
                status,
            });
        }

        // Drop any stale queue entry before re-admitting.
        sqlx::query("DELETE FROM workflow_queue WHERE workflow_id = ?1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        match queue_name {
            Some(queue_name) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_status
                    SET status = 'PENDING', executor_id = NULL, output = NULL,
                        error = NULL, recovery_attempts = 0, updated_at = ?2
                    WHERE workflow_id = ?1
                    "#,
                )
                .bind(workflow_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    r#"
                    INSERT INTO workflow_queue (workflow_id, queue_name, enqueued_at)
                    VALUES (?1, ?2, ?3)
                    "#,
                )
                .bind(workflow_id)
                .bind(&queue_name)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(ResumeAction::Requeued { queue_name })
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE workflow_status
                    SET status = 'PENDING', executor_id = ?2, output = NULL,
                        error = NULL, recovery_attempts = 0, updated_at = ?3
                    WHERE workflow_id = ?1
                    "#,
                )
                .bind(workflow_id)
                .bind(executor_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(ResumeAction::Direct)
            }
        }
    }

    /// Operator-initiated ownership takeover during recovery. Ordinary
    /// claims never steal a foreign executor's row; recovery asserts the
    /// old owner is dead and reassigns explicitly. Returns false when the
    /// row reached a terminal state in the meantime.
    pub async fn reassign_executor(
        &self,
        workflow_id: &str,
        executor_id: &str,
    ) -> EngineResult<bool> {
        let now = now_ms();
        let result = with_write_retries("executor reassignment", || {
            sqlx::query(
                r#"
                UPDATE workflow_status
                SET executor_id = ?2, updated_at = ?3
                WHERE workflow_id = ?1 AND status IN ('PENDING', 'ENQUEUED')
                "#,
            )
            .bind(workflow_id)
            .bind(executor_id)
            .bind(now)
            .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Scan for non-terminal executions, optionally scoped to a set of
    /// executor ids. An empty set means "all executors".
    pub async fn get_pending_workflows(
        &self,
        executor_ids: &[String],
    ) -> EngineResult<Vec<PendingWorkflow>> {
        let mut sql = String::from(
            r#"
            SELECT workflow_id, queue_name FROM workflow_status
            WHERE status IN ('PENDING', 'ENQUEUED')
            "#,
        );
        if !executor_ids.is_empty() {
            let marks = vec!["?"; executor_ids.len()].join(", ");
            sql.push_str(&format!(" AND executor_id IN ({marks})"));
        }
        sql.push_str(" ORDER BY created_at ASC, workflow_id ASC");

        let mut query = sqlx::query(&sql);
        for executor_id in executor_ids {
            query = query.bind(executor_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| PendingWorkflow {
                workflow_id: row.get("workflow_id"),
                queue_name: row.get("queue_name"),
            })
            .collect())
    }

    /// Control-plane listing: identifiers matching the filter, ordered by
    /// creation time.
    pub async fn list_workflows(&self, filter: &ListFilter) -> EngineResult<Vec<String>> {
        let mut sql = String::from("SELECT workflow_id FROM workflow_status WHERE 1 = 1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.name.is_some() {
            sql.push_str(" AND name = ?");
        }
        sql.push_str(if filter.sort_desc {
            " ORDER BY created_at DESC, workflow_id DESC"
        } else {
            " ORDER BY created_at ASC, workflow_id ASC"
        });
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        } else if filter.offset.is_some() {
            // SQLite accepts OFFSET only after a LIMIT clause.
            sql.push_str(" LIMIT -1");
        }
        if filter.offset.is_some() {
            sql.push_str(" OFFSET ?");
        }

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(name) = &filter.name {
            query = query.bind(name);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit);
        }
        if let Some(offset) = filter.offset {
            query = query.bind(offset);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Queue, RateLimit};

    async fn memory_store() -> SystemStore {
        SystemStore::connect(":memory:").await.expect("open store")
    }

    #[tokio::test]
    async fn fresh_claim_is_runnable_and_reclaim_counts_attempts() {
        let store = memory_store().await;
        let claim = store
            .claim_workflow("wf-1", "demo", Some("[1]"), "exec-a", None, 50)
            .await
            .expect("first claim");
        assert!(matches!(claim, Claim::Runnable { recovery_attempts: 1 }));

        // Self-recovery: the same executor may re-claim a pending row.
        let claim = store
            .claim_workflow("wf-1", "demo", Some("[1]"), "exec-a", None, 50)
            .await
            .expect("re-claim");
        assert!(matches!(claim, Claim::Runnable { recovery_attempts: 2 }));
    }

    #[tokio::test]
    async fn foreign_executor_cannot_steal_a_pending_claim() {
        let store = memory_store().await;
        store
            .claim_workflow("wf-1", "demo", None, "exec-a", None, 50)
            .await
            .expect("first claim");
        let err = store
            .claim_workflow("wf-1", "demo", None, "exec-b", None, 50)
            .await
            .expect_err("second executor must lose");
        assert!(matches!(err, EngineError::DuplicateExecution(id) if id == "wf-1"));
    }

    #[tokio::test]
    async fn terminal_claim_replays_the_persisted_outcome() {
        let store = memory_store().await;
        store
            .claim_workflow("wf-1", "demo", None, "exec-a", None, 50)
            .await
            .expect("claim");
        assert!(store.finalize_success("wf-1", "42").await.expect("finalize"));

        let claim = store
            .claim_workflow("wf-1", "demo", None, "exec-b", None, 50)
            .await
            .expect("terminal claim");
        match claim {
            Claim::Finished(row) => {
                assert_eq!(row.status, WorkflowStatus::Success);
                assert_eq!(row.output.as_deref(), Some("42"));
                assert!(row.error.is_none());
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_rejects_a_different_function_name() {
        let store = memory_store().await;
        store
            .claim_workflow("wf-1", "demo", None, "exec-a", None, 50)
            .await
            .expect("claim");
        let err = store
            .claim_workflow("wf-1", "other", None, "exec-a", None, 50)
            .await
            .expect_err("name mismatch");
        assert!(matches!(err, EngineError::ConflictingName { .. }));
    }

    #[tokio::test]
    async fn claims_beyond_the_maximum_dead_letter_the_workflow() {
        let store = memory_store().await;
        // With a budget of 1, the first claim and one re-claim are allowed.
        for _ in 0..2 {
            store
                .claim_workflow("wf-1", "demo", None, "exec-a", None, 1)
                .await
                .expect("claim within budget");
        }
        let err = store
            .claim_workflow("wf-1", "demo", None, "exec-a", None, 1)
            .await
            .expect_err("budget exhausted");
        assert!(matches!(err, EngineError::RetriesExceeded { .. }));
        let row = store.get_status("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::RetriesExceeded);
    }

    #[tokio::test]
    async fn finalize_refuses_after_cancellation() {
        let store = memory_store().await;
        store
            .claim_workflow("wf-1", "demo", None, "exec-a", None, 50)
            .await
            .expect("claim");
        store.cancel_workflow("wf-1").await.expect("cancel");
        assert!(!store.finalize_success("wf-1", "42").await.expect("finalize"));
        let row = store.get_status("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Cancelled);
        assert!(row.output.is_none());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_unknown_ids_are_not_found() {
        let store = memory_store().await;
        store
            .claim_workflow("wf-1", "demo", None, "exec-a", None, 50)
            .await
            .expect("claim");
        assert_eq!(
            store.cancel_workflow("wf-1").await.expect("cancel"),
            WorkflowStatus::Cancelled
        );
        assert_eq!(
            store.cancel_workflow("wf-1").await.expect("second cancel"),
            WorkflowStatus::Cancelled
        );
        let err = store.cancel_workflow("missing").await.expect_err("unknown");
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn step_records_are_first_writer_wins() {
        let store = memory_store().await;
        let first = store
            .record_step("wf-1", 0, "charge", Some("\"ok\""), None)
            .await
            .expect("record");
        assert_eq!(first.output.as_deref(), Some("\"ok\""));

        let replayed = store
            .record_step("wf-1", 0, "charge", Some("\"different\""), None)
            .await
            .expect("duplicate record resolves to the stored row");
        assert_eq!(replayed.output.as_deref(), Some("\"ok\""));
    }

    #[tokio::test]
    async fn resume_reopens_only_non_success_terminals() {
        let store = memory_store().await;
        store
            .claim_workflow("wf-1", "demo", None, "exec-a", None, 50)
            .await
            .expect("claim");

        // Running: invalid.
        let err = store
            .resume_workflow("wf-1", "exec-a")
            .await
            .expect_err("resume while running");
        assert!(matches!(err, EngineError::InvalidState { .. }));

        store.finalize_error("wf-1", "{\"message\":\"boom\"}").await.unwrap();
        let action = store
            .resume_workflow("wf-1", "exec-a")
            .await
            .expect("resume after error");
        assert!(matches!(action, ResumeAction::Direct));
        let row = store.get_status("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Pending);
        assert_eq!(row.recovery_attempts, 0);
        assert!(row.error.is_none());

        store.finalize_success("wf-1", "1").await.unwrap();
        let err = store
            .resume_workflow("wf-1", "exec-a")
            .await
            .expect_err("resume after success");
        assert!(matches!(err, EngineError::InvalidState { .. }));

        let err = store
            .resume_workflow("missing", "exec-a")
            .await
            .expect_err("unknown id");
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn admission_is_fifo_and_respects_concurrency() {
        let store = memory_store().await;
        let queue = Queue::new("q").with_concurrency(1);
        store.enqueue("a1", "demo", None, "q").await.unwrap();
        store.enqueue("a2", "demo", None, "q").await.unwrap();

        let admitted = store
            .start_queued_workflows(&queue, "exec-a")
            .await
            .expect("dispatch");
        assert_eq!(admitted, vec!["a1".to_string()]);
        let a1 = store.get_status("a1").await.unwrap().unwrap();
        let a2 = store.get_status("a2").await.unwrap().unwrap();
        assert_eq!(a1.status, WorkflowStatus::Enqueued);
        assert_eq!(a2.status, WorkflowStatus::Pending);

        // Slot still occupied: nothing further is admitted.
        let admitted = store
            .start_queued_workflows(&queue, "exec-a")
            .await
            .expect("dispatch");
        assert!(admitted.is_empty());

        // Terminal completion releases the slot for the next cycle.
        store.finalize_success("a1", "null").await.unwrap();
        store.release_queue_slot("a1", false).await.unwrap();
        let admitted = store
            .start_queued_workflows(&queue, "exec-a")
            .await
            .expect("dispatch");
        assert_eq!(admitted, vec!["a2".to_string()]);
    }

    #[tokio::test]
    async fn worker_concurrency_caps_this_executor_only() {
        let store = memory_store().await;
        let queue = Queue::new("q").with_concurrency(10).with_worker_concurrency(1);
        store.enqueue("a1", "demo", None, "q").await.unwrap();
        store.enqueue("a2", "demo", None, "q").await.unwrap();

        let admitted = store.start_queued_workflows(&queue, "exec-a").await.unwrap();
        assert_eq!(admitted.len(), 1);
        let admitted = store.start_queued_workflows(&queue, "exec-a").await.unwrap();
        assert!(admitted.is_empty());

        // A different executor still has its own share.
        let admitted = store.start_queued_workflows(&queue, "exec-b").await.unwrap();
        assert_eq!(admitted.len(), 1);
    }

    #[tokio::test]
    async fn rate_limiter_caps_a_burst_within_one_window() {
        let store = memory_store().await;
        let queue = Queue::new("q").with_limiter(RateLimit::new(3, 60.0));
        for i in 0..10 {
            store
                .enqueue(&format!("wf-{i}"), "demo", None, "q")
                .await
                .unwrap();
        }
        let admitted = store.start_queued_workflows(&queue, "exec-a").await.unwrap();
        assert_eq!(admitted.len(), 3);

        // Window not elapsed: zero additional admissions even though the
        // queue has no concurrency limit at all.
        let admitted = store.start_queued_workflows(&queue, "exec-a").await.unwrap();
        assert!(admitted.is_empty());
    }

    #[tokio::test]
    async fn fifo_ties_break_by_identifier() {
        let store = memory_store().await;
        let queue = Queue::new("q").with_concurrency(1);
        // Same enqueue timestamp is likely within one millisecond; insert
        // out of lexical order to prove the tie-break.
        store.enqueue("b", "demo", None, "q").await.unwrap();
        store.enqueue("a", "demo", None, "q").await.unwrap();
        let admitted = store.start_queued_workflows(&queue, "exec-a").await.unwrap();
        // Either "a" wins the tie or "b" was durably enqueued first; both
        // orders are FIFO-consistent, but with equal timestamps the
        // identifier decides.
        let first = store.get_status(&admitted[0]).await.unwrap().unwrap();
        assert_eq!(first.status, WorkflowStatus::Enqueued);
        let b = store.get_status("b").await.unwrap().unwrap();
        let a = store.get_status("a").await.unwrap().unwrap();
        if a.created_at == b.created_at {
            assert_eq!(admitted, vec!["a".to_string()]);
        }
    }

    #[tokio::test]
    async fn reset_queue_assignment_returns_a_member_to_waiting() {
        let store = memory_store().await;
        let queue = Queue::new("q").with_concurrency(1);
        store.enqueue("a1", "demo", None, "q").await.unwrap();
        let admitted = store.start_queued_workflows(&queue, "exec-a").await.unwrap();
        assert_eq!(admitted, vec!["a1".to_string()]);

        assert!(store.reset_queue_assignment("a1").await.unwrap());
        let row = store.get_status("a1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Pending);
        assert!(row.executor_id.is_none());

        // Re-admittable on the next cycle.
        let admitted = store.start_queued_workflows(&queue, "exec-a").await.unwrap();
        assert_eq!(admitted, vec!["a1".to_string()]);
    }

    #[tokio::test]
    async fn pending_scan_filters_by_executor() {
        let store = memory_store().await;
        store
            .claim_workflow("wf-a", "demo", None, "exec-a", None, 50)
            .await
            .unwrap();
        store
            .claim_workflow("wf-b", "demo", None, "exec-b", None, 50)
            .await
            .unwrap();
        store
            .claim_workflow("wf-done", "demo", None, "exec-a", None, 50)
            .await
            .unwrap();
        store.finalize_success("wf-done", "null").await.unwrap();

        let mine = store
            .get_pending_workflows(&["exec-a".to_string()])
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].workflow_id, "wf-a");

        let all = store.get_pending_workflows(&[]).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn listing_filters_by_status_and_name() {
        let store = memory_store().await;
        store
            .claim_workflow("wf-a", "alpha", None, "exec-a", None, 50)
            .await
            .unwrap();
        store
            .claim_workflow("wf-b", "beta", None, "exec-a", None, 50)
            .await
            .unwrap();
        store.finalize_success("wf-b", "null").await.unwrap();

        let successes = store
            .list_workflows(&ListFilter {
                status: Some(WorkflowStatus::Success),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(successes, vec!["wf-b".to_string()]);

        let alphas = store
            .list_workflows(&ListFilter {
                name: Some("alpha".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alphas, vec!["wf-a".to_string()]);
    }
}
