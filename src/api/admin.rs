/// Control-plane HTTP endpoints
///
/// Binds the engine's control operations to an axum router: health check,
/// deactivation, queue metadata, recovery, and per-workflow cancel /
/// resume / restart plus listing and status lookup. Failures map onto
/// structured 4xx responses; a bad request never crashes the host process.
/// All responses carry permissive CORS headers so browser-based operator
/// tooling can call the surface directly.

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use crate::error::EngineError;
use crate::queue::QueueMetadata;
use crate::runtime::{CronSchedulerService, WorkflowEngine};
use crate::store::{ListFilter, StatusRow, WorkflowStatus};

/// Shared state for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<WorkflowEngine>,
    pub scheduler: Arc<CronSchedulerService>,
}

type ApiError = (StatusCode, Json<Value>);

fn engine_error_response(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::NotFound(_)
        | EngineError::NotRegistered(_)
        | EngineError::UnknownQueue(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidState { .. }
        | EngineError::DuplicateExecution(_)
        | EngineError::ConflictingName { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

/// Build the admin router with all control-plane routes and CORS.
pub fn create_admin_router(state: AdminState) -> Router {
    // Reflect the request origin and headers; operator dashboards run in
    // browsers on arbitrary hosts.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::PUT,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .max_age(Duration::from_secs(86400));

    Router::new()
        .route("/healthz", get(health_check))
        .route("/deactivate", get(deactivate))
        .route("/workflow-queues-metadata", get(queue_metadata))
        .route("/workflow-recovery", post(recover_workflows))
        .route("/workflows", get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/resume", post(resume_workflow))
        .route("/workflows/{id}/restart", post(restart_workflow))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> &'static str {
    "healthy"
}

/// Cooperative shutdown of the background loops (queue dispatch and
/// scheduled triggers). In-flight executions are left to finish.
async fn deactivate(State(state): State<AdminState>) -> &'static str {
    state.engine.deactivate();
    if let Err(err) = state.scheduler.stop().await {
        tracing::warn!("failed to stop the cron scheduler: {}", err);
    }
    "deactivated"
}

async fn queue_metadata(State(state): State<AdminState>) -> Json<Vec<QueueMetadata>> {
    Json(state.engine.queue_metadata())
}

/// Recover pending workflows for the given executor ids (empty = all).
/// Returns the identifiers that were re-submitted.
async fn recover_workflows(
    State(state): State<AdminState>,
    Json(executor_ids): Json<Vec<String>>,
) -> Result<Json<Vec<String>>, ApiError> {
    tracing::info!("recovering workflows for executors: {:?}", executor_ids);
    let handles = state
        .engine
        .recover_pending(&executor_ids)
        .await
        .map_err(engine_error_response)?;
    Ok(Json(
        handles
            .iter()
            .map(|handle| handle.workflow_id().to_string())
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    name: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    #[serde(default)]
    sort_desc: bool,
}

async fn list_workflows(
    State(state): State<AdminState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(WorkflowStatus::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown status '{raw}'") })),
            )
        })?),
        None => None,
    };
    let filter = ListFilter {
        status,
        name: query.name,
        limit: query.limit,
        offset: query.offset,
        sort_desc: query.sort_desc,
    };
    let ids = state
        .engine
        .list_workflows(&filter)
        .await
        .map_err(engine_error_response)?;
    Ok(Json(ids))
}

async fn get_workflow(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<StatusRow>, ApiError> {
    match state.engine.get_status(&id).await {
        Ok(Some(row)) => Ok(Json(row)),
        Ok(None) => Err(engine_error_response(EngineError::NotFound(id))),
        Err(err) => Err(engine_error_response(err)),
    }
}

async fn cancel_workflow(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .cancel(&id)
        .await
        .map_err(engine_error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_workflow(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .resume(&id)
        .await
        .map_err(engine_error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_workflow(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let new_id = state
        .engine
        .restart(&id)
        .await
        .map_err(engine_error_response)?;
    tracing::info!("restart of {} submitted as {}", id, new_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Unmatched paths return a JSON error body, matching the rest of the
/// surface.
async fn not_found() -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not Found" })))
}
