// ============================================================================
// Admin Routes
// ============================================================================
//
// Endpoints (all scoped to one destination):
// - GET    /admin/queues/{destination}/health
// - POST   /admin/queues/{destination}/reset-to-latest
// - POST   /admin/queues/{destination}/reset-to-begin
// - DELETE /admin/queues/{destination}/destroy-recreate
// - POST   /admin/queues/{destination}/claim-pending-to-worker
// - GET    /admin/queues/{destination}/dlq?count=N
// - POST   /admin/queues/{destination}/dlq/{id}/requeue
// - DELETE /admin/queues/{destination}/dlq/{id}
//
// ============================================================================

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::context::AppContext;
use crate::error::{AppError, from_anyhow};
use crate::message::EntryId;

const DEFAULT_DLQ_PAGE: usize = 50;
const MAX_DLQ_PAGE: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub count: Option<usize>,
}

fn parse_dlq_id(raw: &str) -> Result<EntryId, AppError> {
    raw.parse()
        .map_err(|_| AppError::validation(format!("invalid DLQ entry id '{}'", raw)))
}

/// GET /admin/queues/{destination}/health
pub async fn queue_health(
    State(app_context): State<Arc<AppContext>>,
    Path(destination): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let health = app_context
        .control
        .health(&destination)
        .await
        .map_err(from_anyhow)?;
    Ok(Json(health))
}

/// POST /admin/queues/{destination}/reset-to-latest
pub async fn reset_to_latest(
    State(app_context): State<Arc<AppContext>>,
    Path(destination): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    app_context
        .control
        .reset_to_latest(&destination)
        .await
        .map_err(from_anyhow)?;
    Ok(Json(json!({ "status": "ok", "destination": destination, "cursor": "latest" })))
}

/// POST /admin/queues/{destination}/reset-to-begin
pub async fn reset_to_begin(
    State(app_context): State<Arc<AppContext>>,
    Path(destination): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    app_context
        .control
        .reset_to_begin(&destination)
        .await
        .map_err(from_anyhow)?;
    Ok(Json(json!({ "status": "ok", "destination": destination, "cursor": "begin" })))
}

/// DELETE /admin/queues/{destination}/destroy-recreate
pub async fn destroy_recreate(
    State(app_context): State<Arc<AppContext>>,
    Path(destination): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    app_context
        .control
        .destroy_recreate(&destination)
        .await
        .map_err(from_anyhow)?;
    Ok(Json(json!({ "status": "ok", "destination": destination })))
}

/// POST /admin/queues/{destination}/claim-pending-to-worker
pub async fn claim_pending_to_worker(
    State(app_context): State<Arc<AppContext>>,
    Path(destination): Path<String>,
    Json(request): Json<ClaimRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.worker_id.trim().is_empty() {
        return Err(AppError::validation("worker_id must not be empty"));
    }

    let report = app_context
        .control
        .force_claim(&destination, &request.worker_id)
        .await
        .map_err(from_anyhow)?;
    Ok(Json(report))
}

/// GET /admin/queues/{destination}/dlq?count=N
pub async fn list_dlq(
    State(app_context): State<Arc<AppContext>>,
    Path(destination): Path<String>,
    Query(query): Query<DlqQuery>,
) -> Result<impl IntoResponse, AppError> {
    let count = query.count.unwrap_or(DEFAULT_DLQ_PAGE).clamp(1, MAX_DLQ_PAGE);
    let records = app_context
        .dead_letters
        .list(&destination, count)
        .await
        .map_err(from_anyhow)?;
    Ok(Json(json!({ "destination": destination, "entries": records })))
}

/// POST /admin/queues/{destination}/dlq/{id}/requeue
pub async fn requeue_dlq(
    State(app_context): State<Arc<AppContext>>,
    Path((destination, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let dlq_id = parse_dlq_id(&id)?;
    let requeued = app_context
        .dead_letters
        .requeue(&destination, dlq_id)
        .await
        .map_err(from_anyhow)?
        .ok_or_else(|| AppError::not_found(format!("DLQ entry {}", dlq_id)))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "requeued",
            "dlq_id": requeued.dlq_id,
            "entry_id": requeued.entry_id,
        })),
    ))
}

/// DELETE /admin/queues/{destination}/dlq/{id}
pub async fn discard_dlq(
    State(app_context): State<Arc<AppContext>>,
    Path((destination, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let dlq_id = parse_dlq_id(&id)?;
    let removed = app_context
        .dead_letters
        .discard(&destination, dlq_id)
        .await
        .map_err(from_anyhow)?;
    if !removed {
        return Err(AppError::not_found(format!("DLQ entry {}", dlq_id)));
    }
    Ok(StatusCode::NO_CONTENT)
}
