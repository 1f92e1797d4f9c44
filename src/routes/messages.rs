// ============================================================================
// Messages Routes
// ============================================================================
//
// Endpoints:
// - POST /api/v1/queues/{destination}/messages - Enqueue an outbound message
//
// A duplicate message_id within the idempotency TTL is not an error: the
// response is still 202 with status "duplicate" and the prior entry id.
//
// ============================================================================

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use std::sync::Arc;

use crate::context::AppContext;
use crate::delivery_worker::EnqueueOutcome;
use crate::error::AppError;
use crate::message::{EntryId, NewMessage};

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    status: &'static str,
    entry_id: EntryId,
}

/// POST /api/v1/queues/{destination}/messages
pub async fn enqueue_message(
    State(app_context): State<Arc<AppContext>>,
    Path(destination): Path<String>,
    Json(message): Json<NewMessage>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = app_context.queue.enqueue(&destination, message).await?;

    let status = match outcome {
        EnqueueOutcome::Enqueued { .. } => "enqueued",
        EnqueueOutcome::Duplicate { .. } => "duplicate",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            status,
            entry_id: outcome.entry_id(),
        }),
    ))
}
