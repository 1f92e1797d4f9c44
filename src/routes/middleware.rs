// ============================================================================
// Axum Middleware
// ============================================================================
//
// Middleware for request processing:
// - request_logging: Log all incoming requests
// - require_bearer_token: Guard admin and producer routes
//
// ============================================================================

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::context::AppContext;
use crate::error::AppError;
use subtle::ConstantTimeEq;

/// Request logging middleware
pub async fn request_logging(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    tracing::debug!(
        method = %method,
        path = %path,
        "Incoming request"
    );

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = duration.as_millis(),
        "Request completed"
    );

    response
}

/// Bearer token guard
///
/// When `ADMIN_BEARER_TOKEN` is unset every request passes; otherwise the
/// `Authorization: Bearer <token>` header must match (constant-time compare).
pub async fn require_bearer_token(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected_token) = &ctx.config.admin.bearer_token else {
        return Ok(next.run(req).await);
    };

    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected_token.as_bytes())));

    if !authorized {
        tracing::warn!(
            path = %req.uri().path(),
            "Unauthorized admin access attempt"
        );
        return Err(AppError::auth("a valid bearer token is required"));
    }

    Ok(next.run(req).await)
}
