// ============================================================================
// Axum Routes Module
// ============================================================================
//
// HTTP surface of the delivery worker process.
//
// Structure:
// - mod.rs: Main router assembly and middleware
// - health.rs: Liveness and Prometheus metrics
// - admin.rs: Queue control plane and DLQ management
// - messages.rs: Producer enqueue endpoint
// - middleware.rs: Request logging, bearer-token guard
//
// ============================================================================

mod admin;
mod health;
mod messages;
mod middleware;

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;

/// Create the main application router with all routes
pub fn create_router(app_context: Arc<AppContext>) -> Router {
    // Operator and producer routes (bearer token, when configured)
    let guarded = Router::new()
        .route(
            "/admin/queues/{destination}/health",
            get(admin::queue_health),
        )
        .route(
            "/admin/queues/{destination}/reset-to-latest",
            post(admin::reset_to_latest),
        )
        .route(
            "/admin/queues/{destination}/reset-to-begin",
            post(admin::reset_to_begin),
        )
        .route(
            "/admin/queues/{destination}/destroy-recreate",
            delete(admin::destroy_recreate),
        )
        .route(
            "/admin/queues/{destination}/claim-pending-to-worker",
            post(admin::claim_pending_to_worker),
        )
        .route("/admin/queues/{destination}/dlq", get(admin::list_dlq))
        .route(
            "/admin/queues/{destination}/dlq/{id}/requeue",
            post(admin::requeue_dlq),
        )
        .route(
            "/admin/queues/{destination}/dlq/{id}",
            delete(admin::discard_dlq),
        )
        .route(
            "/api/v1/queues/{destination}/messages",
            post(messages::enqueue_message),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            app_context.clone(),
            middleware::require_bearer_token,
        ));

    Router::new()
        // Health and monitoring (no auth)
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        .merge(guarded)
        // Apply middleware (order matters - last added runs first)
        .layer(
            ServiceBuilder::new()
                // Tracing layer (outermost - runs first)
                .layer(TraceLayer::new_for_http())
                // Request logging
                .layer(axum::middleware::from_fn(middleware::request_logging))
                .into_inner(),
        )
        .with_state(app_context)
}
