//! HTTP server assembly: routes, middleware ordering, and shared state.
//!
//! The governance stack wraps every route. Layer order matters: the
//! outermost layers (compression, tracing, CORS) see the raw exchange,
//! validation and rate limiting reject early, error tracking and monitoring
//! observe whatever the inner layers produce, and the cache sits closest to
//! the handlers so hits skip only handler work while still being governed.

pub mod admin;
pub mod handlers;
pub mod state;

pub use state::AppState;

use crate::middleware::{
    cache_layer, error_tracking_layer, monitoring_layer, rate_limit_layer, validation_layer,
};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

/// Build the full application router with the governance stack applied.
pub fn create_router(state: AppState) -> Router {
    let max_body = state.config.max_upload_size_bytes();

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/health/status", get(handlers::health_status))
        .route("/api/v1/health/ready", get(handlers::readiness))
        .route("/api/v1/upload/pdf", post(handlers::upload_pdf))
        .route(
            "/api/v1/upload/pdf/{file_id}/status",
            get(handlers::upload_status),
        )
        .route("/api/v1/chat/message", post(handlers::chat_message))
        .route("/api/v1/chat/stream", post(handlers::chat_stream))
        .route(
            "/api/v1/chat/history/{file_id}",
            delete(handlers::clear_history),
        )
        .route("/api/v1/monitoring/metrics", get(admin::metrics))
        .route(
            "/api/v1/monitoring/metrics/health",
            get(admin::metrics_health),
        )
        .route("/api/v1/monitoring/metrics/reset", post(admin::metrics_reset))
        .route("/api/v1/errors/summary", get(admin::errors_summary))
        .route("/api/v1/errors/recent", get(admin::errors_recent))
        .route("/api/v1/errors/patterns", get(admin::errors_patterns))
        .route("/api/v1/errors/stats", get(admin::errors_stats))
        .route("/api/v1/errors/details/{error_id}", get(admin::error_details))
        .route("/api/v1/errors/clear", post(admin::errors_clear))
        .route("/api/v1/cache/clear", post(admin::cache_clear))
        .route("/api/v1/cache/stats", get(admin::cache_stats))
        .layer(
            ServiceBuilder::new()
                .layer(CompressionLayer::new())
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    validation_layer,
                ))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    rate_limit_layer,
                ))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    error_tracking_layer,
                ))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    monitoring_layer,
                ))
                .layer(middleware::from_fn_with_state(state.clone(), cache_layer)),
        )
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}
