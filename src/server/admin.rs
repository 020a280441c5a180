//! Operational endpoints: metrics, error inspection, and cache control.

use crate::{
    error::ApiError,
    middleware::error_tracking::{ErrorRecord, ErrorSummary, TopError},
    server::{handlers::ApiKey, AppState},
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;

/// Error rate above which the health probe reports degraded.
const DEGRADED_ERROR_RATE: f64 = 0.1;

/// Full metrics payload for dashboards.
pub async fn metrics(State(state): State<AppState>, _auth: ApiKey) -> Json<serde_json::Value> {
    Json(json!({
        "metrics": state.metrics.snapshot(),
        "performance": state.perf.snapshot(),
        "rate_limiter": state.limiter.stats(),
        "cache": state.cache.store().stats(),
    }))
}

/// Lightweight health view of the metrics system. Unauthenticated so load
/// balancers can probe it.
pub async fn metrics_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot();
    let status = if snapshot.error_rate > DEGRADED_ERROR_RATE {
        "degraded"
    } else {
        "healthy"
    };
    Json(json!({
        "status": status,
        "uptime_seconds": snapshot.uptime_seconds,
        "active_requests": snapshot.active_requests,
        "error_rate": snapshot.error_rate,
    }))
}

/// Zero all per-route counters and performance data.
pub async fn metrics_reset(State(state): State<AppState>, _auth: ApiKey) -> Json<serde_json::Value> {
    state.metrics.reset();
    state.perf.reset();
    Json(json!({ "message": "metrics reset" }))
}

pub async fn errors_summary(State(state): State<AppState>, _auth: ApiKey) -> Json<ErrorSummary> {
    Json(state.errors.summary())
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
    pub kind: Option<String>,
}

pub async fn errors_recent(
    State(state): State<AppState>,
    _auth: ApiKey,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<ErrorRecord>> {
    let limit = query.limit.unwrap_or(20).min(100);
    Json(state.errors.recent(limit, query.kind.as_deref()))
}

#[derive(Debug, Deserialize)]
pub struct PatternsQuery {
    pub limit: Option<usize>,
}

pub async fn errors_patterns(
    State(state): State<AppState>,
    _auth: ApiKey,
    Query(query): Query<PatternsQuery>,
) -> Json<Vec<TopError>> {
    let limit = query.limit.unwrap_or(20).min(100);
    Json(state.errors.patterns(limit))
}

pub async fn error_details(
    State(state): State<AppState>,
    _auth: ApiKey,
    Path(error_id): Path<String>,
) -> Result<Json<ErrorRecord>, ApiError> {
    state
        .errors
        .details(&error_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("error not found: {}", error_id)))
}

/// Aggregate error statistics: the summary plus per-kind and per-endpoint
/// breakdowns and the hourly projection of the current rate.
pub async fn errors_stats(State(state): State<AppState>, _auth: ApiKey) -> Json<serde_json::Value> {
    let summary = state.errors.summary();
    let stats = state.errors.stats();
    let per_minute = summary.error_rate_per_minute;
    Json(json!({
        "summary": summary,
        "by_kind": stats.by_kind,
        "by_endpoint": stats.by_endpoint,
        "error_rate": {
            "per_minute": per_minute,
            "per_hour": per_minute * 60.0,
        },
    }))
}

pub async fn errors_clear(State(state): State<AppState>, _auth: ApiKey) -> Json<serde_json::Value> {
    let cleared = state.errors.len();
    state.errors.clear();
    Json(json!({ "message": "error history cleared", "cleared": cleared }))
}

pub async fn cache_clear(State(state): State<AppState>, _auth: ApiKey) -> Json<serde_json::Value> {
    let cleared = state.cache.store().len();
    state.cache.store().clear();
    Json(json!({ "message": "cache cleared", "cleared": cleared }))
}

pub async fn cache_stats(
    State(state): State<AppState>,
    _auth: ApiKey,
) -> Json<crate::middleware::cache::CacheStats> {
    Json(state.cache.store().stats())
}
