//! Request metrics and performance monitoring.
//!
//! The collector keeps per-(method, route) counters and duration aggregates
//! plus an active-request gauge that is decremented exactly once per request
//! regardless of exit path. A companion background sampler records process
//! memory and retains a bounded list of recent slow operations.

use crate::server::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Duration above which an operation is considered slow.
const SLOW_OPERATION_THRESHOLD: Duration = Duration::from_secs(1);
/// Retained slow-operation records.
const MAX_SLOW_OPERATIONS: usize = 100;
/// Retained memory samples (one per sweep interval).
const MAX_MEMORY_SAMPLES: usize = 3600;
/// Memory level that triggers a warning, in bytes.
const HIGH_MEMORY_BYTES: u64 = 500 * 1024 * 1024;

#[derive(Debug, Default, Clone)]
struct RouteStats {
    count: u64,
    total_duration: Duration,
    errors: u64,
}

/// Per-route request metrics plus process-wide gauges.
#[derive(Debug)]
pub struct MetricsCollector {
    routes: Mutex<HashMap<String, RouteStats>>,
    active_requests: AtomicI64,
    started: Instant,
}

/// Read-side snapshot for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub active_requests: i64,
    pub request_count: HashMap<String, u64>,
    pub average_duration_ms: HashMap<String, f64>,
    pub error_count: HashMap<String, u64>,
    pub error_rate: f64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            active_requests: AtomicI64::new(0),
            started: Instant::now(),
        }
    }

    /// Record one completed request under its `(method, path)` key.
    pub fn record_request(&self, method: &str, path: &str, status: u16, duration: Duration) {
        let key = format!("{}:{}", method, path);
        let mut routes = self.routes.lock().expect("metrics lock poisoned");
        let stats = routes.entry(key).or_default();
        stats.count += 1;
        stats.total_duration += duration;
        if status >= 400 {
            stats.errors += 1;
        }
    }

    /// Increment the active gauge; the returned guard decrements it exactly
    /// once when dropped, covering success, handled error, and panic paths.
    pub fn begin_request(self: &Arc<Self>) -> ActiveRequestGuard {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        ActiveRequestGuard {
            collector: Arc::clone(self),
        }
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Overall error rate: errors / total requests, 0 when idle.
    pub fn error_rate(&self) -> f64 {
        let routes = self.routes.lock().expect("metrics lock poisoned");
        let total: u64 = routes.values().map(|s| s.count).sum();
        if total == 0 {
            return 0.0;
        }
        let errors: u64 = routes.values().map(|s| s.errors).sum();
        errors as f64 / total as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let routes = self.routes.lock().expect("metrics lock poisoned");

        let total_requests: u64 = routes.values().map(|s| s.count).sum();
        let total_errors: u64 = routes.values().map(|s| s.errors).sum();

        let mut request_count = HashMap::new();
        let mut average_duration_ms = HashMap::new();
        let mut error_count = HashMap::new();
        for (key, stats) in routes.iter() {
            request_count.insert(key.clone(), stats.count);
            if stats.count > 0 {
                average_duration_ms.insert(
                    key.clone(),
                    stats.total_duration.as_secs_f64() * 1000.0 / stats.count as f64,
                );
            }
            if stats.errors > 0 {
                error_count.insert(key.clone(), stats.errors);
            }
        }

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            total_requests,
            active_requests: self.active_requests(),
            request_count,
            average_duration_ms,
            error_count,
            error_rate: if total_requests > 0 {
                total_errors as f64 / total_requests as f64
            } else {
                0.0
            },
        }
    }

    /// Drop all per-route data. The active gauge and uptime are untouched;
    /// in-flight requests still decrement correctly.
    pub fn reset(&self) {
        self.routes.lock().expect("metrics lock poisoned").clear();
    }
}

/// Decrements the active-request gauge on drop.
pub struct ActiveRequestGuard {
    collector: Arc<MetricsCollector>,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.collector.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowOperation {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub rss_bytes: u64,
}

#[derive(Debug, Default)]
struct MonitorInner {
    slow_operations: VecDeque<SlowOperation>,
    memory_samples: VecDeque<MemorySample>,
}

/// Best-effort background monitor: periodic memory samples and a bounded
/// list of recent slow operations.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    inner: Mutex<MonitorInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub slow_operations_count: usize,
    pub recent_slow_operations: Vec<SlowOperation>,
    pub memory_rss_bytes: Option<u64>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation if it exceeded the slow threshold.
    pub fn record_slow(&self, operation: &str, duration: Duration) {
        if duration < SLOW_OPERATION_THRESHOLD {
            return;
        }
        warn!(
            "slow operation: {} took {:.2}s",
            operation,
            duration.as_secs_f64()
        );
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        if inner.slow_operations.len() == MAX_SLOW_OPERATIONS {
            inner.slow_operations.pop_front();
        }
        inner.slow_operations.push_back(SlowOperation {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            duration_seconds: duration.as_secs_f64(),
        });
    }

    fn sample_memory(&self) {
        let Some(rss) = process_rss_bytes() else {
            return;
        };
        if rss > HIGH_MEMORY_BYTES {
            warn!("high memory usage detected: {:.2}MB", rss as f64 / 1048576.0);
        }
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        if inner.memory_samples.len() == MAX_MEMORY_SAMPLES {
            inner.memory_samples.pop_front();
        }
        inner.memory_samples.push_back(MemorySample {
            timestamp: Utc::now(),
            rss_bytes: rss,
        });
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let inner = self.inner.lock().expect("monitor lock poisoned");
        PerformanceSnapshot {
            slow_operations_count: inner.slow_operations.len(),
            recent_slow_operations: inner
                .slow_operations
                .iter()
                .rev()
                .take(10)
                .cloned()
                .collect(),
            memory_rss_bytes: inner.memory_samples.back().map(|s| s.rss_bytes),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        inner.slow_operations.clear();
        inner.memory_samples.clear();
    }

    /// Periodic memory sampler; runs until cancelled.
    pub async fn run_sampler(&self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.sample_memory(),
            }
        }
    }
}

/// Resident set size of the current process, when the platform exposes it.
fn process_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(rss_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Paths excluded from monitoring: health probes would skew duration stats
/// and streaming responses complete long after the handler returns.
fn is_exempt(path: &str) -> bool {
    path == "/health" || path == "/metrics" || path.ends_with("/stream")
}

/// Axum layer timing every governed request and maintaining the gauge.
pub async fn monitoring_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if is_exempt(&path) {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let guard = state.metrics.begin_request();

    info!("request started: {} {}", method, path);

    let mut response = next.run(req).await;
    let duration = start.elapsed();

    state
        .metrics
        .record_request(&method, &path, response.status().as_u16(), duration);
    state
        .perf
        .record_slow(&format!("{} {}", method, path), duration);
    drop(guard);

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{:.2}ms", duration.as_secs_f64() * 1000.0)) {
        headers.insert("x-response-time", value);
    }

    info!(
        "request completed: {} {} - status: {} - duration: {:.2}ms",
        method,
        path,
        response.status().as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_returns_to_baseline_after_any_outcome() {
        let collector = Arc::new(MetricsCollector::new());
        assert_eq!(collector.active_requests(), 0);

        {
            let _guard = collector.begin_request();
            assert_eq!(collector.active_requests(), 1);
        }
        assert_eq!(collector.active_requests(), 0);

        // Guard drops during unwinding too.
        let collector_clone = Arc::clone(&collector);
        let result = std::panic::catch_unwind(move || {
            let _guard = collector_clone.begin_request();
            panic!("handler crashed");
        });
        assert!(result.is_err());
        assert_eq!(collector.active_requests(), 0);
    }

    #[test]
    fn error_rate_is_zero_when_idle() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.error_rate(), 0.0);
    }

    #[test]
    fn per_route_aggregation() {
        let collector = MetricsCollector::new();
        collector.record_request("GET", "/health", 200, Duration::from_millis(10));
        collector.record_request("GET", "/health", 200, Duration::from_millis(30));
        collector.record_request("POST", "/api/v1/chat/message", 500, Duration::from_millis(50));

        let snap = collector.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.request_count["GET:/health"], 2);
        assert!((snap.average_duration_ms["GET:/health"] - 20.0).abs() < 1.0);
        assert_eq!(snap.error_count["POST:/api/v1/chat/message"], 1);
        assert!((snap.error_rate - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_clears_routes() {
        let collector = MetricsCollector::new();
        collector.record_request("GET", "/health", 200, Duration::from_millis(10));
        collector.reset();
        assert_eq!(collector.snapshot().total_requests, 0);
    }

    #[test]
    fn slow_operations_are_bounded_and_thresholded() {
        let monitor = PerformanceMonitor::new();
        monitor.record_slow("fast op", Duration::from_millis(10));
        assert_eq!(monitor.snapshot().slow_operations_count, 0);

        for i in 0..150 {
            monitor.record_slow(&format!("op {}", i), Duration::from_secs(2));
        }
        let snap = monitor.snapshot();
        assert_eq!(snap.slow_operations_count, MAX_SLOW_OPERATIONS);
        assert_eq!(snap.recent_slow_operations[0].operation, "op 149");
    }

    #[test]
    fn exempt_paths() {
        assert!(is_exempt("/health"));
        assert!(is_exempt("/api/v1/chat/stream"));
        assert!(!is_exempt("/api/v1/chat/message"));
    }
}
