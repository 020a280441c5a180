//! Error tracking with fingerprint-based grouping.
//!
//! Failures that escape a handler are recorded into a bounded ring buffer
//! together with a sanitized snapshot of the request. Recurring failures are
//! grouped under a fingerprint derived from the error kind and its
//! application-level origin frames, with framework frames filtered out so
//! grouping reflects fault location rather than library internals.

use crate::{error::TrackedError, server::AppState};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};
use tracing::error;

const REDACTED: &str = "[REDACTED]";
const SENSITIVE_HEADERS: [&str; 4] = ["authorization", "x-api-key", "cookie", "set-cookie"];

/// Frames belonging to the HTTP framework or runtime rather than the
/// application; these never contribute to fingerprints.
const FRAMEWORK_FRAME_MARKERS: [&str; 5] = ["axum", "tower", "hyper", "tokio", "/registry/"];

/// Sanitized view of the request an error occurred on.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub client_host: Option<String>,
}

impl RequestSnapshot {
    /// Capture a request, redacting sensitive headers.
    pub fn capture(req: &Request) -> Self {
        let query_params = req
            .uri()
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let headers = req
            .headers()
            .iter()
            .map(|(name, value)| {
                let name = name.as_str().to_lowercase();
                let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                    REDACTED.to_string()
                } else {
                    value.to_str().unwrap_or("<binary>").to_string()
                };
                (name, value)
            })
            .collect();

        let client_host = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query_params,
            headers,
            client_host,
        }
    }
}

/// One tracked error occurrence; immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub fingerprint: String,
    pub request: RequestSnapshot,
    pub frames: Vec<String>,
    pub duration_ms: f64,
}

/// Aggregate for one distinct fingerprint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPattern {
    pub kind: String,
    pub message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub sample_frames: Vec<String>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    records: VecDeque<ErrorRecord>,
    patterns: HashMap<String, ErrorPattern>,
}

/// Bounded error store. All three views (ring buffer, pattern map, counters)
/// live behind one mutex so `clear` is atomic from the caller's perspective.
#[derive(Debug)]
pub struct ErrorTracker {
    inner: Mutex<TrackerInner>,
    max_records: usize,
    sequence: AtomicU64,
}

/// Read-side summary payload.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub unique_errors: usize,
    pub recent_errors: Vec<ErrorRecord>,
    pub top_errors: Vec<TopError>,
    pub error_rate_per_minute: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopError {
    pub fingerprint: String,
    pub count: u64,
    pub details: ErrorPattern,
}

/// Aggregate counts for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub by_kind: HashMap<String, u64>,
    pub by_endpoint: HashMap<String, u64>,
}

impl ErrorTracker {
    pub fn new(max_records: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            max_records,
            sequence: AtomicU64::new(0),
        }
    }

    /// Record one error occurrence and upsert its pattern.
    pub fn track(
        &self,
        request: RequestSnapshot,
        kind: &str,
        message: &str,
        frames: Vec<String>,
        duration: Duration,
    ) {
        let fingerprint = fingerprint(kind, &frames);
        let now = Utc::now();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let record = ErrorRecord {
            id: format!("{}-{}", now.timestamp_millis(), seq),
            timestamp: now,
            kind: kind.to_string(),
            message: message.to_string(),
            fingerprint: fingerprint.clone(),
            request,
            frames: frames.clone(),
            duration_ms: duration.as_secs_f64() * 1000.0,
        };

        error!(
            "error tracked: {} - {} [{} {}] - duration: {:.2}ms",
            kind, message, record.request.method, record.request.path, record.duration_ms
        );

        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if inner.records.len() == self.max_records {
            inner.records.pop_front();
        }
        inner.records.push_back(record);

        inner
            .patterns
            .entry(fingerprint)
            .and_modify(|pattern| {
                pattern.last_seen = now;
                pattern.count += 1;
            })
            .or_insert_with(|| ErrorPattern {
                kind: kind.to_string(),
                message: message.to_string(),
                first_seen: now,
                last_seen: now,
                count: 1,
                sample_frames: frames,
            });
    }

    /// Summary of tracked errors: totals, the 10 most recent records, the 10
    /// most frequent fingerprints, and the error rate per minute over the
    /// trailing 5 minutes.
    pub fn summary(&self) -> ErrorSummary {
        let inner = self.inner.lock().expect("tracker lock poisoned");

        let recent_errors: Vec<ErrorRecord> = inner
            .records
            .iter()
            .rev()
            .take(10)
            .rev()
            .cloned()
            .collect();

        let mut top_errors: Vec<TopError> = inner
            .patterns
            .iter()
            .map(|(fp, pattern)| TopError {
                fingerprint: fp.clone(),
                count: pattern.count,
                details: pattern.clone(),
            })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count));
        top_errors.truncate(10);

        let five_minutes_ago = Utc::now() - chrono::Duration::minutes(5);
        let recent_count = inner
            .records
            .iter()
            .filter(|r| r.timestamp > five_minutes_ago)
            .count();

        ErrorSummary {
            total_errors: inner.records.len(),
            unique_errors: inner.patterns.len(),
            recent_errors,
            top_errors,
            error_rate_per_minute: recent_count as f64 / 5.0,
        }
    }

    /// Look up a single record by id.
    pub fn details(&self, id: &str) -> Option<ErrorRecord> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner.records.iter().find(|r| r.id == id).cloned()
    }

    /// Most recent records, newest first, optionally filtered by kind.
    pub fn recent(&self, limit: usize, kind: Option<&str>) -> Vec<ErrorRecord> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner
            .records
            .iter()
            .rev()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Patterns sorted by occurrence count, most frequent first.
    pub fn patterns(&self, limit: usize) -> Vec<TopError> {
        let mut all = self.summary_patterns();
        all.truncate(limit);
        all
    }

    fn summary_patterns(&self) -> Vec<TopError> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let mut patterns: Vec<TopError> = inner
            .patterns
            .iter()
            .map(|(fp, pattern)| TopError {
                fingerprint: fp.clone(),
                count: pattern.count,
                details: pattern.clone(),
            })
            .collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        patterns
    }

    /// Aggregate counts by error kind and by originating endpoint, computed
    /// over the retained records.
    pub fn stats(&self) -> ErrorStats {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let mut by_kind: HashMap<String, u64> = HashMap::new();
        let mut by_endpoint: HashMap<String, u64> = HashMap::new();
        for record in &inner.records {
            *by_kind.entry(record.kind.clone()).or_default() += 1;
            let endpoint = format!("{} {}", record.request.method, record.request.path);
            *by_endpoint.entry(endpoint).or_default() += 1;
        }
        ErrorStats {
            by_kind,
            by_endpoint,
        }
    }

    /// Reset all stores in one step.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        inner.records.clear();
        inner.patterns.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("tracker lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Group key: hash of the error kind and the first application-level frames.
fn fingerprint(kind: &str, frames: &[String]) -> String {
    let meaningful: Vec<&String> = frames
        .iter()
        .filter(|frame| {
            !FRAMEWORK_FRAME_MARKERS
                .iter()
                .any(|marker| frame.contains(marker))
        })
        .take(5)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    for frame in meaningful {
        hasher.update(b":");
        hasher.update(frame.as_bytes());
    }
    let digest = hasher.finalize();
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

/// Axum layer recording failures that escaped the handler. The error context
/// travels on the response extensions, placed there by
/// [`crate::error::ApiError`]'s `IntoResponse` impl.
pub async fn error_tracking_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let snapshot = RequestSnapshot::capture(&req);
    let start = Instant::now();

    let response = next.run(req).await;

    if let Some(tracked) = response.extensions().get::<TrackedError>() {
        state.errors.track(
            snapshot,
            &tracked.kind,
            &tracked.message,
            tracked.frames.clone(),
            start.elapsed(),
        );
    }
    response
}
