//! Per-identity rate limiting with named budgets.
//!
//! Identities are partitioned by a stable suffix of the caller's API key,
//! falling back to the remote address. Each route class draws from a named
//! budget expressed as a `"<count>/<unit>"` quota string; counts live in
//! fixed windows that reset exactly at window boundaries.

use crate::{error::ApiError, server::AppState};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Named quota: count per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub window: Duration,
}

impl Quota {
    /// Parse a quota string of the form `"<count>/<unit>"`, e.g. `50/minute`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (count, unit) = spec
            .split_once('/')
            .ok_or_else(|| format!("invalid quota spec: {}", spec))?;
        let limit: u32 = count
            .trim()
            .parse()
            .map_err(|_| format!("invalid quota count in: {}", spec))?;
        let window = match unit.trim() {
            "second" => Duration::from_secs(1),
            "minute" => Duration::from_secs(60),
            "hour" => Duration::from_secs(3600),
            "day" => Duration::from_secs(86400),
            other => return Err(format!("unknown quota unit: {}", other)),
        };
        Ok(Self { limit, window })
    }
}

#[derive(Debug)]
struct RateWindow {
    count: u32,
    started: Instant,
    started_unix: u64,
}

/// Outcome of a rate-limit check, carrying everything the response headers
/// need on both the allowed and denied paths.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp at which the current window resets.
    pub reset: u64,
    pub retry_after: u64,
}

/// Statistics for the monitoring surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub active_identities: usize,
    pub budgets: HashMap<String, String>,
}

/// Fixed-window limiter keyed by (identity, budget).
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<(String, String), RateWindow>,
    budgets: HashMap<&'static str, Quota>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Build the limiter with the gateway's static budget table.
    pub fn new() -> Self {
        let mut budgets = HashMap::new();
        for (name, spec) in [
            ("default", "100/minute"),
            ("upload", "10/minute"),
            ("chat", "50/minute"),
            ("health", "1000/minute"),
        ] {
            budgets.insert(name, Quota::parse(spec).expect("static quota spec"));
        }
        Self {
            windows: DashMap::new(),
            budgets,
        }
    }

    /// Build a limiter with a custom budget table. A `"default"` budget must
    /// be present.
    pub fn with_budgets(budgets: HashMap<&'static str, Quota>) -> Self {
        assert!(budgets.contains_key("default"), "missing default budget");
        Self {
            windows: DashMap::new(),
            budgets,
        }
    }

    fn quota(&self, budget: &str) -> Quota {
        self.budgets
            .get(budget)
            .copied()
            .unwrap_or_else(|| self.budgets["default"])
    }

    /// Check and increment the window for `identity` under `budget`. The
    /// DashMap entry guard serializes concurrent updates to one identity, so
    /// no increment is ever lost.
    pub fn check(&self, identity: &str, budget: &str) -> Decision {
        let quota = self.quota(budget);
        let now = Instant::now();
        let now_unix = unix_now();

        let mut window = self
            .windows
            .entry((identity.to_string(), budget.to_string()))
            .or_insert_with(|| RateWindow {
                count: 0,
                started: now,
                started_unix: now_unix,
            });

        if now.duration_since(window.started) >= quota.window {
            window.count = 0;
            window.started = now;
            window.started_unix = now_unix;
        }

        let window_secs = quota.window.as_secs();
        let reset = window.started_unix + window_secs;

        if window.count < quota.limit {
            window.count += 1;
            Decision {
                allowed: true,
                limit: quota.limit,
                remaining: quota.limit - window.count,
                reset,
                retry_after: 0,
            }
        } else {
            let elapsed = now.duration_since(window.started).as_secs();
            Decision {
                allowed: false,
                limit: quota.limit,
                remaining: 0,
                reset,
                retry_after: window_secs.saturating_sub(elapsed).max(1),
            }
        }
    }

    /// Drop windows idle for more than two window lengths. The original
    /// design let the identity map grow without bound; this sweep bounds it.
    pub fn sweep_stale(&self) {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|(_, budget), window| {
            let quota = self.quota(budget);
            now.duration_since(window.started) < quota.window * 2
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!("swept {} stale rate windows", removed);
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            active_identities: self.windows.len(),
            budgets: self
                .budgets
                .iter()
                .map(|(name, q)| {
                    (
                        name.to_string(),
                        format!("{}/{}s", q.limit, q.window.as_secs()),
                    )
                })
                .collect(),
        }
    }

    /// Periodic stale-window sweep; runs until cancelled.
    pub async fn run_sweeper(&self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.sweep_stale(),
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Route class for budget selection.
pub fn budget_for_path(path: &str) -> &'static str {
    if path == "/health"
        || path.starts_with("/api/v1/health")
        || path.ends_with("/metrics/health")
    {
        "health"
    } else if path.starts_with("/api/v1/upload") {
        "upload"
    } else if path.starts_with("/api/v1/chat") {
        "chat"
    } else {
        "default"
    }
}

/// Resolve the caller identity: prefer the API-key suffix (avoids storing
/// full secrets while partitioning per caller), fall back to remote address.
pub fn identity_for_request(req: &Request) -> String {
    if let Some(key) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
    {
        // Keys are ASCII in practice, but stay boundary-safe for arbitrary
        // header values.
        let skip = key.chars().count().saturating_sub(8);
        let suffix: String = key.chars().skip(skip).collect();
        return format!("api_key:{}", suffix);
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Axum layer enforcing the budget for each request and stamping rate-limit
/// headers on allowed responses as well as denials.
pub async fn rate_limit_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let budget = budget_for_path(req.uri().path());
    let identity = identity_for_request(&req);
    let decision = state.limiter.check(&identity, budget);

    if !decision.allowed {
        debug!(identity = %identity, budget = %budget, "rate limit denied");
        return Err(ApiError::RateLimited {
            message: format!("{} per window for budget '{}'", decision.limit, budget),
            limit: decision.limit,
            reset: decision.reset,
            retry_after: decision.retry_after,
        });
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset));
    Ok(response)
}
