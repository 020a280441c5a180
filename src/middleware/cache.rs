//! Response caching: a bounded LRU store with per-entry TTL, a static
//! route-to-TTL policy, and the axum layer that serves cache hits without
//! invoking the handler.
//!
//! Only successful GET responses with JSON bodies are cached. The cache key
//! covers the path, the sorted query parameters, and the caller's API key so
//! responses are never shared across callers.

use crate::{error::ApiError, server::AppState};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cached response material: body bytes, status, and a header snapshot.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Bytes,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedResponse,
    stored_at: Instant,
    expires_at: Instant,
    /// Recency tick, refreshed on both get and set touches.
    last_used: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct LruInner {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

/// Bounded key/value store with move-to-front-on-access eviction and lazy
/// expiry. Expired entries are also dropped wholesale by a periodic sweep.
#[derive(Debug)]
pub struct LruCache {
    inner: Mutex<LruInner>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cache statistics for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub current_size: usize,
    pub max_size: usize,
}

impl LruCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner::default()),
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an entry. A hit refreshes recency but not expiry; an expired
    /// entry is removed on access and reported as a miss. Returns the value
    /// and its age since insertion.
    pub fn get(&self, key: &str) -> Option<(CachedResponse, Duration)> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;

        match inner.entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                entry.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some((entry.value.clone(), now.duration_since(entry.stored_at)))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or overwrite an entry, refreshing recency. When the store would
    /// exceed capacity the least-recently-used entry is evicted.
    pub fn set(&self, key: String, value: CachedResponse, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                expires_at: now + ttl,
                last_used: tick,
            },
        );

        if inner.entries.len() > self.max_size {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
            }
        }
    }

    /// Remove all expired entries regardless of recency.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!("cleaned up {} expired cache entries", removed);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            current_size: self.len(),
            max_size: self.max_size,
        }
    }
}

/// Static route-to-TTL policy; exact match wins over prefix match.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    routes: Vec<(&'static str, u64)>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            routes: vec![
                ("/health", 60),
                ("/api/v1/monitoring/metrics/health", 30),
                ("/api/v1/upload/pdf", 300),
            ],
        }
    }
}

impl CachePolicy {
    pub fn ttl_for(&self, path: &str) -> Option<Duration> {
        if let Some((_, ttl)) = self.routes.iter().find(|(route, _)| *route == path) {
            return Some(Duration::from_secs(*ttl));
        }
        self.routes
            .iter()
            .find(|(route, _)| path.starts_with(route))
            .map(|(_, ttl)| Duration::from_secs(*ttl))
    }
}

/// LRU store plus policy, owned by the application state.
#[derive(Debug)]
pub struct ResponseCache {
    store: LruCache,
    policy: CachePolicy,
}

impl ResponseCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            store: LruCache::new(max_size),
            policy: CachePolicy::default(),
        }
    }

    pub fn store(&self) -> &LruCache {
        &self.store
    }

    pub fn ttl_for(&self, path: &str) -> Option<Duration> {
        self.policy.ttl_for(path)
    }

    /// Derive the cache key from path, sorted query pairs, and the caller's
    /// API key material.
    pub fn key_for(&self, path: &str, query: Option<&str>, api_key: &str) -> String {
        let mut pairs: Vec<(String, String)> = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        pairs.sort();

        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        for (k, v) in &pairs {
            hasher.update(b":");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        hasher.update(b":");
        hasher.update(api_key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Periodic expiry sweep, independent of access patterns. Runs until the
    /// token is cancelled.
    pub async fn run_sweeper(&self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.store.cleanup_expired(),
            }
        }
    }
}

/// Axum layer serving cache hits and populating the store on misses.
pub async fn cache_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if req.method() != Method::GET {
        return Ok(next.run(req).await);
    }

    let path = req.uri().path().to_string();
    let Some(ttl) = state.cache.ttl_for(&path) else {
        return Ok(next.run(req).await);
    };

    let api_key = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let key = state.cache.key_for(&path, req.uri().query(), &api_key);

    if let Some((cached, age)) = state.cache.store().get(&key) {
        debug!(path = %path, "cache hit");
        return Ok(rebuild_cached_response(cached, age));
    }

    let response = next.run(req).await;
    let status = response.status();
    if !status.is_success() {
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ApiError::internal(format!("failed to buffer response body: {}", e)))?;

    // Only JSON bodies are cacheable; anything else passes through untouched.
    if serde_json::from_slice::<serde_json::Value>(&body_bytes).is_err() {
        return Ok(Response::from_parts(parts, Body::from(body_bytes)));
    }

    let header_snapshot = snapshot_headers(&parts.headers);
    state.cache.store().set(
        key,
        CachedResponse {
            body: body_bytes.clone(),
            status: status.as_u16(),
            headers: header_snapshot,
        },
        ttl,
    );

    let mut response = Response::from_parts(parts, Body::from(body_bytes));
    let headers = response.headers_mut();
    headers.insert("x-cache", HeaderValue::from_static("MISS"));
    if let Ok(value) = HeaderValue::from_str(&format!("max-age={}", ttl.as_secs())) {
        headers.insert("x-cache-control", value);
    }
    Ok(response)
}

fn snapshot_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn rebuild_cached_response(cached: CachedResponse, age: Duration) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut response = (status, cached.body).into_response();
    let headers = response.headers_mut();
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<header::HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers.insert("x-cache", HeaderValue::from_static("HIT"));
    if let Ok(value) = HeaderValue::from_str(&age.as_secs().to_string()) {
        headers.insert("x-cache-age", value);
    }
    response
}
