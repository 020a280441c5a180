//! Request-governance middleware: caching, rate limiting, validation,
//! error tracking, and metrics. Each submodule exposes a store type owned
//! by the shared application state and an axum layer function that consults
//! it per request.

pub mod cache;
pub mod error_tracking;
pub mod monitoring;
pub mod rate_limit;
pub mod validation;

pub use cache::{cache_layer, CachePolicy, LruCache, ResponseCache};
pub use error_tracking::{error_tracking_layer, ErrorRecord, ErrorTracker};
pub use monitoring::{monitoring_layer, MetricsCollector, PerformanceMonitor};
pub use rate_limit::{rate_limit_layer, Quota, RateLimiter};
pub use validation::{validation_layer, sanitize_filename, validate_api_key};
