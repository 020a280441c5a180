//! PDF-grounded chat gateway.
//!
//! An axum service that answers questions about uploaded documents using
//! retrieval-augmented generation against an OpenAI-compatible provider.
//! Every request passes through a governance stack: validation and
//! sanitization, per-identity rate limiting, response caching, error
//! tracking with fingerprint grouping, and request metrics. Streaming
//! answers are delivered over SSE with a fixed frame protocol.

pub mod config;
pub mod error;
pub mod middleware;
pub mod schemas;
pub mod server;
pub mod services;
pub mod shutdown;
pub mod streaming;

pub use config::Config;
pub use error::ApiError;
pub use server::{create_router, AppState};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ApiError>;
