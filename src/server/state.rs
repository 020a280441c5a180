//! Shared application state threaded through every handler and layer.

use crate::{
    config::Config,
    error::ApiError,
    middleware::{ErrorTracker, MetricsCollector, PerformanceMonitor, RateLimiter, ResponseCache},
    services::{ChatService, DocumentStore, OpenAiClient, PlainTextExtractor},
};
use std::sync::Arc;

/// Everything a request needs: configuration, the governance stores, and the
/// domain services. Cheap to clone; all fields are shared.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub errors: Arc<ErrorTracker>,
    pub metrics: Arc<MetricsCollector>,
    pub perf: Arc<PerformanceMonitor>,
    pub documents: Arc<DocumentStore>,
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// Build production state: a real provider client backs both embedding
    /// and chat.
    pub fn new(config: Config) -> Result<Self, ApiError> {
        let client = Arc::new(OpenAiClient::new(&config)?);
        let documents = Arc::new(DocumentStore::new(
            Box::new(PlainTextExtractor),
            client.clone(),
            config.chunk_size,
            config.chunk_overlap,
        ));
        let chat = Arc::new(ChatService::new(
            client,
            Arc::clone(&documents),
            config.retrieval_k,
            config.history_limit,
        ));
        Ok(Self::with_services(config, documents, chat))
    }

    /// Assemble state around caller-provided services; tests inject mock
    /// collaborators here.
    pub fn with_services(
        config: Config,
        documents: Arc<DocumentStore>,
        chat: Arc<ChatService>,
    ) -> Self {
        Self {
            cache: Arc::new(ResponseCache::new(config.cache_max_size)),
            limiter: Arc::new(RateLimiter::new()),
            errors: Arc::new(ErrorTracker::new(config.error_buffer_size)),
            metrics: Arc::new(MetricsCollector::new()),
            perf: Arc::new(PerformanceMonitor::new()),
            config: Arc::new(config),
            documents,
            chat,
        }
    }
}
