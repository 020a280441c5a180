//! Shared test harness: a full router wired to deterministic in-process
//! collaborators instead of a live provider.

use async_trait::async_trait;
use axum::Router;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use rag_gateway::{
    config::Config,
    error::ApiError,
    schemas::PromptMessage,
    server::{create_router, AppState},
    services::{ChatModel, ChatService, DocumentStore, Embedder, PlainTextExtractor},
};
use std::sync::Arc;

pub const TEST_API_KEY: &str = "sk-0123456789abcdef012345";

/// Deterministic embedder: a small vector derived from the text bytes.
pub struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = [0f32; 4];
                for (i, b) in t.bytes().enumerate() {
                    v[i % 4] += b as f32;
                }
                let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1.0);
                v.iter().map(|x| x / norm).collect()
            })
            .collect())
    }
}

/// Canned chat model; optionally fails every call with an upstream error.
pub struct StubModel {
    pub answer: String,
    pub fail: bool,
}

impl StubModel {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: String::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl ChatModel for StubModel {
    async fn complete(&self, _messages: &[PromptMessage]) -> Result<String, ApiError> {
        if self.fail {
            return Err(ApiError::upstream("provider unavailable"));
        }
        Ok(self.answer.clone())
    }

    async fn complete_stream(
        &self,
        _messages: &[PromptMessage],
    ) -> Result<BoxStream<'static, Result<String, ApiError>>, ApiError> {
        if self.fail {
            return Err(ApiError::upstream("provider unavailable"));
        }
        let parts: Vec<Result<String, ApiError>> = self
            .answer
            .split_whitespace()
            .map(|w| Ok(format!("{} ", w)))
            .collect();
        Ok(futures_util::stream::iter(parts).boxed())
    }
}

pub fn build_state(model: StubModel) -> AppState {
    let config = Config::for_test();
    let documents = Arc::new(DocumentStore::new(
        Box::new(PlainTextExtractor),
        Arc::new(StubEmbedder),
        config.chunk_size,
        config.chunk_overlap,
    ));
    let chat = Arc::new(ChatService::new(
        Arc::new(model),
        Arc::clone(&documents),
        config.retrieval_k,
        config.history_limit,
    ));
    AppState::with_services(config, documents, chat)
}

pub fn build_app(model: StubModel) -> Router {
    create_router(build_state(model))
}

/// Multipart body for a single `file` field.
pub fn multipart_body(boundary: &str, filename: &str, content: &str) -> Vec<u8> {
    format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: text/plain\r\n\r\n{c}\r\n--{b}--\r\n",
        b = boundary,
        f = filename,
        c = content
    )
    .into_bytes()
}
