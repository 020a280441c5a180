//! OpenAI-compatible upstream client for embeddings and chat completions.
//!
//! The gateway talks to any provider exposing the OpenAI REST shape; the
//! base URL and model names come from configuration. Streaming completions
//! are consumed as SSE `data:` lines and surfaced as a stream of content
//! deltas.

use crate::{config::Config, error::ApiError, schemas::PromptMessage};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Produces vector embeddings for text chunks.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError>;
}

/// Produces chat completions, synchronously or as a delta stream.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ApiError>;

    /// Stream content deltas. The stream ends when the upstream sends its
    /// done sentinel; an `Err` item reports a mid-stream failure.
    async fn complete_stream(
        &self,
        messages: &[PromptMessage],
    ) -> Result<BoxStream<'static, Result<String, ApiError>>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

/// HTTP client for an OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_client_timeout))
            .build()
            .map_err(|e| ApiError::internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.provider_base_url.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Parse one upstream SSE line into a content delta. Returns `None` for
    /// non-data lines, empty deltas, and the done sentinel.
    fn parse_stream_line(line: &str) -> Option<String> {
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }
        match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .filter(|s| !s.is_empty()),
            Err(e) => {
                warn!("unparseable stream chunk: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        debug!("embedding {} texts", texts.len());
        let response = self
            .client
            .post(self.url("/embeddings"))
            .json(&json!({
                "model": self.embedding_model,
                "input": texts,
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: EmbeddingResponse = response.json().await?;
        if body.data.len() != texts.len() {
            return Err(ApiError::upstream(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ApiError> {
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .json(&json!({
                "model": self.chat_model,
                "messages": messages,
                "max_tokens": self.max_tokens,
                "temperature": self.temperature,
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: CompletionResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ApiError::upstream("completion response had no choices"))
    }

    async fn complete_stream(
        &self,
        messages: &[PromptMessage],
    ) -> Result<BoxStream<'static, Result<String, ApiError>>, ApiError> {
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .json(&json!({
                "model": self.chat_model,
                "messages": messages,
                "max_tokens": self.max_tokens,
                "temperature": self.temperature,
                "stream": true,
            }))
            .send()
            .await?
            .error_for_status()?;

        // Lines can split across byte chunks; carry the partial tail forward.
        let deltas = response
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let items: Vec<Result<String, ApiError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        let mut out = Vec::new();
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            if let Some(delta) = Self::parse_stream_line(&line) {
                                out.push(Ok(delta));
                            }
                        }
                        out
                    }
                    Err(e) => vec![Err(ApiError::from(e))],
                };
                futures_util::future::ready(Some(futures_util::stream::iter(items)))
            })
            .flatten();
        Ok(deltas.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_line_parsing() {
        let delta = OpenAiClient::parse_stream_line(
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
        );
        assert_eq!(delta.as_deref(), Some("Hel"));

        assert!(OpenAiClient::parse_stream_line("data: [DONE]").is_none());
        assert!(OpenAiClient::parse_stream_line(": keepalive").is_none());
        assert!(OpenAiClient::parse_stream_line("data:").is_none());
        assert!(OpenAiClient::parse_stream_line(
            r#"data: {"choices":[{"delta":{}}]}"#
        )
        .is_none());
    }
}
