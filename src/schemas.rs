//! Request and response data structures for the HTTP API.

use serde::{Deserialize, Serialize};

/// Role of a conversation participant.
pub mod roles {
    pub const SYSTEM: &str = "system";
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
}

/// One turn of conversation history supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<ChatSource>>,
}

/// A retrieved document chunk supporting an answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSource {
    /// 1-based page number the chunk came from.
    pub page: usize,
    pub chunk_id: String,
    /// Chunk text, truncated for transport.
    pub content: String,
    pub relevance_score: f32,
}

/// Chat request against an uploaded document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub file_id: String,
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// Synchronous chat answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub sources: Vec<ChatSource>,
}

/// Result of a successful PDF upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: String,
    pub filename: String,
    pub size_bytes: usize,
    pub page_count: usize,
    pub chunk_count: usize,
    pub message: String,
}

/// Indexing status of an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub file_id: String,
    pub filename: String,
    pub page_count: usize,
    pub chunk_count: usize,
    pub status: String,
    pub has_vector_store: bool,
}

/// Message forwarded to the LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: roles::SYSTEM.to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: roles::USER.to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: roles::ASSISTANT.to_string(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_history_defaults_to_empty() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"file_id":"f1","message":"hi"}"#).unwrap();
        assert!(req.history.is_empty());
    }

    #[test]
    fn sources_are_omitted_when_absent() {
        let msg = ChatMessage {
            role: roles::USER.to_string(),
            content: "hello".to_string(),
            sources: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("sources"));
    }
}
