//! Server-sent event framing for streaming chat responses.
//!
//! Every frame is a JSON object carrying a `type` discriminator, except the
//! terminal sentinel which is the literal string `[DONE]`. Clients stop
//! reading at the sentinel; an error frame is always followed by it.

use crate::schemas::ChatSource;
use axum::response::sse::Event;
use serde_json::json;

/// Terminal sentinel closing every stream.
pub const DONE_SENTINEL: &str = "[DONE]";

fn sources_payload(sources: &[ChatSource]) -> String {
    json!({
        "type": "sources",
        "sources": sources,
    })
    .to_string()
}

fn content_payload(delta: &str) -> String {
    json!({
        "type": "content",
        "content": delta,
    })
    .to_string()
}

fn error_payload(message: &str) -> String {
    json!({
        "type": "error",
        "error": message,
    })
    .to_string()
}

/// First frame of a stream: the retrieved sources backing the answer.
pub fn sources_event(sources: &[ChatSource]) -> Event {
    Event::default().data(sources_payload(sources))
}

/// One incremental answer fragment.
pub fn content_event(delta: &str) -> Event {
    Event::default().data(content_payload(delta))
}

/// Mid-stream failure notification. The stream still terminates with the
/// done sentinel afterwards.
pub fn error_event(message: &str) -> Event {
    Event::default().data(error_payload(message))
}

/// The `data: [DONE]` terminator.
pub fn done_event() -> Event {
    Event::default().data(DONE_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn content_frame_is_typed_json() {
        let payload: Value = serde_json::from_str(&content_payload("hello")).unwrap();
        assert_eq!(payload["type"], "content");
        assert_eq!(payload["content"], "hello");
    }

    #[test]
    fn sources_frame_carries_chunks() {
        let sources = vec![ChatSource {
            page: 3,
            chunk_id: "c-12".to_string(),
            content: "excerpt".to_string(),
            relevance_score: 0.91,
        }];
        let payload: Value = serde_json::from_str(&sources_payload(&sources)).unwrap();
        assert_eq!(payload["type"], "sources");
        assert_eq!(payload["sources"][0]["chunk_id"], "c-12");
        assert_eq!(payload["sources"][0]["page"], 3);
    }

    #[test]
    fn error_frame_carries_message() {
        let payload: Value = serde_json::from_str(&error_payload("upstream timeout")).unwrap();
        assert_eq!(payload["type"], "error");
        assert_eq!(payload["error"], "upstream timeout");
    }

    #[test]
    fn done_sentinel_is_not_json() {
        assert_eq!(DONE_SENTINEL, "[DONE]");
        assert!(serde_json::from_str::<Value>(DONE_SENTINEL).is_err());
    }
}
