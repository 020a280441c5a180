//! Retrieval-augmented chat over indexed documents.
//!
//! Each answer is grounded in the top-k chunks retrieved for the question.
//! Conversation history is kept server-side per file; a request may supply
//! its own history, which then takes precedence for that turn.

use crate::{
    error::ApiError,
    schemas::{ChatMessage, ChatResponse, ChatSource, PromptMessage},
    services::{openai::ChatModel, pdf::DocumentStore},
};
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tracing::debug;

const RAG_SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about an uploaded document. \
Answer using only the numbered source excerpts below. If the excerpts do not \
contain the answer, say so plainly instead of guessing. Cite sources as \
[Source N] where relevant.";

/// Chat orchestration: retrieval, prompt assembly, history bookkeeping.
pub struct ChatService {
    model: Arc<dyn ChatModel>,
    documents: Arc<DocumentStore>,
    histories: DashMap<String, Vec<ChatMessage>>,
    retrieval_k: usize,
    history_limit: usize,
}

impl ChatService {
    pub fn new(
        model: Arc<dyn ChatModel>,
        documents: Arc<DocumentStore>,
        retrieval_k: usize,
        history_limit: usize,
    ) -> Self {
        Self {
            model,
            documents,
            histories: DashMap::new(),
            retrieval_k,
            history_limit,
        }
    }

    /// Assemble the provider prompt: grounded system message, trailing
    /// history window, then the user's question.
    fn build_prompt(
        &self,
        sources: &[ChatSource],
        history: &[ChatMessage],
        message: &str,
    ) -> Vec<PromptMessage> {
        let mut context = String::from(RAG_SYSTEM_PROMPT);
        context.push_str("\n\n");
        for (i, source) in sources.iter().enumerate() {
            context.push_str(&format!(
                "[Source {}] (page {}): {}\n",
                i + 1,
                source.page,
                source.content
            ));
        }

        let mut prompt = vec![PromptMessage::system(context)];
        let tail_start = history.len().saturating_sub(self.history_limit);
        for turn in &history[tail_start..] {
            prompt.push(PromptMessage {
                role: turn.role.clone(),
                content: turn.content.clone(),
            });
        }
        prompt.push(PromptMessage::user(message));
        prompt
    }

    fn history_for_turn(&self, file_id: &str, supplied: &[ChatMessage]) -> Vec<ChatMessage> {
        if !supplied.is_empty() {
            return supplied.to_vec();
        }
        self.histories
            .get(file_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Record a completed exchange in the per-file history.
    pub fn append_turn(
        &self,
        file_id: &str,
        question: &str,
        answer: &str,
        sources: Vec<ChatSource>,
    ) {
        let mut history = self.histories.entry(file_id.to_string()).or_default();
        history.push(ChatMessage {
            role: crate::schemas::roles::USER.to_string(),
            content: question.to_string(),
            sources: None,
        });
        history.push(ChatMessage {
            role: crate::schemas::roles::ASSISTANT.to_string(),
            content: answer.to_string(),
            sources: Some(sources),
        });
    }

    pub fn history(&self, file_id: &str) -> Vec<ChatMessage> {
        self.histories
            .get(file_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Drop the stored history for a file. Returns whether any existed.
    pub fn clear_history(&self, file_id: &str) -> bool {
        self.histories.remove(file_id).is_some()
    }

    /// Answer a question in one round trip.
    pub async fn complete(
        &self,
        file_id: &str,
        message: &str,
        supplied_history: &[ChatMessage],
    ) -> Result<ChatResponse, ApiError> {
        let sources = self
            .documents
            .retrieve(file_id, message, self.retrieval_k)
            .await?;
        let history = self.history_for_turn(file_id, supplied_history);
        let prompt = self.build_prompt(&sources, &history, message);
        debug!("chat prompt has {} messages", prompt.len());

        let answer = self.model.complete(&prompt).await?;
        self.append_turn(file_id, message, &answer, sources.clone());
        Ok(ChatResponse {
            message: answer,
            sources,
        })
    }

    /// Start a streaming answer. Retrieval happens up front so a missing
    /// file fails the request before any stream is opened; the caller frames
    /// the returned deltas and records the finished turn.
    pub async fn start_stream(
        &self,
        file_id: &str,
        message: &str,
        supplied_history: &[ChatMessage],
    ) -> Result<(Vec<ChatSource>, BoxStream<'static, Result<String, ApiError>>), ApiError> {
        let sources = self
            .documents
            .retrieve(file_id, message, self.retrieval_k)
            .await?;
        let history = self.history_for_turn(file_id, supplied_history);
        let prompt = self.build_prompt(&sources, &history, message);

        let deltas = self.model.complete_stream(&prompt).await?;
        Ok((sources, deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        openai::Embedder,
        pdf::PlainTextExtractor,
    };
    use async_trait::async_trait;
    use futures_util::StreamExt;

    struct FlatEmbedder;

    #[async_trait]
    impl Embedder for FlatEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    /// Echoes a canned answer and records the prompts it saw.
    struct CannedModel {
        answer: String,
        prompts: std::sync::Mutex<Vec<Vec<PromptMessage>>>,
    }

    impl CannedModel {
        fn new(answer: &str) -> Self {
            Self {
                answer: answer.to_string(),
                prompts: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for CannedModel {
        async fn complete(&self, messages: &[PromptMessage]) -> Result<String, ApiError> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            Ok(self.answer.clone())
        }

        async fn complete_stream(
            &self,
            messages: &[PromptMessage],
        ) -> Result<BoxStream<'static, Result<String, ApiError>>, ApiError> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            let parts: Vec<Result<String, ApiError>> = self
                .answer
                .split_whitespace()
                .map(|w| Ok(format!("{} ", w)))
                .collect();
            Ok(futures_util::stream::iter(parts).boxed())
        }
    }

    async fn service_with_document(answer: &str) -> (Arc<CannedModel>, ChatService, String) {
        let model = Arc::new(CannedModel::new(answer));
        let documents = Arc::new(DocumentStore::new(
            Box::new(PlainTextExtractor),
            Arc::new(FlatEmbedder),
            200,
            40,
        ));
        let (file_id, _) = documents
            .ingest("doc.txt", b"the quarterly budget grew by twelve percent")
            .await
            .unwrap();
        let service = ChatService::new(model.clone() as Arc<dyn ChatModel>, documents, 5, 5);
        (model, service, file_id)
    }

    #[tokio::test]
    async fn complete_grounds_prompt_and_records_history() {
        let (model, service, file_id) = service_with_document("It grew 12%.").await;

        let response = service
            .complete(&file_id, "how did the budget change?", &[])
            .await
            .unwrap();
        assert_eq!(response.message, "It grew 12%.");
        assert!(!response.sources.is_empty());

        let prompts = model.prompts.lock().unwrap();
        let system = &prompts[0][0];
        assert_eq!(system.role, "system");
        assert!(system.content.contains("[Source 1]"));
        assert!(system.content.contains("quarterly budget"));
        drop(prompts);

        let history = service.history(&file_id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
        assert!(history[1].sources.is_some());
    }

    #[tokio::test]
    async fn history_window_is_bounded() {
        let (model, service, file_id) = service_with_document("ok").await;

        for i in 0..6 {
            service
                .complete(&file_id, &format!("question {}", i), &[])
                .await
                .unwrap();
        }

        // Sixth turn: 10 prior history messages exist but only the last 5
        // make it into the prompt, plus system and the new user message.
        let prompts = model.prompts.lock().unwrap();
        let last = prompts.last().unwrap();
        assert_eq!(last.len(), 1 + 5 + 1);
    }

    #[tokio::test]
    async fn supplied_history_takes_precedence() {
        let (model, service, file_id) = service_with_document("ok").await;

        let supplied = vec![ChatMessage {
            role: "user".to_string(),
            content: "earlier question from the client".to_string(),
            sources: None,
        }];
        service
            .complete(&file_id, "follow-up", &supplied)
            .await
            .unwrap();

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0]
            .iter()
            .any(|m| m.content == "earlier question from the client"));
    }

    #[tokio::test]
    async fn streaming_yields_sources_then_deltas() {
        let (_, service, file_id) = service_with_document("twelve percent growth").await;

        let (sources, mut deltas) = service
            .start_stream(&file_id, "how much?", &[])
            .await
            .unwrap();
        assert!(!sources.is_empty());

        let mut answer = String::new();
        while let Some(delta) = deltas.next().await {
            answer.push_str(&delta.unwrap());
        }
        assert_eq!(answer.trim(), "twelve percent growth");
    }

    #[tokio::test]
    async fn missing_file_fails_before_streaming() {
        let (_, service, _) = service_with_document("ok").await;
        assert!(matches!(
            service.start_stream("nope", "q", &[]).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clear_history() {
        let (_, service, file_id) = service_with_document("ok").await;
        service.complete(&file_id, "q", &[]).await.unwrap();
        assert!(service.clear_history(&file_id));
        assert!(service.history(&file_id).is_empty());
        assert!(!service.clear_history(&file_id));
    }
}
