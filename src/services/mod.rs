//! Domain services: upstream provider client, document indexing, and chat
//! orchestration.

pub mod chat;
pub mod openai;
pub mod pdf;

pub use chat::ChatService;
pub use openai::{ChatModel, Embedder, OpenAiClient};
pub use pdf::{DocumentStore, PlainTextExtractor, TextExtractor};
