//! Request handlers for the public API surface.

use crate::{
    error::ApiError,
    middleware::{sanitize_filename, validate_api_key},
    schemas::{ChatRequest, UploadResponse},
    server::AppState,
    streaming::{content_event, done_event, error_event, sources_event},
};
use axum::{
    extract::{FromRequestParts, Multipart, Path, State},
    http::request::Parts,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::StreamExt;
use serde_json::json;
use std::{convert::Infallible, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// Extractor enforcing API-key auth: the key must be present and have the
/// provider key shape. The key itself is never stored.
pub struct ApiKey(pub String);

impl<S> FromRequestParts<S> for ApiKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Auth("API key required".to_string()))?;
        if !validate_api_key(key) {
            return Err(ApiError::Auth("invalid API key".to_string()));
        }
        Ok(ApiKey(key.to_string()))
    }
}

/// Liveness endpoint; cheap enough to sit under the health rate budget.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
        "documents_indexed": state.documents.len(),
    }))
}

/// Plain liveness probe under the API prefix; unauthenticated.
pub async fn health_status() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "rag-gateway",
    }))
}

/// Readiness of the service's collaborators. The provider client and the
/// in-memory index are constructed at startup, so readiness follows from
/// the process being up.
pub async fn readiness(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "provider": true,
        "index": true,
        "documents_indexed": state.documents.len(),
    }))
}

/// Ingest an uploaded document: extract, chunk, embed, index.
pub async fn upload_pdf(
    State(state): State<AppState>,
    _auth: ApiKey,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = sanitize_filename(field.file_name().unwrap_or("upload"));
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::Validation(format!("failed to read upload: {}", e)))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let (filename, bytes) =
        upload.ok_or_else(|| ApiError::Validation("missing 'file' field".to_string()))?;
    let allowed = [".pdf", ".txt"];
    if !allowed.iter().any(|ext| filename.to_lowercase().ends_with(ext)) {
        return Err(ApiError::Validation(format!(
            "unsupported file type: '{}' (expected one of: {})",
            filename,
            allowed.join(", ")
        )));
    }
    if bytes.is_empty() {
        return Err(ApiError::Validation("uploaded file is empty".to_string()));
    }
    if bytes.len() > state.config.max_upload_size_bytes() {
        return Err(ApiError::PayloadTooLarge(format!(
            "upload exceeds {} bytes",
            state.config.max_upload_size_bytes()
        )));
    }

    info!("upload received: '{}' ({} bytes)", filename, bytes.len());
    let (file_id, document) = state.documents.ingest(&filename, &bytes).await?;

    Ok(Json(UploadResponse {
        file_id,
        filename,
        size_bytes: bytes.len(),
        page_count: document.page_count,
        chunk_count: document.chunk_count(),
        message: "document indexed successfully".to_string(),
    }))
}

/// Indexing status for an uploaded file.
pub async fn upload_status(
    State(state): State<AppState>,
    _auth: ApiKey,
    Path(file_id): Path<String>,
) -> Result<Json<crate::schemas::FileStatus>, ApiError> {
    state
        .documents
        .status(&file_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("file not found: {}", file_id)))
}

/// One-shot chat answer grounded in the uploaded document.
pub async fn chat_message(
    State(state): State<AppState>,
    _auth: ApiKey,
    Json(request): Json<ChatRequest>,
) -> Result<Json<crate::schemas::ChatResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::Validation("message must not be empty".to_string()));
    }
    let response = state
        .chat
        .complete(&request.file_id, &request.message, &request.history)
        .await?;
    Ok(Json(response))
}

/// Streaming chat answer over SSE.
///
/// Retrieval runs before the stream opens, so an unknown file is a plain
/// 404. The frame order is fixed: sources, content deltas, then the done
/// sentinel; a mid-stream failure emits an error frame before the sentinel.
/// A disconnected client closes the channel, which abandons generation.
pub async fn chat_stream(
    State(state): State<AppState>,
    _auth: ApiKey,
    Json(request): Json<ChatRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::Validation("message must not be empty".to_string()));
    }

    let (sources, mut deltas) = state
        .chat
        .start_stream(&request.file_id, &request.message, &request.history)
        .await?;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
    let chat = Arc::clone(&state.chat);
    let file_id = request.file_id.clone();
    let question = request.message.clone();

    tokio::spawn(async move {
        if tx.send(Ok(sources_event(&sources))).await.is_err() {
            return;
        }

        let mut answer = String::new();
        while let Some(item) = deltas.next().await {
            match item {
                Ok(delta) => {
                    answer.push_str(&delta);
                    if tx.send(Ok(content_event(&delta))).await.is_err() {
                        // Client went away; stop pulling from upstream.
                        return;
                    }
                }
                Err(err) => {
                    warn!("stream failed mid-answer: {}", err);
                    let _ = tx.send(Ok(error_event("generation failed"))).await;
                    let _ = tx.send(Ok(done_event())).await;
                    return;
                }
            }
        }

        if !answer.is_empty() {
            chat.append_turn(&file_id, &question, &answer, sources);
        }
        let _ = tx.send(Ok(done_event())).await;
    });

    // Disable proxy buffering so fragments reach the client as they are
    // produced.
    let headers = [
        ("cache-control", "no-cache"),
        ("x-accel-buffering", "no"),
    ];
    Ok((
        headers,
        Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()),
    ))
}

/// Drop the stored conversation for a file.
pub async fn clear_history(
    State(state): State<AppState>,
    _auth: ApiKey,
    Path(file_id): Path<String>,
) -> Json<serde_json::Value> {
    let cleared = state.chat.clear_history(&file_id);
    Json(json!({
        "file_id": file_id,
        "cleared": cleared,
    }))
}
