//! Document ingestion: text extraction, chunking, embedding, and retrieval.
//!
//! Uploaded documents are split per page, chunked with overlap, embedded,
//! and held in an in-memory vector index keyed by file id. Retrieval is
//! cosine similarity over the stored chunk vectors.

use crate::{
    error::ApiError,
    schemas::{ChatSource, FileStatus},
    services::openai::Embedder,
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Characters of chunk content carried on a retrieval source.
const SOURCE_PREVIEW_CHARS: usize = 200;

/// Extracts page texts from an uploaded document.
///
/// The default extractor handles text-based uploads; binary formats plug in
/// behind this trait.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<Vec<String>, ApiError>;
}

/// Treats the upload as UTF-8 text with form-feed page breaks.
#[derive(Debug, Default)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<Vec<String>, ApiError> {
        let text = String::from_utf8_lossy(bytes);
        let pages: Vec<String> = text
            .split('\u{c}')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if pages.is_empty() {
            return Err(ApiError::Validation(
                "document contains no extractable text".to_string(),
            ));
        }
        Ok(pages)
    }
}

/// One indexed chunk of a document.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    /// 1-based source page.
    pub page: usize,
    pub content: String,
}

/// Split page texts into overlapping chunks.
///
/// Windows advance by `chunk_size - overlap` characters so neighboring
/// chunks share context; chunks never span page boundaries.
pub fn chunk_pages(pages: &[String], chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    assert!(overlap < chunk_size, "overlap must be smaller than chunk size");
    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    for (page_idx, page) in pages.iter().enumerate() {
        let chars: Vec<char> = page.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + chunk_size).min(chars.len());
            let content: String = chars[start..end].iter().collect();
            let content = content.trim().to_string();
            if !content.is_empty() {
                chunks.push(Chunk {
                    id: format!("c-{}", chunks.len()),
                    page: page_idx + 1,
                    content,
                });
            }
            if end == chars.len() {
                break;
            }
            start += step;
        }
    }
    chunks
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

struct IndexedChunk {
    chunk: Chunk,
    vector: Vec<f32>,
}

/// A fully indexed document.
pub struct Document {
    pub filename: String,
    pub size_bytes: usize,
    pub page_count: usize,
    chunks: Vec<IndexedChunk>,
}

impl Document {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Top-k chunks by cosine similarity to the query vector.
    fn search(&self, query: &[f32], k: usize) -> Vec<(f32, &Chunk)> {
        let mut scored: Vec<(f32, &Chunk)> = self
            .chunks
            .iter()
            .map(|ic| (cosine_similarity(query, &ic.vector), &ic.chunk))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

/// In-memory store of indexed documents.
pub struct DocumentStore {
    documents: DashMap<String, Arc<Document>>,
    extractor: Box<dyn TextExtractor>,
    embedder: Arc<dyn Embedder>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentStore {
    pub fn new(
        extractor: Box<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            documents: DashMap::new(),
            extractor,
            embedder,
            chunk_size,
            chunk_overlap,
        }
    }

    /// Ingest an upload end to end and return its assigned file id.
    pub async fn ingest(&self, filename: &str, bytes: &[u8]) -> Result<(String, Arc<Document>), ApiError> {
        let pages = self.extractor.extract(bytes)?;
        let chunks = chunk_pages(&pages, self.chunk_size, self.chunk_overlap);
        if chunks.is_empty() {
            return Err(ApiError::Validation(
                "document produced no indexable chunks".to_string(),
            ));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let document = Arc::new(Document {
            filename: filename.to_string(),
            size_bytes: bytes.len(),
            page_count: pages.len(),
            chunks: chunks
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| IndexedChunk { chunk, vector })
                .collect(),
        });

        let file_id = Uuid::new_v4().to_string();
        info!(
            "indexed '{}' as {}: {} pages, {} chunks",
            filename,
            file_id,
            document.page_count,
            document.chunk_count()
        );
        self.documents.insert(file_id.clone(), Arc::clone(&document));
        Ok((file_id, document))
    }

    pub fn get(&self, file_id: &str) -> Option<Arc<Document>> {
        self.documents.get(file_id).map(|d| Arc::clone(&d))
    }

    pub fn status(&self, file_id: &str) -> Option<FileStatus> {
        self.get(file_id).map(|doc| FileStatus {
            file_id: file_id.to_string(),
            filename: doc.filename.clone(),
            page_count: doc.page_count,
            chunk_count: doc.chunk_count(),
            status: "ready".to_string(),
            has_vector_store: true,
        })
    }

    pub fn remove(&self, file_id: &str) -> bool {
        self.documents.remove(file_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Retrieve the k most relevant chunks for a query against one file.
    pub async fn retrieve(
        &self,
        file_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ChatSource>, ApiError> {
        let document = self
            .get(file_id)
            .ok_or_else(|| ApiError::NotFound(format!("file not found: {}", file_id)))?;

        let query_vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vector = query_vectors
            .first()
            .ok_or_else(|| ApiError::upstream("embedder returned no query vector"))?;

        let hits = document.search(query_vector, k);
        debug!("retrieved {} chunks for query against {}", hits.len(), file_id);
        Ok(hits
            .into_iter()
            .map(|(score, chunk)| ChatSource {
                page: chunk.page,
                chunk_id: chunk.id.clone(),
                content: chunk.content.chars().take(SOURCE_PREVIEW_CHARS).collect(),
                relevance_score: score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Deterministic embedder: maps each text to a 4-dim vector derived from
    /// its bytes, so similar texts get similar vectors.
    struct HashEmbedder;

    #[async_trait]
    impl Embedder for HashEmbedder {
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

    fn store() -> DocumentStore {
        DocumentStore::new(
            Box::new(PlainTextExtractor),
            Arc::new(HashEmbedder),
            100,
            20,
        )
    }

    #[test]
    fn chunking_respects_overlap_and_pages() {
        let pages = vec!["a".repeat(250), "b".repeat(50)];
        let chunks = chunk_pages(&pages, 100, 20);
        // Page one: windows at 0, 80, and 160 (the last reaches the page
        // end); page two: one chunk.
        assert_eq!(chunks.len(), 4);
        assert!(chunks[..3].iter().all(|c| c.page == 1));
        assert_eq!(chunks[3].page, 2);
        assert_eq!(chunks[0].content.len(), 100);
        assert_eq!(chunks[2].content.len(), 90);
    }

    #[test]
    fn extractor_splits_on_form_feed() {
        let pages = PlainTextExtractor
            .extract("page one\u{c}page two\u{c}\u{c}".as_bytes())
            .unwrap();
        assert_eq!(pages, vec!["page one", "page two"]);
        assert!(PlainTextExtractor.extract("  \u{c}  ".as_bytes()).is_err());
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn ingest_then_status_then_remove() {
        let store = store();
        let (file_id, doc) = store.ingest("notes.txt", b"hello world, this is a document").await.unwrap();
        assert_eq!(doc.page_count, 1);
        assert!(doc.chunk_count() >= 1);

        let status = store.status(&file_id).unwrap();
        assert_eq!(status.filename, "notes.txt");
        assert_eq!(status.status, "ready");
        assert!(status.has_vector_store);

        assert!(store.remove(&file_id));
        assert!(store.status(&file_id).is_none());
        assert!(!store.remove(&file_id));
    }

    #[tokio::test]
    async fn retrieve_unknown_file_is_not_found() {
        let store = store();
        let err = store.retrieve("missing", "query", 5).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn retrieve_returns_at_most_k_sources() {
        let store = store();
        let long_text = (0..40)
            .map(|i| format!("paragraph number {} with filler text to occupy space", i))
            .collect::<Vec<_>>()
            .join(" ");
        let (file_id, _) = store.ingest("big.txt", long_text.as_bytes()).await.unwrap();

        let sources = store.retrieve(&file_id, "filler text", 5).await.unwrap();
        assert!(sources.len() <= 5);
        assert!(!sources.is_empty());
        assert!(sources[0].content.chars().count() <= SOURCE_PREVIEW_CHARS);
        // Results are ordered by descending relevance.
        for pair in sources.windows(2) {
            assert!(pair[0].relevance_score >= pair[1].relevance_score);
        }
    }
}
