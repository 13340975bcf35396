//! Document retrieval
//!
//! Markdown policy docs are chunked at load time and served from an
//! in-memory TF-IDF index. Retrieval is deterministic: identical corpus
//! and query always produce the same ranked chunk list.

pub mod chunker;
pub mod tfidf;

pub use chunker::{chunk_text, load_chunks, DocChunk};
pub use tfidf::TfIdfIndex;

use std::sync::Arc;

use serde::Serialize;

/// One scored chunk returned to the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
    pub score: f64,
}

/// Ranked chunk lookup over a document corpus.
pub trait RetrievalService: Send + Sync {
    fn search(&self, query: &str, k: usize) -> Vec<RetrievedChunk>;
}

/// Pipeline-facing retriever that caps depth and drops zero-score noise.
pub struct Retriever {
    service: Arc<dyn RetrievalService>,
    max_chunks: usize,
}

impl Retriever {
    pub fn new(service: Arc<dyn RetrievalService>, max_chunks: usize) -> Self {
        Self {
            service,
            max_chunks,
        }
    }

    /// Top chunks for a query. Empty when nothing in the corpus overlaps
    /// the query at all; callers treat that as a valid degraded state.
    pub fn retrieve(&self, query: &str) -> Vec<RetrievedChunk> {
        let mut chunks = self.service.search(query, self.max_chunks);
        chunks.truncate(self.max_chunks);
        chunks.retain(|chunk| chunk.score > 0.0);
        chunks
    }
}
