//! Runtime configuration
//!
//! Everything is overridable from the environment or the CLI; the
//! defaults match the shipped Northwind dataset and docs corpus.

use std::time::Duration;

/// Connection settings for the chat-completions backend.
///
/// An api key of "offline" disables network calls entirely; every
/// component that consults the transformer then falls back to its
/// deterministic path.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "offline".to_string()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        }
    }
}

/// Knobs for the answer pipeline itself.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Execution attempts per question, including the first one.
    pub max_attempts: u32,
    /// Retrieval depth cap; requests for more are clamped to this.
    pub max_chunks: usize,
    /// Character length of a document chunk.
    pub chunk_size: usize,
    /// Rows returned per query before truncation.
    pub row_cap: usize,
    /// Wall-clock budget per question before the fallback answer is emitted.
    pub question_timeout: Duration,
    /// Questions processed concurrently in batch mode.
    pub batch_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_chunks: 5,
            chunk_size: 300,
            row_cap: 1000,
            question_timeout: Duration::from_secs(30),
            batch_concurrency: 4,
        }
    }
}
