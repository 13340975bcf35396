//! Error types for the retail copilot
//!
//! Failures that the pipeline recovers from (bad transformer output,
//! rejected or failing queries) are distinct variants so callers can
//! decide between degraded answers and hard stops.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CopilotError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Rejected query: {0}")]
    QueryRejected(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Answer contract violation: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CopilotError {
    fn from(err: rusqlite::Error) -> Self {
        CopilotError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CopilotError>;
