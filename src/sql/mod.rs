//! Query compilation and guarding
//!
//! Everything that leaves this module has passed the read-only guard:
//! exactly one SELECT statement, no mutating keywords, every referenced
//! table present in the live schema.

pub mod compiler;
pub mod guard;

pub use compiler::QueryCompiler;
pub use guard::{validate_query, ValidatedQuery};

use serde::Serialize;

/// A guard-approved query on its way to execution.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateQuery {
    pub text: String,
    /// 1-based execution attempt this text belongs to.
    pub attempt: u32,
    /// Tables referenced, in FROM/JOIN order. Reused for citations.
    pub tables: Vec<String>,
}

impl CandidateQuery {
    pub fn new(validated: ValidatedQuery, attempt: u32) -> Self {
        Self {
            text: validated.sql,
            attempt,
            tables: validated.tables,
        }
    }
}
