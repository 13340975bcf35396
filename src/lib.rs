//! Retail Copilot
//!
//! Answers natural-language questions about a retail business from two
//! evidence sources: markdown policy documents and a read-only SQLite
//! sales database. Questions are routed to the documents, the database
//! or both, compiled into guarded SQL where needed, executed with a
//! bounded repair loop, and synthesized into structured answers with
//! citations and a calibrated confidence score. A question that cannot
//! be answered still produces a well-formed default answer.

pub mod config;
pub mod error;
pub mod executor;
pub mod finalizer;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod planner;
pub mod question;
pub mod repair;
pub mod retrieval;
pub mod router;
pub mod schema;
pub mod sql;
pub mod synthesizer;

pub use error::{CopilotError, Result};
