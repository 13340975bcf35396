//! Bounded execution-and-repair loop
//!
//! A candidate query gets at most `max_attempts` executions total. On
//! failure the transformer is asked for a corrected statement with the
//! failed SQL, the raw SQLite error and a fuzzy identifier hint in the
//! prompt. A repair that is itself rejected by the guard ends the loop
//! early; there is no point burning the remaining attempt on a
//! statement already known to be invalid.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::error::Result;
use crate::executor::{QueryRows, QueryService};
use crate::llm::{strip_code_fences, TextTransformer, TransformerPrompt};
use crate::schema::SchemaDescription;
use crate::sql::{guard, CandidateQuery};

lazy_static! {
    static ref MISSING_COLUMN_RE: Regex = Regex::new(r"no such column:\s*([^\s]+)").unwrap();
    static ref MISSING_TABLE_RE: Regex = Regex::new(r"no such table:\s*([^\s]+)").unwrap();
}

#[derive(Debug)]
pub enum LoopOutcome {
    Succeeded {
        rows: QueryRows,
        query: CandidateQuery,
        attempts: u32,
    },
    Exhausted {
        query: CandidateQuery,
        attempts: u32,
        last_error: String,
    },
}

pub struct ExecutionLoop {
    max_attempts: u32,
    transformer: Arc<dyn TextTransformer>,
}

impl ExecutionLoop {
    pub fn new(max_attempts: u32, transformer: Arc<dyn TextTransformer>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            transformer,
        }
    }

    pub async fn run(
        &self,
        initial: CandidateQuery,
        schema: &SchemaDescription,
        service: &dyn QueryService,
        trace: &mut Vec<String>,
    ) -> LoopOutcome {
        let mut candidate = initial;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            candidate.attempt = attempt;
            info!("Execution attempt {} of {}", attempt, self.max_attempts);

            match service.execute(&candidate.text).await {
                Ok(rows) => {
                    info!("✅ Execution succeeded on attempt {}", attempt);
                    trace.push(format!(
                        "executor: attempt {} ok ({} rows)",
                        attempt,
                        rows.len()
                    ));
                    return LoopOutcome::Succeeded {
                        rows,
                        query: candidate,
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!("Execution attempt {} failed: {}", attempt, last_error);
                    trace.push(format!(
                        "executor: attempt {} failed ({})",
                        attempt, last_error
                    ));

                    if attempt == self.max_attempts {
                        break;
                    }
                    match self.repair(&candidate, &last_error, schema).await {
                        Ok(repaired) => {
                            trace.push("repair: produced a replacement query".to_string());
                            candidate = repaired;
                        }
                        Err(repair_err) => {
                            trace.push(format!("repair: no valid replacement ({})", repair_err));
                            return LoopOutcome::Exhausted {
                                query: candidate,
                                attempts: attempt,
                                last_error,
                            };
                        }
                    }
                }
            }
        }

        LoopOutcome::Exhausted {
            query: candidate,
            attempts: self.max_attempts,
            last_error,
        }
    }

    async fn repair(
        &self,
        failed: &CandidateQuery,
        error: &str,
        schema: &SchemaDescription,
    ) -> Result<CandidateQuery> {
        let prompt = build_repair_prompt(failed, error, schema);
        let reply = self.transformer.complete(&prompt).await?;
        let sql = strip_code_fences(&reply);
        let validated = guard::validate_query(&sql, schema)?;
        Ok(CandidateQuery::new(validated, failed.attempt + 1))
    }
}

fn build_repair_prompt(
    failed: &CandidateQuery,
    error: &str,
    schema: &SchemaDescription,
) -> TransformerPrompt {
    let mut parts = Vec::new();
    parts.push("The previous SQLite query failed and must be corrected.".to_string());
    parts.push("\nFAILED QUERY:".to_string());
    parts.push(failed.text.clone());
    parts.push(format!("\nDATABASE ERROR: {}", error));
    if let Some(hint) = identifier_hint(error, schema) {
        parts.push(format!("\nHINT: {}", hint));
    }
    parts.push("\nRELEVANT SCHEMA:".to_string());
    parts.push(schema.to_prompt_text());
    parts.push("\nReturn only the corrected SQLite SELECT statement, no commentary.".to_string());

    TransformerPrompt::new(
        "You correct failing SQLite queries. Return only SQL.",
        parts.join("\n"),
    )
}

/// Map "no such column/table" errors to the nearest schema identifier.
fn identifier_hint(error: &str, schema: &SchemaDescription) -> Option<String> {
    if let Some(caps) = MISSING_COLUMN_RE.captures(error) {
        let name = caps[1].trim();
        return Some(match schema.closest_column(name) {
            Some(suggestion) => format!(
                "column '{}' does not exist; the closest schema column is '{}' on table '{}'",
                name, suggestion.column, suggestion.table
            ),
            None => format!("column '{}' does not exist in the schema", name),
        });
    }
    if let Some(caps) = MISSING_TABLE_RE.captures(error) {
        let name = caps[1].trim();
        return Some(match schema.closest_table(name) {
            Some((table, _)) => format!(
                "table '{}' does not exist; the closest schema table is '{}'",
                name, table
            ),
            None => format!("table '{}' does not exist in the schema", name),
        });
    }
    None
}
