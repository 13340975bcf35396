//! Answer finalization
//!
//! Last stop before anything leaves the pipeline. Every answer is
//! checked against the output contract; a violation here is an internal
//! bug, not a user error, and is reported as one.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{CopilotError, Result};
use crate::question::Question;
use crate::router::Route;
use crate::synthesizer::Synthesis;

/// One line of the output file.
///
/// `sql` is always present in the serialized form and is `null` for
/// document-only answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    pub final_answer: Value,
    pub sql: Option<String>,
    pub confidence: f64,
    pub explanation: String,
    pub citations: Vec<String>,
}

pub struct Finalizer;

impl Finalizer {
    pub fn finalize(
        question: &Question,
        route: Route,
        synthesis: Synthesis,
        sql: Option<String>,
    ) -> Result<Answer> {
        let answer = Answer {
            id: question.id.clone(),
            final_answer: synthesis.value,
            sql,
            confidence: synthesis.confidence,
            explanation: synthesis.explanation,
            citations: synthesis.citations,
        };
        validate(&answer, route)?;
        Ok(answer)
    }
}

fn validate(answer: &Answer, route: Route) -> Result<()> {
    if answer.id.is_empty() {
        return Err(CopilotError::Internal(
            "answer is missing a question id".to_string(),
        ));
    }
    if answer.final_answer.is_null() {
        return Err(CopilotError::Internal(format!(
            "final_answer for {} must not be null",
            answer.id
        )));
    }
    if !answer.confidence.is_finite() || !(0.0..=1.0).contains(&answer.confidence) {
        return Err(CopilotError::Internal(format!(
            "confidence {} for {} is outside 0..=1",
            answer.confidence, answer.id
        )));
    }
    if answer.explanation.trim().is_empty() {
        return Err(CopilotError::Internal(format!(
            "explanation for {} must not be empty",
            answer.id
        )));
    }
    if route == Route::Document && answer.sql.is_some() {
        return Err(CopilotError::Internal(format!(
            "document answer {} must not carry sql",
            answer.id
        )));
    }
    Ok(())
}

/// Write answers as JSONL, one object per line, in the given order.
pub fn write_answers(path: impl AsRef<Path>, answers: &[Answer]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for answer in answers {
        serde_json::to_writer(&mut writer, answer)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    info!("Wrote {} answers to {}", answers.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn synthesis(value: Value) -> Synthesis {
        Synthesis {
            value,
            confidence: 0.9,
            explanation: "Looked it up.".to_string(),
            citations: vec!["product_policy::chunk0".to_string()],
        }
    }

    #[test]
    fn test_finalize_valid_answer() -> Result<()> {
        println!("📋 Testing finalization of a valid answer...");
        let question = Question::new("a1", "What is the return window?", "int");
        let answer = Finalizer::finalize(&question, Route::Document, synthesis(json!(14)), None)?;

        assert_eq!(answer.id, "a1");
        assert_eq!(answer.final_answer, json!(14));
        assert!(answer.sql.is_none());
        println!("✅ Answer passed the contract");
        Ok(())
    }

    #[test]
    fn test_document_answers_must_not_carry_sql() {
        let question = Question::new("a2", "What is the return window?", "int");
        let result = Finalizer::finalize(
            &question,
            Route::Document,
            synthesis(json!(14)),
            Some("SELECT 1".to_string()),
        );
        assert!(matches!(result, Err(CopilotError::Internal(_))));
    }

    #[test]
    fn test_null_payload_is_rejected() {
        let question = Question::new("a3", "anything", "int");
        let result = Finalizer::finalize(&question, Route::Data, synthesis(Value::Null), None);
        assert!(matches!(result, Err(CopilotError::Internal(_))));
    }

    #[test]
    fn test_out_of_range_confidence_is_rejected() {
        let question = Question::new("a4", "anything", "int");
        let mut bad = synthesis(json!(1));
        bad.confidence = 1.2;
        let result = Finalizer::finalize(&question, Route::Data, bad, None);
        assert!(matches!(result, Err(CopilotError::Internal(_))));
    }

    #[test]
    fn test_write_answers_jsonl() -> std::result::Result<(), Box<dyn std::error::Error>> {
        println!("📋 Testing JSONL output...");
        let path = std::env::temp_dir().join(format!("answers_{}.jsonl", uuid::Uuid::new_v4()));

        let answers = vec![
            Answer {
                id: "a1".to_string(),
                final_answer: json!(14),
                sql: None,
                confidence: 0.9,
                explanation: "Looked it up.".to_string(),
                citations: vec!["product_policy::chunk0".to_string()],
            },
            Answer {
                id: "a2".to_string(),
                final_answer: json!({"category": "Beverages", "quantity": 15}),
                sql: Some("SELECT 1".to_string()),
                confidence: 0.76,
                explanation: "Computed it.".to_string(),
                citations: vec!["Order Details".to_string()],
            },
        ];
        write_answers(&path, &answers)?;

        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Answer = serde_json::from_str(lines[0])?;
        assert_eq!(first.id, "a1");
        assert_eq!(first.sql, None);
        assert!(lines[0].contains("\"sql\":null"));

        let second: Answer = serde_json::from_str(lines[1])?;
        assert_eq!(second.final_answer["quantity"], json!(15));

        std::fs::remove_file(&path)?;
        println!("✅ Wrote and re-read {} answers", lines.len());
        Ok(())
    }
}
