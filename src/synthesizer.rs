//! Answer synthesis
//!
//! Takes whatever evidence the pipeline gathered (document chunks, a
//! query result, or neither) and produces the final payload, a
//! confidence score, an explanation and citations. Missing evidence
//! never raises: the answer degrades to the shape's typed zero value
//! with a floor confidence instead.
//!
//! Confidence is the product of three factors: how the route was chosen
//! (model beats heuristic), how much of the required evidence was
//! actually used, and how cleanly execution went. The products keep the
//! ordering terminal < legitimately-empty < repaired < clean.

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Number, Value};
use tracing::debug;

use crate::executor::QueryRows;
use crate::planner::{MetricKind, Plan};
use crate::question::{AnswerShape, FieldKind, Question};
use crate::retrieval::RetrievedChunk;
use crate::router::{Route, RouteDecision};
use crate::sql::CandidateQuery;

lazy_static! {
    static ref INTEGER_RE: Regex = Regex::new(r"(-?\d+)").unwrap();
    static ref NUMBER_RE: Regex = Regex::new(r"(-?\d+(?:\.\d+)?)").unwrap();
}

/// What the data leg of the pipeline produced for this question.
#[derive(Debug)]
pub enum DataOutcome {
    /// Document-only route; no query was supposed to run.
    NotAttempted,
    /// The final query executed; rows may still be empty.
    Rows {
        rows: QueryRows,
        query: CandidateQuery,
        attempts: u32,
    },
    /// Compilation was rejected or every execution attempt failed.
    Failed {
        query: Option<CandidateQuery>,
        attempts: u32,
        error: String,
    },
}

impl DataOutcome {
    /// The query text worth reporting to the caller, if any exists.
    pub fn sql(&self) -> Option<&str> {
        match self {
            DataOutcome::Rows { query, .. } => Some(&query.text),
            DataOutcome::Failed {
                query: Some(query), ..
            } => Some(&query.text),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DataOutcome::NotAttempted => 0,
            DataOutcome::Rows { attempts, .. } => *attempts,
            DataOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub value: Value,
    pub confidence: f64,
    pub explanation: String,
    pub citations: Vec<String>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn evidence_factor(used: u32, required: u32) -> f64 {
    let required = required.max(1);
    let used = used.min(required);
    0.25 + 0.75 * (used as f64 / required as f64)
}

fn score_confidence(route_certainty: f64, used: u32, required: u32, execution: f64) -> f64 {
    round2((route_certainty * evidence_factor(used, required) * execution).clamp(0.0, 1.0))
}

/// Confidence for answers that bypass synthesis entirely (timeouts,
/// aborted questions). At or below every synthesized confidence.
pub fn fallback_confidence() -> f64 {
    score_confidence(0.7, 0, 1, 0.15)
}

pub fn synthesize(
    question: &Question,
    shape: &AnswerShape,
    decision: &RouteDecision,
    plan: &Plan,
    chunks: &[RetrievedChunk],
    data: &DataOutcome,
) -> Synthesis {
    let synthesis = match decision.route {
        Route::Document => synthesize_document(question, shape, decision, chunks),
        Route::Data | Route::Combined => synthesize_data(shape, decision, plan, chunks, data),
    };
    debug!(
        "Synthesized answer for {} with confidence {:.2}",
        question.id, synthesis.confidence
    );
    synthesis
}

fn synthesize_document(
    question: &Question,
    shape: &AnswerShape,
    decision: &RouteDecision,
    chunks: &[RetrievedChunk],
) -> Synthesis {
    match extract_from_documents(&question.question, shape, chunks) {
        Some(extraction) => Synthesis {
            value: extraction.value,
            confidence: score_confidence(decision.certainty(), 1, 1, 1.0),
            explanation: format!(
                "Looked up the answer in the {} document and extracted it from the best matching line.",
                extraction.source
            ),
            citations: vec![extraction.chunk_id],
        },
        None => Synthesis {
            value: shape.zero_value(),
            confidence: score_confidence(decision.certainty(), 0, 1, 1.0),
            explanation:
                "No document line matched the question; returning the documented default."
                    .to_string(),
            citations: chunks.iter().take(3).map(|c| c.id.clone()).collect(),
        },
    }
}

fn synthesize_data(
    shape: &AnswerShape,
    decision: &RouteDecision,
    plan: &Plan,
    chunks: &[RetrievedChunk],
    data: &DataOutcome,
) -> Synthesis {
    let certainty = decision.certainty();
    let required = decision.route.required_evidence();
    let context_sources = plan.context_sources();
    let doc_used = if decision.route == Route::Combined && !context_sources.is_empty() {
        1
    } else {
        0
    };
    let context_lead = if decision.route == Route::Combined {
        context_sentence(plan)
    } else {
        None
    };

    let mut synthesis = match data {
        DataOutcome::Rows {
            rows,
            query,
            attempts,
        } if !rows.is_empty() => {
            let execution = if *attempts > 1 { 0.85 } else { 1.0 };
            Synthesis {
                value: shape_rows(shape, rows),
                confidence: score_confidence(certainty, doc_used + 1, required, execution),
                explanation: join_sentences(context_lead, success_sentence(plan, *attempts)),
                citations: assemble_citations(&query.tables, &context_sources),
            }
        }
        DataOutcome::Rows { query, .. } => Synthesis {
            value: shape.zero_value(),
            confidence: score_confidence(certainty, doc_used, required, 0.4),
            explanation: join_sentences(context_lead, empty_sentence(plan)),
            citations: assemble_citations(&query.tables, &context_sources),
        },
        DataOutcome::Failed {
            query, attempts, ..
        } => {
            let sentence = match query {
                Some(_) => {
                    let noun = if *attempts == 1 { "attempt" } else { "attempts" };
                    format!(
                        "Query execution did not succeed after {} {}; returning the documented default.",
                        attempts, noun
                    )
                }
                None => "No valid query could be compiled; returning the documented default."
                    .to_string(),
            };
            let tables: &[String] = query.as_ref().map(|q| q.tables.as_slice()).unwrap_or(&[]);
            Synthesis {
                value: shape.zero_value(),
                confidence: score_confidence(certainty, doc_used, required, 0.15),
                explanation: join_sentences(context_lead, sentence),
                citations: assemble_citations(tables, &context_sources),
            }
        }
        DataOutcome::NotAttempted => Synthesis {
            value: shape.zero_value(),
            confidence: score_confidence(certainty, doc_used, required, 0.15),
            explanation: join_sentences(
                context_lead,
                "No data query was attempted; returning the documented default.".to_string(),
            ),
            citations: assemble_citations(&[], &context_sources),
        },
    };

    // No query tables and no context sources survived; the retrieved
    // chunks still count as consulted evidence.
    if synthesis.citations.is_empty() && !chunks.is_empty() {
        synthesis.citations = chunks.iter().take(3).map(|c| c.id.clone()).collect();
    }
    synthesis
}

/// Tables first in FROM/JOIN order, then context chunk ids, first use wins.
fn assemble_citations(tables: &[String], context_sources: &[String]) -> Vec<String> {
    tables
        .iter()
        .cloned()
        .chain(context_sources.iter().cloned())
        .unique()
        .collect()
}

fn join_sentences(lead: Option<String>, body: String) -> String {
    match lead {
        Some(lead) => format!("{} {}", lead, body),
        None => body,
    }
}

fn context_sentence(plan: &Plan) -> Option<String> {
    let params = plan.context_params();
    match (
        params.get("period"),
        params.get("date_start"),
        params.get("date_end"),
    ) {
        (Some(period), Some(start), Some(end)) => Some(format!(
            "Resolved the {} reporting window ({} to {}) from the reference documents.",
            period, start, end
        )),
        (None, Some(start), Some(end)) => Some(format!(
            "Resolved the reporting window {} to {} from the reference documents.",
            start, end
        )),
        _ => params.get("cost_factor").map(|factor| {
            format!(
                "Resolved the cost factor {} from the KPI definitions.",
                factor
            )
        }),
    }
}

fn success_sentence(plan: &Plan, attempts: u32) -> String {
    let step = plan.metric_step();
    let metric = step
        .and_then(|s| s.params.get("metric"))
        .and_then(|token| MetricKind::parse(token))
        .map(|kind| kind.description().to_string())
        .unwrap_or_else(|| "the requested result".to_string());

    let mut text = format!("Computed {}", metric);
    if let Some(group) = step.and_then(|s| s.params.get("group_by")) {
        text.push_str(&format!(" per {}", group));
        if let Some(top_n) = step.and_then(|s| s.params.get("top_n")) {
            if top_n != "1" {
                text.push_str(&format!(" (top {})", top_n));
            }
        }
    }
    if let Some(category) = step.and_then(|s| s.params.get("category")) {
        text.push_str(&format!(" for the {} category", category));
    }
    text.push_str(" from the sales database.");
    if attempts > 1 {
        text.push_str(" The query was repaired after an execution error.");
    }
    text
}

fn empty_sentence(plan: &Plan) -> String {
    let params = plan.context_params();
    match (params.get("date_start"), params.get("date_end")) {
        (Some(start), Some(end)) => format!(
            "No matching rows were found between {} and {}; returning the documented default.",
            start, end
        ),
        _ => "No matching rows were found; returning the documented default.".to_string(),
    }
}

struct DocExtraction {
    value: Value,
    chunk_id: String,
    source: String,
}

fn doc_tokens(question: &str) -> Vec<String> {
    let lowered = question.to_lowercase();
    lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| {
            token.len() >= 3
                && !matches!(
                    *token,
                    "the" | "for" | "was" | "what" | "which" | "during" | "and" | "are" | "does"
                )
        })
        .map(|token| token.to_string())
        .unique()
        .collect()
}

/// Pick the best matching document line and pull a typed value out of it.
///
/// A line qualifies when at least two question tokens appear in it;
/// numeric shapes additionally require a number on the line. List and
/// object shapes are never satisfiable from prose, so they always fall
/// through to the typed default.
fn extract_from_documents(
    question: &str,
    shape: &AnswerShape,
    chunks: &[RetrievedChunk],
) -> Option<DocExtraction> {
    let tokens = doc_tokens(question);
    let needs_number = matches!(shape, AnswerShape::Int | AnswerShape::Float);

    let mut best: Option<(usize, &RetrievedChunk, String)> = None;
    for chunk in chunks {
        for line in chunk.text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if needs_number && !NUMBER_RE.is_match(trimmed) {
                continue;
            }
            let lowered = trimmed.to_lowercase();
            let overlap = tokens
                .iter()
                .filter(|token| lowered.contains(token.as_str()))
                .count();
            if overlap < 2 {
                continue;
            }
            let better = match &best {
                Some((best_overlap, _, _)) => overlap > *best_overlap,
                None => true,
            };
            if better {
                best = Some((overlap, chunk, trimmed.to_string()));
            }
        }
    }

    let (_, chunk, line) = best?;
    let value = extract_value(shape, &line)?;
    Some(DocExtraction {
        value,
        chunk_id: chunk.id.clone(),
        source: chunk.source.clone(),
    })
}

fn extract_value(shape: &AnswerShape, line: &str) -> Option<Value> {
    match shape {
        AnswerShape::Int => INTEGER_RE
            .captures(line)
            .and_then(|caps| caps[1].parse::<i64>().ok())
            .map(Value::from),
        AnswerShape::Float => NUMBER_RE
            .captures(line)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .and_then(|value| Number::from_f64(round2(value)))
            .map(Value::Number),
        AnswerShape::Text => {
            let cleaned = line
                .trim_start_matches(|c: char| c == '-' || c == '*' || c == ' ')
                .trim();
            Some(Value::String(cleaned.to_string()))
        }
        AnswerShape::List | AnswerShape::Object(_) => None,
    }
}

/// Coerce a query result into the requested shape.
fn shape_rows(shape: &AnswerShape, rows: &QueryRows) -> Value {
    if rows.is_empty() {
        return shape.zero_value();
    }
    match shape {
        AnswerShape::Int => Value::from(coerce_i64(&first_cell(rows))),
        AnswerShape::Float => float_value(coerce_f64(&first_cell(rows))),
        AnswerShape::Text => coerce_string(&first_cell(rows)),
        AnswerShape::List => Value::Array(
            rows.rows
                .iter()
                .map(|row| row_object(&rows.columns, row))
                .collect(),
        ),
        AnswerShape::Object(fields) => object_from_row(fields, &rows.columns, &rows.rows[0]),
    }
}

fn first_cell(rows: &QueryRows) -> Value {
    rows.rows
        .first()
        .and_then(|row| row.first())
        .cloned()
        .unwrap_or(Value::Null)
}

fn row_object(columns: &[String], row: &[Value]) -> Value {
    let map: serde_json::Map<String, Value> = columns
        .iter()
        .cloned()
        .zip(row.iter().cloned())
        .collect();
    Value::Object(map)
}

fn object_from_row(fields: &[(String, FieldKind)], columns: &[String], row: &[Value]) -> Value {
    let mut map = serde_json::Map::new();
    for (position, (key, kind)) in fields.iter().enumerate() {
        let cell = locate_column(key, columns, position).and_then(|index| row.get(index));
        let value = match (cell, kind) {
            (Some(cell), FieldKind::Int) => Value::from(coerce_i64(cell)),
            (Some(cell), FieldKind::Float) => float_value(coerce_f64(cell)),
            (Some(cell), FieldKind::Text) => coerce_string(cell),
            (None, kind) => kind.zero_value(),
        };
        map.insert(key.clone(), value);
    }
    Value::Object(map)
}

/// Exact column match, then substring match (`quantity` finds
/// `total_quantity`), then the field's position in the hint.
fn locate_column(key: &str, columns: &[String], position: usize) -> Option<usize> {
    let needle = key.to_lowercase();
    if let Some(index) = columns.iter().position(|c| c.to_lowercase() == needle) {
        return Some(index);
    }
    if let Some(index) = columns.iter().position(|c| c.to_lowercase().contains(&needle)) {
        return Some(index);
    }
    if position < columns.len() {
        return Some(position);
    }
    None
}

fn float_value(value: f64) -> Value {
    Number::from_f64(round2(value))
        .map(Value::Number)
        .unwrap_or_else(|| json!(0.0))
}

fn coerce_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .unwrap_or(0),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f.round() as i64))
            .unwrap_or(0),
        Value::Bool(b) => *b as i64,
        _ => 0,
    }
}

fn coerce_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(b) => *b as i64 as f64,
        _ => 0.0,
    }
}

fn coerce_string(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.clone()),
        Value::Null => Value::String(String::new()),
        other => Value::String(other.to_string()),
    }
}
