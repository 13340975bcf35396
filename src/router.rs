//! Question routing
//!
//! Every question is classified into one of three resolution routes.
//! The transformer gets the first shot; when it is offline or returns
//! an unusable label the keyword heuristic decides instead. Routing
//! itself never fails a question.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CopilotError, Result};
use crate::llm::{strip_code_fences, TextTransformer, TransformerPrompt};
use crate::question::Question;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Document,
    Data,
    Combined,
}

impl Route {
    /// Accepts the canonical labels plus the aliases older prompt
    /// revisions trained callers to use.
    pub fn parse_label(label: &str) -> Option<Route> {
        match label.trim().to_lowercase().as_str() {
            "document" | "docs" | "rag" => Some(Route::Document),
            "data" | "sql" => Some(Route::Data),
            "combined" | "hybrid" | "both" => Some(Route::Combined),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Document => "document",
            Route::Data => "data",
            Route::Combined => "combined",
        }
    }

    pub fn needs_documents(&self) -> bool {
        matches!(self, Route::Document | Route::Combined)
    }

    pub fn needs_data(&self) -> bool {
        matches!(self, Route::Data | Route::Combined)
    }

    /// Evidence legs a fully supported answer on this route uses.
    pub fn required_evidence(&self) -> u32 {
        match self {
            Route::Combined => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Model,
    Heuristic,
}

impl RouteSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteSource::Model => "model",
            RouteSource::Heuristic => "heuristic",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouteDecision {
    pub route: Route,
    pub source: RouteSource,
}

impl RouteDecision {
    /// How much the confidence formula trusts this routing decision.
    pub fn certainty(&self) -> f64 {
        match self.source {
            RouteSource::Model => 0.9,
            RouteSource::Heuristic => 0.7,
        }
    }
}

const DOCUMENT_MARKERS: &[&str] = &[
    "policy",
    "according to",
    "documentation",
    "return window",
    "warranty",
    "guide",
    "handbook",
];

const DATA_MARKERS: &[&str] = &[
    "top ",
    "revenue",
    "average",
    "total",
    "sum",
    "count",
    "how many",
    "margin",
    "quantity",
    "most",
    "best",
    "aov",
    "orders",
    "sales",
    "units",
];

const CONTEXT_MARKERS: &[&str] = &[
    "campaign",
    "during",
    "promo",
    "calendar",
    "kpi",
    "definition",
    "margin",
    "average order value",
];

/// Keyword fallback used whenever the transformer cannot classify.
pub fn heuristic_route(question: &str) -> Route {
    let lowered = question.to_lowercase();
    let document = DOCUMENT_MARKERS.iter().any(|m| lowered.contains(m));
    let data = DATA_MARKERS.iter().any(|m| lowered.contains(m));
    let context = CONTEXT_MARKERS.iter().any(|m| lowered.contains(m));

    if document && !data {
        Route::Document
    } else if data && (document || context) {
        Route::Combined
    } else if data {
        Route::Data
    } else if document {
        Route::Document
    } else {
        // No signal either way: assume both legs may be needed
        Route::Combined
    }
}

pub struct Router {
    transformer: Arc<dyn TextTransformer>,
}

impl Router {
    pub fn new(transformer: Arc<dyn TextTransformer>) -> Self {
        Self { transformer }
    }

    pub async fn route(&self, question: &Question) -> RouteDecision {
        match self.classify(question).await {
            Ok(route) => {
                info!("Routed question {} to {} (model)", question.id, route.as_str());
                RouteDecision {
                    route,
                    source: RouteSource::Model,
                }
            }
            Err(err) => {
                let route = heuristic_route(&question.question);
                warn!(
                    "Route classification failed ({}), heuristic chose {}",
                    err,
                    route.as_str()
                );
                RouteDecision {
                    route,
                    source: RouteSource::Heuristic,
                }
            }
        }
    }

    async fn classify(&self, question: &Question) -> Result<Route> {
        let mut parts = Vec::new();
        parts.push(format!("QUESTION: {}", question.question));
        if !question.format_hint.is_empty() {
            parts.push(format!("EXPECTED ANSWER FORMAT: {}", question.format_hint));
        }
        parts.push(String::new());
        parts.push("Classify how this retail analytics question should be resolved:".to_string());
        parts.push("- document: answerable from policy or reference documents alone".to_string());
        parts.push("- data: answerable by querying the sales database alone".to_string());
        parts.push(
            "- combined: needs document context (campaign dates, KPI definitions) plus a database query"
                .to_string(),
        );
        parts.push(String::new());
        parts.push("Reply with exactly one word: document, data, or combined.".to_string());

        let prompt = TransformerPrompt::new(
            "You classify analytics questions. Reply with one word only.",
            parts.join("\n"),
        );
        let reply = self.transformer.complete(&prompt).await?;
        let label = strip_code_fences(&reply);
        Route::parse_label(&label)
            .ok_or_else(|| CopilotError::Llm(format!("unrecognized route label: {}", label)))
    }
}
