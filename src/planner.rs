//! Deterministic question planning
//!
//! The planner turns a routed question plus its retrieved context into
//! an explicit step list. No transformer is involved: metric detection,
//! date resolution and category resolution are all rule based, so the
//! same question and corpus always produce the same plan. Anything the
//! rules cannot express is left for the query compiler's transformer
//! path via an unparameterized metric step.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::question::Question;
use crate::retrieval::RetrievedChunk;
use crate::router::Route;

lazy_static! {
    static ref DATE_RANGE_RE: Regex =
        Regex::new(r"(\d{4}-\d{2}-\d{2})\s*(?:to|through|until|[-–—])\s*(\d{4}-\d{2}-\d{2})")
            .unwrap();
    static ref YEAR_RE: Regex = Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap();
    static ref TOP_N_RE: Regex = Regex::new(r"(?i)\btop\s+(\d+)").unwrap();
    static ref PERCENT_RE: Regex = Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap();
    static ref CATALOG_ITEM_RE: Regex = Regex::new(r"(?m)^\s*[-*]\s*([A-Za-z][A-Za-z /]*?)\s*:").unwrap();
    static ref CATEGORY_PHRASE_RE: Regex =
        Regex::new(r"(?i)\bfrom\s+(?:the\s+)?([A-Za-z][A-Za-z/ ]*?)\s+category\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Extract the answer from document text.
    Lookup,
    /// Resolve values (dates, factors) that parameterize the data step.
    Context,
    /// Compute a value from the database.
    Metric,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Lookup => "lookup",
            StepKind::Context => "context",
            StepKind::Metric => "metric",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub kind: StepKind,
    pub instruction: String,
    pub params: BTreeMap<String, String>,
    pub sources: Vec<String>,
}

impl PlanStep {
    pub fn new(kind: StepKind, instruction: impl Into<String>) -> Self {
        Self {
            kind,
            instruction: instruction.into(),
            params: BTreeMap::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_source(mut self, chunk_id: impl Into<String>) -> Self {
        self.sources.push(chunk_id.into());
        self
    }

    pub fn describe(&self) -> String {
        let mut text = format!("{}: {}", self.kind.as_str(), self.instruction);
        if !self.params.is_empty() {
            let params = self
                .params
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .join(", ");
            text.push_str(&format!(" [{}]", params));
        }
        text
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn metric_step(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.kind == StepKind::Metric)
    }

    /// Parameters resolved by context steps, merged in step order.
    pub fn context_params(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for step in self.steps.iter().filter(|s| s.kind == StepKind::Context) {
            for (key, value) in &step.params {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Chunk ids consulted while planning, first use wins.
    pub fn context_sources(&self) -> Vec<String> {
        self.steps
            .iter()
            .flat_map(|step| step.sources.iter().cloned())
            .unique()
            .collect()
    }

    pub fn summary(&self) -> String {
        if self.steps.is_empty() {
            return "no steps".to_string();
        }
        self.steps.iter().map(|step| step.describe()).join("; ")
    }
}

/// Metrics the template compiler knows how to express directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Revenue,
    AverageOrderValue,
    GrossMargin,
    UnitsSold,
}

impl MetricKind {
    pub fn detect(question: &str) -> Option<MetricKind> {
        let lowered = question.to_lowercase();
        if lowered.contains("average order value") || lowered.contains("aov") {
            Some(MetricKind::AverageOrderValue)
        } else if lowered.contains("margin") {
            Some(MetricKind::GrossMargin)
        } else if lowered.contains("revenue") || lowered.contains("sales") {
            Some(MetricKind::Revenue)
        } else if lowered.contains("units")
            || lowered.contains("quantity")
            || lowered.contains("sold the most")
        {
            Some(MetricKind::UnitsSold)
        } else {
            None
        }
    }

    pub fn parse(token: &str) -> Option<MetricKind> {
        match token.trim().to_lowercase().as_str() {
            "revenue" => Some(MetricKind::Revenue),
            "average_order_value" | "aov" => Some(MetricKind::AverageOrderValue),
            "gross_margin" | "margin" => Some(MetricKind::GrossMargin),
            "units_sold" | "units" => Some(MetricKind::UnitsSold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Revenue => "revenue",
            MetricKind::AverageOrderValue => "average_order_value",
            MetricKind::GrossMargin => "gross_margin",
            MetricKind::UnitsSold => "units_sold",
        }
    }

    /// Column alias the template queries give this metric.
    pub fn alias(&self) -> &'static str {
        match self {
            MetricKind::Revenue => "revenue",
            MetricKind::AverageOrderValue => "aov",
            MetricKind::GrossMargin => "margin",
            MetricKind::UnitsSold => "total_quantity",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            MetricKind::Revenue => "total revenue",
            MetricKind::AverageOrderValue => "average order value",
            MetricKind::GrossMargin => "gross margin",
            MetricKind::UnitsSold => "units sold",
        }
    }
}

struct DateRange {
    start: String,
    end: String,
    label: Option<String>,
    source: Option<String>,
}

fn valid_date(text: &str) -> bool {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

fn question_tokens(question: &str) -> Vec<String> {
    let lowered = question.to_lowercase();
    lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() >= 3 && !matches!(*token, "the" | "for" | "was" | "what" | "which" | "during" | "and"))
        .map(|token| token.to_string())
        .unique()
        .collect()
}

/// Find the document line whose date range belongs to this question.
///
/// Campaign lines look like `Winter Classics 1997: 1997-12-01 to
/// 1997-12-31`. A line qualifies when at least two question tokens
/// appear in it; the best overlap wins, first seen wins ties. Without
/// any qualifying line a bare year in the question scopes the query to
/// that calendar year.
fn resolve_date_range(question: &str, chunks: &[RetrievedChunk]) -> Option<DateRange> {
    let tokens = question_tokens(question);
    let mut best: Option<(usize, DateRange)> = None;

    for chunk in chunks {
        for line in chunk.text.lines() {
            let caps = match DATE_RANGE_RE.captures(line) {
                Some(caps) => caps,
                None => continue,
            };
            let start = caps[1].to_string();
            let end = caps[2].to_string();
            if !valid_date(&start) || !valid_date(&end) {
                continue;
            }

            let lowered = line.to_lowercase();
            let overlap = tokens.iter().filter(|token| lowered.contains(token.as_str())).count();
            if overlap < 2 {
                continue;
            }

            let label = line.split(':').next().and_then(|prefix| {
                let cleaned = prefix.trim_start_matches(['-', '*', ' ']).trim();
                if cleaned.is_empty() || cleaned == line.trim() {
                    None
                } else {
                    Some(cleaned.to_string())
                }
            });

            let replace = match &best {
                Some((best_overlap, _)) => overlap > *best_overlap,
                None => true,
            };
            if replace {
                best = Some((
                    overlap,
                    DateRange {
                        start,
                        end,
                        label,
                        source: Some(chunk.id.clone()),
                    },
                ));
            }
        }
    }

    if let Some((_, range)) = best {
        return Some(range);
    }

    YEAR_RE.captures(question).map(|caps| {
        let year = caps[1].to_string();
        DateRange {
            start: format!("{}-01-01", year),
            end: format!("{}-12-31", year),
            label: Some(format!("calendar year {}", year)),
            source: None,
        }
    })
}

/// Cost-of-goods factor from KPI docs, e.g. "approximated as 70% of UnitPrice".
fn resolve_cost_factor(chunks: &[RetrievedChunk]) -> Option<(String, String)> {
    for chunk in chunks {
        for line in chunk.text.lines() {
            if !line.to_lowercase().contains("cost") {
                continue;
            }
            let caps = match PERCENT_RE.captures(line) {
                Some(caps) => caps,
                None => continue,
            };
            if let Ok(percent) = caps[1].parse::<f64>() {
                if percent > 0.0 && percent < 100.0 {
                    return Some((format!("{}", percent / 100.0), chunk.id.clone()));
                }
            }
        }
    }
    None
}

/// Resolve a category filter value.
///
/// Explicit "from the X category" phrasing wins; otherwise category
/// names listed in catalog documents are matched against the question.
/// The resolved campaign label is masked out first so a campaign named
/// after a category ("Summer Beverages 1997") does not read as a filter.
fn resolve_category(
    question: &str,
    campaign: Option<&str>,
    chunks: &[RetrievedChunk],
) -> Option<(String, Option<String>)> {
    if let Some(caps) = CATEGORY_PHRASE_RE.captures(question) {
        return Some((caps[1].trim().to_string(), None));
    }

    let mut haystack = question.to_lowercase();
    if let Some(campaign) = campaign {
        haystack = haystack.replace(&campaign.to_lowercase(), " ");
    }
    for chunk in chunks {
        if !chunk.source.to_lowercase().contains("catalog") {
            continue;
        }
        for caps in CATALOG_ITEM_RE.captures_iter(&chunk.text) {
            let name = caps[1].trim().to_string();
            if name.len() < 3 {
                continue;
            }
            if haystack.contains(&name.to_lowercase()) {
                return Some((name, Some(chunk.id.clone())));
            }
        }
    }
    None
}

fn detect_group_by(question: &str) -> Option<&'static str> {
    let lowered = question.to_lowercase();
    if lowered.contains("categor") {
        Some("category")
    } else if lowered.contains("product") {
        Some("product")
    } else if lowered.contains("customer") {
        Some("customer")
    } else {
        None
    }
}

fn detect_top_n(question: &str) -> u32 {
    TOP_N_RE
        .captures(question)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .map(|n| n.max(1))
        .unwrap_or(1)
}

pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Planner
    }

    pub fn plan(&self, question: &Question, route: Route, chunks: &[RetrievedChunk]) -> Plan {
        if route == Route::Document {
            let step = PlanStep::new(
                StepKind::Lookup,
                "Find the document line that answers the question and extract the requested value",
            );
            return Plan { steps: vec![step] };
        }

        let text = &question.question;
        let metric = MetricKind::detect(text);
        let group_by = detect_group_by(text);
        let top_n = detect_top_n(text);

        let mut steps = Vec::new();

        let range = resolve_date_range(text, chunks);
        let campaign = range.as_ref().and_then(|r| r.label.clone());

        let mut context = PlanStep::new(StepKind::Context, String::new());
        let mut resolved = Vec::new();
        if let Some(range) = range {
            resolved.push(format!("reporting window {} to {}", range.start, range.end));
            context = context
                .with_param("date_start", range.start)
                .with_param("date_end", range.end);
            if let Some(label) = range.label {
                context = context.with_param("period", label);
            }
            if let Some(source) = range.source {
                context = context.with_source(source);
            }
        }
        if metric == Some(MetricKind::GrossMargin) {
            if let Some((factor, source)) = resolve_cost_factor(chunks) {
                resolved.push(format!("cost factor {}", factor));
                context = context.with_param("cost_factor", factor).with_source(source);
            }
        }
        if !context.params.is_empty() {
            context.instruction = format!("Resolve {} from the reference documents", resolved.join(" and "));
            steps.push(context);
        }

        let mut metric_step = match metric {
            Some(kind) => {
                let mut instruction = format!("Compute {}", kind.description());
                if let Some(group) = group_by {
                    instruction.push_str(&format!(" per {}", group));
                    if top_n > 1 {
                        instruction.push_str(&format!(" and keep the top {}", top_n));
                    } else {
                        instruction.push_str(" and keep the leader");
                    }
                }
                PlanStep::new(StepKind::Metric, instruction).with_param("metric", kind.as_str())
            }
            None => PlanStep::new(
                StepKind::Metric,
                "Answer the question with a single read-only SQLite query",
            ),
        };
        if let Some(group) = group_by {
            metric_step = metric_step
                .with_param("group_by", group)
                .with_param("top_n", top_n.to_string());
        }
        // Ranking categories already; a category filter would be circular
        if group_by != Some("category") {
            if let Some((category, source)) = resolve_category(text, campaign.as_deref(), chunks) {
                metric_step = metric_step.with_param("category", category);
                if let Some(chunk_id) = source {
                    metric_step = metric_step.with_source(chunk_id);
                }
            }
        }
        steps.push(metric_step);

        Plan { steps }
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}
