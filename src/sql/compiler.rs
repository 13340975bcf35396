//! Question-to-SQL compilation
//!
//! Plans whose metric step carries a known metric compile through fixed
//! KPI templates with no transformer involvement, which is what keeps
//! the benchmark questions deterministic. Only unparameterized plans go
//! to the transformer, and either way the result must pass the guard
//! before it becomes a candidate.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::llm::{strip_code_fences, TextTransformer, TransformerPrompt};
use crate::planner::{MetricKind, Plan};
use crate::question::Question;
use crate::schema::SchemaDescription;

use super::guard;
use super::CandidateQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupBy {
    Product,
    Category,
    Customer,
}

impl GroupBy {
    fn parse(token: &str) -> Option<GroupBy> {
        match token {
            "product" => Some(GroupBy::Product),
            "category" => Some(GroupBy::Category),
            "customer" => Some(GroupBy::Customer),
            _ => None,
        }
    }

    fn dimension(&self) -> (&'static str, &'static str) {
        match self {
            GroupBy::Product => ("p.ProductName", "product"),
            GroupBy::Category => ("c.CategoryName", "category"),
            GroupBy::Customer => ("cu.CompanyName", "customer"),
        }
    }
}

struct MetricSpec {
    metric: MetricKind,
    group_by: Option<GroupBy>,
    top_n: u32,
    category: Option<String>,
    date_range: Option<(String, String)>,
    cost_factor: f64,
}

fn spec_from_plan(plan: &Plan) -> Option<MetricSpec> {
    let step = plan.metric_step()?;
    let metric = MetricKind::parse(step.params.get("metric")?)?;
    let group_by = match step.params.get("group_by") {
        Some(token) => Some(GroupBy::parse(token)?),
        None => None,
    };
    let top_n = step
        .params
        .get("top_n")
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(1)
        .max(1);
    let category = step.params.get("category").cloned();

    let context = plan.context_params();
    let date_range = match (context.get("date_start"), context.get("date_end")) {
        (Some(start), Some(end)) => Some((start.clone(), end.clone())),
        _ => None,
    };
    let cost_factor = context
        .get("cost_factor")
        .and_then(|f| f.parse::<f64>().ok())
        .unwrap_or(0.7);

    Some(MetricSpec {
        metric,
        group_by,
        top_n,
        category,
        date_range,
        cost_factor,
    })
}

/// Render a KPI template for this plan, or None when the plan is not
/// template-shaped or the schema lacks the Northwind tables it needs.
pub(crate) fn render_template(plan: &Plan, schema: &SchemaDescription) -> Option<String> {
    let spec = spec_from_plan(plan)?;

    let needs_orders = spec.date_range.is_some()
        || spec.metric == MetricKind::AverageOrderValue
        || spec.group_by == Some(GroupBy::Customer);
    let needs_products = spec.category.is_some()
        || matches!(spec.group_by, Some(GroupBy::Product) | Some(GroupBy::Category));
    let needs_categories = spec.category.is_some() || spec.group_by == Some(GroupBy::Category);
    let needs_customers = spec.group_by == Some(GroupBy::Customer);

    let mut required = vec!["Order Details"];
    if needs_orders {
        required.push("Orders");
    }
    if needs_products {
        required.push("Products");
    }
    if needs_categories {
        required.push("Categories");
    }
    if needs_customers {
        required.push("Customers");
    }
    if !required.iter().all(|table| schema.has_table(table)) {
        return None;
    }

    let measure = match spec.metric {
        MetricKind::Revenue => {
            "SUM(od.UnitPrice * od.Quantity * (1 - od.Discount)) AS revenue".to_string()
        }
        MetricKind::AverageOrderValue => {
            "SUM(od.UnitPrice * od.Quantity * (1 - od.Discount)) / COUNT(DISTINCT o.OrderID) AS aov"
                .to_string()
        }
        MetricKind::GrossMargin => {
            let margin_factor = ((1.0 - spec.cost_factor) * 1000.0).round() / 1000.0;
            format!(
                "SUM({} * od.UnitPrice * od.Quantity * (1 - od.Discount)) AS margin",
                margin_factor
            )
        }
        MetricKind::UnitsSold => "SUM(od.Quantity) AS total_quantity".to_string(),
    };

    let dimension = spec.group_by.map(|g| g.dimension());

    let mut sql = String::from("SELECT ");
    if let Some((expr, alias)) = dimension {
        sql.push_str(&format!("{} AS {}, ", expr, alias));
    }
    sql.push_str(&measure);
    sql.push_str("\nFROM \"Order Details\" AS od");
    if needs_orders {
        sql.push_str("\nJOIN Orders AS o ON od.OrderID = o.OrderID");
    }
    if needs_products {
        sql.push_str("\nJOIN Products AS p ON od.ProductID = p.ProductID");
    }
    if needs_categories {
        sql.push_str("\nJOIN Categories AS c ON p.CategoryID = c.CategoryID");
    }
    if needs_customers {
        sql.push_str("\nJOIN Customers AS cu ON o.CustomerID = cu.CustomerID");
    }

    let mut predicates = Vec::new();
    if let Some((start, end)) = &spec.date_range {
        predicates.push(format!("o.OrderDate BETWEEN '{}' AND '{}'", start, end));
    }
    if let Some(category) = &spec.category {
        predicates.push(format!(
            "c.CategoryName = '{}'",
            category.replace('\'', "''")
        ));
    }
    if !predicates.is_empty() {
        sql.push_str("\nWHERE ");
        sql.push_str(&predicates.join("\n  AND "));
    }

    if let Some((expr, _)) = dimension {
        sql.push_str(&format!("\nGROUP BY {}", expr));
        sql.push_str(&format!("\nORDER BY {} DESC", spec.metric.alias()));
        sql.push_str(&format!("\nLIMIT {}", spec.top_n));
    }

    Some(sql)
}

pub struct QueryCompiler {
    transformer: Arc<dyn TextTransformer>,
}

impl QueryCompiler {
    pub fn new(transformer: Arc<dyn TextTransformer>) -> Self {
        Self { transformer }
    }

    pub async fn compile(
        &self,
        question: &Question,
        plan: &Plan,
        schema: &SchemaDescription,
    ) -> Result<CandidateQuery> {
        if let Some(sql) = render_template(plan, schema) {
            debug!("Template compiler handled question {}", question.id);
            let validated = guard::validate_query(&sql, schema)?;
            return Ok(CandidateQuery::new(validated, 1));
        }

        let prompt = self.build_prompt(question, plan, schema);
        let reply = self.transformer.complete(&prompt).await?;
        let sql = strip_code_fences(&reply);
        let validated = guard::validate_query(&sql, schema)?;
        Ok(CandidateQuery::new(validated, 1))
    }

    fn build_prompt(
        &self,
        question: &Question,
        plan: &Plan,
        schema: &SchemaDescription,
    ) -> TransformerPrompt {
        let mut parts = Vec::new();
        parts.push(format!("USER QUESTION: {}", question.question));
        if !question.format_hint.is_empty() {
            parts.push(format!("EXPECTED ANSWER FORMAT: {}", question.format_hint));
        }
        parts.push("\nPLAN:".to_string());
        parts.push(plan.summary());
        parts.push("\nRELEVANT SCHEMA:".to_string());
        parts.push(schema.to_prompt_text());
        parts.push("\nKPI FORMULAS:".to_string());
        parts.push("- revenue = SUM(UnitPrice * Quantity * (1 - Discount))".to_string());
        parts.push("- average order value = revenue / COUNT(DISTINCT OrderID)".to_string());
        parts.push(
            "- gross margin = SUM((1 - cost_factor) * UnitPrice * Quantity * (1 - Discount))"
                .to_string(),
        );
        parts.push("- units sold = SUM(Quantity)".to_string());
        parts.push("\nRULES:".to_string());
        parts.push("- Produce exactly one SQLite SELECT statement.".to_string());
        parts.push("- Use only tables and columns from the schema above.".to_string());
        parts.push("- Quote table names containing spaces, e.g. \"Order Details\".".to_string());
        parts.push("- Return only SQL, no commentary.".to_string());

        TransformerPrompt::new(
            "You translate retail analytics questions into a single read-only SQLite query.",
            parts.join("\n"),
        )
    }
}
