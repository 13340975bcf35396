//! Read-only query guard
//!
//! Defense in depth ahead of the read-only connection flags: a keyword
//! scan rejects anything mutating before parsing, then the statement
//! must parse as exactly one SELECT, then every referenced table must
//! exist in the schema. Column names are deliberately not checked here;
//! the execution loop repairs those from the real SQLite error.

use sqlparser::ast::{Query, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use itertools::Itertools;

use crate::error::{CopilotError, Result};
use crate::schema::SchemaDescription;

const MUTATING_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "create", "alter", "drop", "replace", "truncate", "attach",
    "detach", "pragma", "vacuum", "reindex", "analyze", "begin", "commit", "rollback",
];

#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    pub sql: String,
    /// Referenced tables in FROM/JOIN order, CTE names excluded.
    pub tables: Vec<String>,
}

/// Validate one candidate statement against the read-only contract.
pub fn validate_query(sql: &str, schema: &SchemaDescription) -> Result<ValidatedQuery> {
    let normalized = normalize(sql);
    if normalized.is_empty() {
        return Err(CopilotError::QueryRejected("empty statement".to_string()));
    }
    if let Some(keyword) = find_mutating_keyword(&normalized) {
        return Err(CopilotError::QueryRejected(format!(
            "mutating keyword '{}' is not allowed",
            keyword
        )));
    }

    let statements = Parser::parse_sql(&SQLiteDialect {}, &normalized)
        .map_err(|e| CopilotError::QueryRejected(format!("unparsable SQL: {}", e)))?;
    if statements.len() != 1 {
        return Err(CopilotError::QueryRejected(format!(
            "expected exactly one statement, found {}",
            statements.len()
        )));
    }
    let query = match &statements[0] {
        Statement::Query(query) => query,
        _ => {
            return Err(CopilotError::QueryRejected(
                "only SELECT statements are allowed".to_string(),
            ))
        }
    };

    let tables = referenced_tables(query);
    for table in &tables {
        if !schema.has_table(table) {
            let hint = schema
                .closest_table(table)
                .map(|(name, _)| format!(" (did you mean '{}'?)", name))
                .unwrap_or_default();
            return Err(CopilotError::QueryRejected(format!(
                "unknown table '{}'{}",
                table, hint
            )));
        }
    }

    Ok(ValidatedQuery {
        sql: normalized,
        tables,
    })
}

/// Trim whitespace and trailing semicolons.
fn normalize(sql: &str) -> String {
    let mut text = sql.trim();
    while let Some(stripped) = text.strip_suffix(';') {
        text = stripped.trim_end();
    }
    text.to_string()
}

fn find_mutating_keyword(sql: &str) -> Option<&'static str> {
    let lowered = sql.to_lowercase();
    for token in lowered.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        if let Some(hit) = MUTATING_KEYWORDS.iter().find(|keyword| **keyword == token) {
            return Some(*hit);
        }
    }
    None
}

/// Walk the AST collecting base table names in FROM/JOIN order.
fn referenced_tables(query: &Query) -> Vec<String> {
    let mut cte_names = Vec::new();
    let mut tables = Vec::new();
    collect_query(query, &mut cte_names, &mut tables);
    tables.into_iter().unique().collect()
}

fn collect_query(query: &Query, cte_names: &mut Vec<String>, tables: &mut Vec<String>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            cte_names.push(cte.alias.name.value.to_lowercase());
            collect_query(&cte.query, cte_names, tables);
        }
    }
    collect_set_expr(&query.body, cte_names, tables);
}

fn collect_set_expr(expr: &SetExpr, cte_names: &mut Vec<String>, tables: &mut Vec<String>) {
    match expr {
        SetExpr::Select(select) => {
            for item in &select.from {
                collect_table_with_joins(item, cte_names, tables);
            }
        }
        SetExpr::Query(query) => collect_query(query, cte_names, tables),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, cte_names, tables);
            collect_set_expr(right, cte_names, tables);
        }
        _ => {}
    }
}

fn collect_table_with_joins(item: &TableWithJoins, cte_names: &mut Vec<String>, tables: &mut Vec<String>) {
    collect_table_factor(&item.relation, cte_names, tables);
    for join in &item.joins {
        collect_table_factor(&join.relation, cte_names, tables);
    }
}

fn collect_table_factor(factor: &TableFactor, cte_names: &mut Vec<String>, tables: &mut Vec<String>) {
    match factor {
        TableFactor::Table { name, .. } => {
            if let Some(ident) = name.0.last() {
                if !cte_names.contains(&ident.value.to_lowercase()) {
                    tables.push(ident.value.clone());
                }
            }
        }
        TableFactor::Derived { subquery, .. } => collect_query(subquery, cte_names, tables),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, cte_names, tables),
        _ => {}
    }
}
