//! Read-only SQLite execution
//!
//! Each call opens its own connection with SQLITE_OPEN_READ_ONLY, runs
//! on the blocking pool, and returns column names plus JSON-typed rows.
//! Result sets are truncated at the configured row cap. Statement
//! failures keep the raw SQLite message because the repair loop parses
//! it for identifier hints.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{CopilotError, Result};

/// Tabular query result.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Execution seam; tests substitute scripted services.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryRows>;
}

#[derive(Debug)]
pub struct SqliteService {
    db_path: PathBuf,
    row_cap: usize,
}

impl SqliteService {
    pub fn new(db_path: &Path, row_cap: usize) -> Result<Self> {
        if !db_path.is_file() {
            return Err(CopilotError::Config(format!(
                "database not found: {}",
                db_path.display()
            )));
        }
        Ok(Self {
            db_path: db_path.to_path_buf(),
            row_cap,
        })
    }
}

#[async_trait]
impl QueryService for SqliteService {
    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        let path = self.db_path.clone();
        let sql = sql.to_string();
        let cap = self.row_cap;
        let result = tokio::task::spawn_blocking(move || run_query(&path, &sql, cap))
            .await
            .map_err(|e| CopilotError::Execution(format!("execution task failed: {}", e)))?;
        result.map_err(|e| CopilotError::Execution(e.to_string()))
    }
}

fn run_query(path: &Path, sql: &str, cap: usize) -> rusqlite::Result<QueryRows> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let width = columns.len();

    let mut rows = stmt.query([])?;
    let mut collected = Vec::new();
    while let Some(row) = rows.next()? {
        if collected.len() >= cap {
            debug!("Row cap {} reached, truncating result", cap);
            break;
        }
        let mut record = Vec::with_capacity(width);
        for index in 0..width {
            record.push(json_value(row.get_ref(index)?));
        }
        collected.push(record);
    }

    Ok(QueryRows {
        columns,
        rows: collected,
    })
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::from(v),
        ValueRef::Real(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}
