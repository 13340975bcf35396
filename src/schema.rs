//! SQLite schema introspection
//!
//! The live schema feeds three consumers: prompt text for the
//! transformer, table validation in the query guard, and fuzzy
//! suggestions for repair hints. Tables come back in sqlite_master
//! name order so prompt text is stable.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// Matches below this similarity are noise, not suggestions.
const MIN_SIMILARITY: f64 = 0.6;

#[derive(Debug, Clone, Serialize)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDescription {
    pub name: String,
    pub columns: Vec<ColumnDescription>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SchemaDescription {
    pub tables: Vec<TableDescription>,
}

/// A near-miss identifier resolved against the schema.
#[derive(Debug, Clone)]
pub struct ColumnSuggestion {
    pub table: String,
    pub column: String,
    pub score: f64,
}

impl SchemaDescription {
    pub fn introspect(db_path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut tables = Vec::new();
        for name in names {
            let escaped = name.replace('\'', "''");
            let mut pragma = conn.prepare(&format!("PRAGMA table_info('{}')", escaped))?;
            let columns: Vec<ColumnDescription> = pragma
                .query_map([], |row| {
                    Ok(ColumnDescription {
                        name: row.get(1)?,
                        data_type: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<_>>()?;
            tables.push(TableDescription { name, columns });
        }

        info!(
            "Introspected {} tables from {}",
            tables.len(),
            db_path.display()
        );
        Ok(Self { tables })
    }

    pub fn table(&self, name: &str) -> Option<&TableDescription> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// Compact schema listing for prompts and the `schema` CLI command.
    pub fn to_prompt_text(&self) -> String {
        let mut lines = Vec::new();
        for table in &self.tables {
            let columns = table
                .columns
                .iter()
                .map(|col| {
                    if col.data_type.is_empty() {
                        col.name.clone()
                    } else {
                        format!("{} {}", col.name, col.data_type)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ");
            let name = if table.name.contains(' ') {
                format!("\"{}\"", table.name)
            } else {
                table.name.clone()
            };
            lines.push(format!("- {} ({})", name, columns));
        }
        lines.join("\n")
    }

    pub fn closest_table(&self, name: &str) -> Option<(String, f64)> {
        let needle = name.to_lowercase();
        self.tables
            .iter()
            .map(|table| {
                let score = strsim::jaro_winkler(&needle, &table.name.to_lowercase());
                (table.name.clone(), score)
            })
            .filter(|(_, score)| *score >= MIN_SIMILARITY)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn closest_column(&self, name: &str) -> Option<ColumnSuggestion> {
        // Errors report columns as written, possibly alias qualified
        let bare = name.rsplit('.').next().unwrap_or(name).to_lowercase();
        let mut best: Option<ColumnSuggestion> = None;
        for table in &self.tables {
            for column in &table.columns {
                let score = strsim::jaro_winkler(&bare, &column.name.to_lowercase());
                if score < MIN_SIMILARITY {
                    continue;
                }
                let better = match &best {
                    Some(current) => score > current.score,
                    None => true,
                };
                if better {
                    best = Some(ColumnSuggestion {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        score,
                    });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_db() -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("schema_{}.sqlite", uuid::Uuid::new_v4()));
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE Products (ProductID INTEGER PRIMARY KEY, ProductName TEXT, CategoryID INTEGER);
            CREATE TABLE "Order Details" (OrderID INTEGER, ProductID INTEGER, UnitPrice REAL, Quantity INTEGER, Discount REAL);
            "#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_introspection_lists_tables_and_columns() -> std::result::Result<(), Box<dyn std::error::Error>> {
        println!("📊 Testing schema introspection...");
        let path = scratch_db();
        let schema = SchemaDescription::introspect(&path)?;

        assert_eq!(schema.tables.len(), 2);
        assert!(schema.has_table("Products"));
        assert!(schema.has_table("Order Details"));
        let products = schema.table("products").ok_or("missing table")?;
        assert_eq!(products.columns.len(), 3);

        let text = schema.to_prompt_text();
        assert!(text.contains("\"Order Details\""));
        assert!(text.contains("ProductName TEXT"));

        std::fs::remove_file(&path)?;
        println!("✅ Introspected schema:\n{}", text);
        Ok(())
    }

    #[test]
    fn test_fuzzy_suggestions() -> std::result::Result<(), Box<dyn std::error::Error>> {
        println!("🔍 Testing fuzzy schema suggestions...");
        let path = scratch_db();
        let schema = SchemaDescription::introspect(&path)?;

        let suggestion = schema.closest_column("ProductNam").ok_or("no suggestion")?;
        assert_eq!(suggestion.column, "ProductName");
        assert_eq!(suggestion.table, "Products");

        let qualified = schema.closest_column("od.Quantiy").ok_or("no suggestion")?;
        assert_eq!(qualified.column, "Quantity");

        let (table, _) = schema.closest_table("order detail").ok_or("no table match")?;
        assert_eq!(table, "Order Details");

        assert!(schema.closest_column("xyzzy_nonsense").is_none());

        std::fs::remove_file(&path)?;
        println!("✅ Suggestions resolved");
        Ok(())
    }
}
