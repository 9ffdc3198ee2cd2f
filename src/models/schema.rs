//! Introspected schema shapes shared by adapters and agents.

use serde::{Deserialize, Serialize};

/// SQL dialect an adapter speaks; drives validation and prompt rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    Mysql,
    Sqlite,
    Clickhouse,
    Trino,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
            Self::Clickhouse => "clickhouse",
            Self::Trino => "trino",
        }
    }

    /// Whether `LIMIT n` is the row-cap syntax (all bundled dialects).
    pub fn supports_limit(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: Vec<TableSchema>,
    pub dialect: Dialect,
}

impl SchemaDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Compact single-line rendering used inside prompts.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&table.name);
            out.push('(');
            for (i, col) in table.columns.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&col.name);
                out.push(' ');
                out.push_str(&col.data_type);
                if col.primary_key {
                    out.push_str(" pk");
                }
                if let Some(fk) = &col.foreign_key {
                    out.push_str(&format!(" -> {}.{}", fk.table, fk.column));
                }
            }
            out.push_str(")\n");
        }
        out
    }
}
