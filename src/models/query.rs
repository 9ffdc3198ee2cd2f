//! Query execution shapes shared by adapters, pipeline, and history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
}

/// Per-statement execution limits.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub timeout_ms: u64,
    pub max_rows: u64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { timeout_ms: 30_000, max_rows: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    pub duration_ms: u64,
    pub row_count: u64,
    pub truncated: bool,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self { columns: Vec::new(), rows: Vec::new(), duration_ms: 0, row_count: 0, truncated: false }
    }

    /// Enforce the client-side row ceiling; sets `truncated` when rows were
    /// dropped and keeps `row_count` equal to the rows actually returned.
    pub fn truncate_to(mut self, max_rows: u64) -> Self {
        if self.rows.len() as u64 > max_rows {
            self.rows.truncate(max_rows as usize);
            self.truncated = true;
        }
        self.row_count = self.rows.len() as u64;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Append-only history row for every statement the engine ran.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueryRecord {
    pub id: String,
    pub datasource_id: String,
    pub sql: String,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub row_count: i64,
    pub status: String,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_sets_flag_and_row_count() {
        let result = QueryResult {
            columns: vec![ColumnMeta { name: "n".to_string(), data_type: "int".to_string() }],
            rows: (0..5).map(|i| vec![Value::from(i)]).collect(),
            duration_ms: 1,
            row_count: 5,
            truncated: false,
        };

        let truncated = result.truncate_to(3);
        assert!(truncated.truncated);
        assert_eq!(truncated.row_count, 3);
        assert_eq!(truncated.rows.len(), 3);

        let untouched = QueryResult::empty().truncate_to(3);
        assert!(!untouched.truncated);
        assert_eq!(untouched.row_count, 0);
    }
}
