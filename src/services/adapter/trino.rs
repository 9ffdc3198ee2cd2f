//! Trino adapter over the `/v1/statement` HTTP protocol.
//!
//! A statement is POSTed once, then the result pages are followed via
//! `nextUri` until the server stops issuing one.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};

use super::{DatabaseAdapter, finalize_result};
use crate::models::{
    ColumnMeta, ColumnSchema, ConnectionInfo, Dialect, QueryOptions, QueryResult, SchemaDescriptor,
    TableSchema,
};
use crate::utils::{EngineError, EngineResult};

#[derive(Debug)]
pub struct TrinoAdapter {
    http_client: Client,
    base_url: String,
    user: String,
    catalog: String,
    schema: String,
    connected: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    columns: Option<Vec<StatementColumn>>,
    #[serde(default)]
    data: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    next_uri: Option<String>,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementColumn {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    message: String,
    #[serde(default, rename = "errorType")]
    error_type: String,
}

impl TrinoAdapter {
    pub fn from_connection_info(info: &ConnectionInfo) -> EngineResult<Self> {
        let base_url = if let Some(url) = &info.url {
            url.trim_end_matches('/').to_string()
        } else {
            let host = info.host.clone().ok_or_else(|| {
                EngineError::validation("trino datasource requires 'host' or 'url'")
            })?;
            format!("http://{}:{}", host, info.port.unwrap_or(8080))
        };

        let catalog = info
            .extra
            .get("catalog")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| info.database.clone())
            .ok_or_else(|| EngineError::validation("trino datasource requires 'catalog'"))?;
        let schema = info
            .extra
            .get("schema")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        let http_client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::internal(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            user: info.username.clone().unwrap_or_else(|| "chatbi".to_string()),
            catalog,
            schema,
            connected: false,
        })
    }

    async fn run_statement(&self, sql: &str, deadline: Instant) -> EngineResult<QueryResult> {
        let url = format!("{}/v1/statement", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("X-Trino-User", &self.user)
            .header("X-Trino-Catalog", &self.catalog)
            .header("X-Trino-Schema", &self.schema)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| EngineError::db_transient(format!("trino request failed: {}", e)))?;

        let mut page: StatementResponse = response
            .json()
            .await
            .map_err(|e| EngineError::db_transient(format!("trino response not JSON: {}", e)))?;

        let mut columns: Vec<ColumnMeta> = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();

        loop {
            if let Some(err) = page.error {
                return Err(classify_statement_error(err));
            }
            if columns.is_empty()
                && let Some(cols) = &page.columns
            {
                columns = cols
                    .iter()
                    .map(|c| ColumnMeta { name: c.name.clone(), data_type: c.data_type.clone() })
                    .collect();
            }
            if let Some(data) = page.data {
                rows.extend(data);
            }

            let Some(next_uri) = page.next_uri else {
                break;
            };
            if Instant::now() >= deadline {
                return Err(EngineError::timeout("trino query exceeded its deadline"));
            }

            page = self
                .http_client
                .get(&next_uri)
                .header("X-Trino-User", &self.user)
                .send()
                .await
                .map_err(|e| EngineError::db_transient(format!("trino page fetch failed: {}", e)))?
                .json()
                .await
                .map_err(|e| EngineError::db_transient(format!("trino page not JSON: {}", e)))?;
        }

        let row_count = rows.len() as u64;
        Ok(QueryResult { columns, rows, duration_ms: 0, row_count, truncated: false })
    }
}

#[async_trait]
impl DatabaseAdapter for TrinoAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Trino
    }

    async fn connect(&mut self) -> EngineResult<()> {
        if self.connected {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        self.run_statement("SELECT 1", deadline).await.map_err(|e| match e {
            EngineError::Sql { message } => EngineError::db_permanent(message),
            other => other,
        })?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> EngineResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn ping(&mut self) -> EngineResult<()> {
        let deadline = Instant::now() + Duration::from_secs(10);
        self.run_statement("SELECT 1", deadline).await.map(|_| ())
    }

    async fn execute(&mut self, sql: &str, options: &QueryOptions) -> EngineResult<QueryResult> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(options.timeout_ms);
        let result = self.run_statement(sql, deadline).await?;
        Ok(finalize_result(result, options, started))
    }

    async fn introspect(&mut self) -> EngineResult<SchemaDescriptor> {
        let deadline = Instant::now() + Duration::from_secs(30);
        let sql = format!(
            "SELECT table_name, column_name, data_type, is_nullable \
             FROM {}.information_schema.columns WHERE table_schema = '{}' \
             ORDER BY table_name, ordinal_position",
            self.catalog,
            self.schema.replace('\'', "''")
        );
        let result = self.run_statement(&sql, deadline).await?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for row in result.rows {
            let table = row.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let name = row.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
            let data_type = row.get(2).and_then(Value::as_str).unwrap_or_default().to_string();
            let nullable = row.get(3).and_then(Value::as_str).unwrap_or("YES");
            if table.is_empty() || name.is_empty() {
                continue;
            }

            let column = ColumnSchema {
                name,
                data_type,
                nullable: nullable.eq_ignore_ascii_case("yes"),
                // Federated catalogs do not expose key constraints here.
                primary_key: false,
                foreign_key: None,
            };

            match tables.last_mut() {
                Some(last) if last.name == table => last.columns.push(column),
                _ => tables.push(TableSchema { name: table, columns: vec![column], row_count: None }),
            }
        }

        Ok(SchemaDescriptor { tables, dialect: Dialect::Trino })
    }
}

fn classify_statement_error(err: StatementError) -> EngineError {
    match err.error_type.as_str() {
        "USER_ERROR" => EngineError::sql(err.message),
        "INSUFFICIENT_RESOURCES" | "EXTERNAL" => EngineError::db_transient(err.message),
        _ => EngineError::sql(err.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_pages_deserialize() {
        let payload = r#"{
            "id": "20260801_0001",
            "columns": [{"name": "n", "type": "integer"}],
            "data": [[1], [2]],
            "nextUri": "http://localhost:8080/v1/statement/next"
        }"#;
        let page: StatementResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(page.columns.unwrap()[0].name, "n");
        assert_eq!(page.data.unwrap().len(), 2);
        assert!(page.next_uri.is_some());
    }

    #[test]
    fn user_errors_map_to_sql_kind() {
        let err = classify_statement_error(StatementError {
            message: "Column 'ordered_on' cannot be resolved".to_string(),
            error_type: "USER_ERROR".to_string(),
        });
        assert_eq!(err.kind(), "SQL_ERROR");
    }
}
