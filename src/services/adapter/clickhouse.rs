//! ClickHouse adapter over the HTTP interface (`?default_format=JSON`).

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
pub struct ClickHouseAdapter {
    http_client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    database: String,
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct JsonResponse {
    #[serde(default)]
    meta: Vec<JsonMeta>,
    #[serde(default)]
    data: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct JsonMeta {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
}

impl ClickHouseAdapter {
    pub fn from_connection_info(info: &ConnectionInfo) -> EngineResult<Self> {
        let base_url = if let Some(url) = &info.url {
            url.trim_end_matches('/').to_string()
        } else {
            let host = info.host.clone().ok_or_else(|| {
                EngineError::validation("clickhouse datasource requires 'host' or 'url'")
            })?;
            format!("http://{}:{}", host, info.port.unwrap_or(8123))
        };

        let http_client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::internal(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            username: info.username.clone(),
            password: info.password.clone(),
            database: info.database.clone().unwrap_or_else(|| "default".to_string()),
            connected: false,
        })
    }

    async fn post_sql(&self, sql: &str, timeout: Duration) -> EngineResult<JsonResponse> {
        let url = format!("{}/?default_format=JSON&database={}", self.base_url, self.database);

        let mut request = self
            .http_client
            .post(&url)
            .timeout(timeout)
            .body(sql.to_string());
        if let Some(user) = &self.username {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(pass) = &self.password {
            request = request.header("X-ClickHouse-Key", pass);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::timeout(format!("clickhouse query exceeded {:?}", timeout))
            } else {
                EngineError::db_transient(format!("clickhouse request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            // ClickHouse reports statement errors as 4xx with the parser
            // message in the body; 5xx is the server itself.
            return if status.is_client_error() {
                Err(EngineError::sql(body))
            } else {
                Err(EngineError::db_transient(format!("clickhouse error {}: {}", status, body)))
            };
        }

        let text = response
            .text()
            .await
            .map_err(|e| EngineError::db_transient(format!("clickhouse body read failed: {}", e)))?;
        if text.trim().is_empty() {
            // DDL and other row-less statements return an empty body.
            return Ok(JsonResponse { meta: Vec::new(), data: Vec::new() });
        }
        serde_json::from_str(&text).map_err(|e| {
            EngineError::db_transient(format!("clickhouse response not JSON: {}", e))
        })
    }
}

#[async_trait]
impl DatabaseAdapter for ClickHouseAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Clickhouse
    }

    async fn connect(&mut self) -> EngineResult<()> {
        if self.connected {
            return Ok(());
        }
        self.post_sql("SELECT 1", Duration::from_secs(10)).await.map_err(|e| match e {
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
        self.post_sql("SELECT 1", Duration::from_secs(10)).await.map(|_| ())
    }

    async fn execute(&mut self, sql: &str, options: &QueryOptions) -> EngineResult<QueryResult> {
        let started = Instant::now();
        let response = self
            .post_sql(sql, Duration::from_millis(options.timeout_ms))
            .await?;

        let columns: Vec<ColumnMeta> = response
            .meta
            .iter()
            .map(|m| ColumnMeta { name: m.name.clone(), data_type: m.data_type.clone() })
            .collect();

        let rows: Vec<Vec<Value>> = response
            .data
            .into_iter()
            .map(|mut obj| {
                columns
                    .iter()
                    .map(|c| obj.remove(&c.name).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        let row_count = rows.len() as u64;
        let result = QueryResult { columns, rows, duration_ms: 0, row_count, truncated: false };
        Ok(finalize_result(result, options, started))
    }

    async fn introspect(&mut self) -> EngineResult<SchemaDescriptor> {
        let sql = format!(
            "SELECT table, name, type, position \
             FROM system.columns WHERE database = '{}' ORDER BY table, position",
            self.database.replace('\'', "\\'")
        );
        let response = self.post_sql(&sql, Duration::from_secs(30)).await?;

        let counts_sql = format!(
            "SELECT name, total_rows FROM system.tables WHERE database = '{}'",
            self.database.replace('\'', "\\'")
        );
        let counts = self.post_sql(&counts_sql, Duration::from_secs(30)).await?;
        let row_count_of = |table: &str| -> Option<u64> {
            counts
                .data
                .iter()
                .find(|obj| obj.get("name").and_then(Value::as_str) == Some(table))
                .and_then(|obj| obj.get("total_rows"))
                .and_then(value_as_u64)
        };

        let mut tables: Vec<TableSchema> = Vec::new();
        for obj in response.data {
            let table = obj.get("table").and_then(Value::as_str).unwrap_or_default().to_string();
            let name = obj.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let data_type =
                obj.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
            if table.is_empty() || name.is_empty() {
                continue;
            }

            let column = ColumnSchema {
                name,
                nullable: data_type.starts_with("Nullable("),
                data_type,
                // ClickHouse has no declared key constraints to surface.
                primary_key: false,
                foreign_key: None,
            };

            match tables.last_mut() {
                Some(last) if last.name == table => last.columns.push(column),
                _ => tables.push(TableSchema {
                    row_count: row_count_of(&table),
                    name: table,
                    columns: vec![column],
                }),
            }
        }

        Ok(SchemaDescriptor { tables, dialect: Dialect::Clickhouse })
    }
}

/// `total_rows` arrives as a JSON number or a stringified UInt64.
fn value_as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_meta_orders_row_cells() {
        let payload = r#"{
            "meta": [{"name": "product", "type": "String"}, {"name": "revenue", "type": "Float64"}],
            "data": [{"revenue": 12.5, "product": "widget"}],
            "rows": 1
        }"#;
        let response: JsonResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(response.meta.len(), 2);
        assert_eq!(response.data[0].get("product").unwrap(), "widget");
    }

    #[test]
    fn stringified_counts_parse() {
        assert_eq!(value_as_u64(&Value::String("42".to_string())), Some(42));
        assert_eq!(value_as_u64(&Value::from(7)), Some(7));
        assert_eq!(value_as_u64(&Value::Null), None);
    }
}
