//! SQLite adapter over a single `sqlx::SqliteConnection`. Covers local
//! file datasources and in-memory fixtures.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::{DatabaseAdapter, finalize_result};
use crate::models::{
    ColumnMeta, ColumnSchema, ConnectionInfo, Dialect, ForeignKeyRef, QueryOptions, QueryResult,
    SchemaDescriptor, TableSchema,
};
use crate::utils::{EngineError, EngineResult};

#[derive(Debug)]
pub struct SqliteAdapter {
    options: SqliteConnectOptions,
    conn: Option<SqliteConnection>,
}

impl SqliteAdapter {
    pub fn from_connection_info(info: &ConnectionInfo) -> EngineResult<Self> {
        let options = if let Some(url) = &info.url {
            SqliteConnectOptions::from_str(url)
                .map_err(|e| EngineError::validation(format!("invalid sqlite url: {}", e)))?
        } else if let Some(path) = &info.path {
            SqliteConnectOptions::new().filename(path)
        } else {
            return Err(EngineError::validation("sqlite datasource requires 'path' or 'url'"));
        };

        Ok(Self { options, conn: None })
    }

    fn conn_mut(&mut self) -> EngineResult<&mut SqliteConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::internal("sqlite adapter used before connect"))
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(&mut self) -> EngineResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = self.options.connect().await.map_err(|e| {
            EngineError::db_permanent(format!("sqlite connect failed: {}", e))
        })?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> EngineResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(|e| {
                EngineError::db_transient(format!("sqlite disconnect failed: {}", e))
            })?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> EngineResult<()> {
        let conn = self.conn_mut()?;
        conn.ping()
            .await
            .map_err(|e| EngineError::db_transient(format!("sqlite ping failed: {}", e)))
    }

    async fn execute(&mut self, sql: &str, options: &QueryOptions) -> EngineResult<QueryResult> {
        let timeout = Duration::from_millis(options.timeout_ms);
        let started = Instant::now();
        let conn = self.conn_mut()?;

        let fut = async {
            let rows: Vec<SqliteRow> =
                sqlx::query(sql).fetch_all(&mut *conn).await.map_err(classify_query_error)?;

            let columns = rows
                .first()
                .map(|row| {
                    row.columns()
                        .iter()
                        .map(|c| ColumnMeta {
                            name: c.name().to_string(),
                            data_type: c.type_info().name().to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let data = rows
                .iter()
                .map(|row| (0..row.columns().len()).map(|i| decode_cell(row, i)).collect())
                .collect::<Vec<Vec<Value>>>();

            let row_count = data.len() as u64;
            Ok::<QueryResult, EngineError>(QueryResult {
                columns,
                rows: data,
                duration_ms: 0,
                row_count,
                truncated: false,
            })
        };

        let result = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| EngineError::timeout(format!("sqlite query exceeded {:?}", timeout)))??;

        Ok(finalize_result(result, options, started))
    }

    async fn introspect(&mut self) -> EngineResult<SchemaDescriptor> {
        let conn = self.conn_mut()?;

        let table_names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_query_error)?;

        let mut tables = Vec::with_capacity(table_names.len());
        for (table,) in table_names {
            let quoted = table.replace('"', "\"\"");

            let info: Vec<(i64, String, String, i64, Option<String>, i64)> = sqlx::query_as(
                &format!(
                    "SELECT cid, name, type, \"notnull\", CAST(dflt_value AS TEXT), pk \
                     FROM pragma_table_info(\"{}\")",
                    quoted
                ),
            )
            .fetch_all(&mut *conn)
            .await
            .map_err(classify_query_error)?;

            let fk_list: Vec<(i64, i64, String, String, Option<String>)> = sqlx::query_as(
                &format!(
                    "SELECT id, seq, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(\"{}\")",
                    quoted
                ),
            )
            .fetch_all(&mut *conn)
            .await
            .unwrap_or_default();

            let (row_count,): (i64,) =
                sqlx::query_as(&format!("SELECT COUNT(*) FROM \"{}\"", quoted))
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(classify_query_error)?;

            let columns = info
                .into_iter()
                .map(|(_cid, name, data_type, notnull, _default, pk)| {
                    let foreign_key = fk_list
                        .iter()
                        .find(|(_, _, _, from, _)| *from == name)
                        .map(|(_, _, ref_table, _, ref_column)| ForeignKeyRef {
                            table: ref_table.clone(),
                            column: ref_column.clone().unwrap_or_else(|| "id".to_string()),
                        });
                    ColumnSchema {
                        name,
                        data_type,
                        nullable: notnull == 0,
                        primary_key: pk > 0,
                        foreign_key,
                    }
                })
                .collect();

            tables.push(TableSchema { name: table, columns, row_count: Some(row_count as u64) });
        }

        Ok(SchemaDescriptor { tables, dialect: Dialect::Sqlite })
    }
}

fn classify_query_error(e: sqlx::Error) -> EngineError {
    match &e {
        sqlx::Error::Database(db) => EngineError::sql(db.message().to_string()),
        sqlx::Error::Io(_) => EngineError::db_transient(format!("sqlite io error: {}", e)),
        _ => EngineError::db_transient(format!("sqlite driver error: {}", e)),
    }
}

fn decode_cell(row: &SqliteRow, i: usize) -> Value {
    let Ok(raw) = row.try_get_raw(i) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    let type_name = raw.type_info().name().to_string();

    match type_name.as_str() {
        "INTEGER" => row.try_get::<i64, _>(i).map(Value::from).unwrap_or(Value::Null),
        "REAL" | "NUMERIC" => row
            .try_get::<f64, _>(i)
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "BOOLEAN" => row.try_get::<bool, _>(i).map(Value::from).unwrap_or(Value::Null),
        "BLOB" => Value::Null,
        _ => row.try_get::<String, _>(i).map(Value::String).unwrap_or(Value::Null),
    }
}
