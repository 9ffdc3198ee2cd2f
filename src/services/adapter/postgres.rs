//! Postgres adapter over a single `sqlx::PgConnection`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::{DatabaseAdapter, finalize_result};
use crate::models::{
    ColumnMeta, ColumnSchema, ConnectionInfo, Dialect, ForeignKeyRef, QueryOptions, QueryResult,
    SchemaDescriptor, TableSchema,
};
use crate::utils::{EngineError, EngineResult};

#[derive(Debug)]
pub struct PostgresAdapter {
    options: PgConnectOptions,
    conn: Option<PgConnection>,
}

impl PostgresAdapter {
    pub fn from_connection_info(info: &ConnectionInfo) -> EngineResult<Self> {
        let options = if let Some(url) = &info.url {
            PgConnectOptions::from_str(url)
                .map_err(|e| EngineError::validation(format!("invalid postgres url: {}", e)))?
        } else {
            let host = info
                .host
                .clone()
                .ok_or_else(|| EngineError::validation("postgres datasource requires 'host'"))?;
            let mut options = PgConnectOptions::new().host(&host).port(info.port.unwrap_or(5432));
            if let Some(user) = &info.username {
                options = options.username(user);
            }
            if let Some(pass) = &info.password {
                options = options.password(pass);
            }
            if let Some(db) = &info.database {
                options = options.database(db);
            }
            options
        };

        Ok(Self { options, conn: None })
    }

    fn conn_mut(&mut self) -> EngineResult<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::internal("postgres adapter used before connect"))
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn connect(&mut self) -> EngineResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = self.options.connect().await.map_err(classify_connect_error)?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> EngineResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(|e| {
                EngineError::db_transient(format!("postgres disconnect failed: {}", e))
            })?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> EngineResult<()> {
        let conn = self.conn_mut()?;
        conn.ping()
            .await
            .map_err(|e| EngineError::db_transient(format!("postgres ping failed: {}", e)))
    }

    async fn execute(&mut self, sql: &str, options: &QueryOptions) -> EngineResult<QueryResult> {
        let timeout = Duration::from_millis(options.timeout_ms);
        let started = Instant::now();
        let conn = self.conn_mut()?;

        let fut = async {
            let rows: Vec<PgRow> =
                sqlx::query(sql).fetch_all(&mut *conn).await.map_err(classify_query_error)?;

            let columns = if let Some(first) = rows.first() {
                first
                    .columns()
                    .iter()
                    .map(|c| ColumnMeta {
                        name: c.name().to_string(),
                        data_type: c.type_info().name().to_string(),
                    })
                    .collect()
            } else {
                // Empty result: recover column metadata from a prepare pass.
                match conn.describe(sql).await {
                    Ok(described) => described
                        .columns()
                        .iter()
                        .map(|c| ColumnMeta {
                            name: c.name().to_string(),
                            data_type: c.type_info().name().to_string(),
                        })
                        .collect(),
                    Err(_) => Vec::new(),
                }
            };

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
            .map_err(|_| EngineError::timeout(format!("postgres query exceeded {:?}", timeout)))??;

        Ok(finalize_result(result, options, started))
    }

    async fn introspect(&mut self) -> EngineResult<SchemaDescriptor> {
        let conn = self.conn_mut()?;

        let columns: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"SELECT table_name::text, column_name::text, data_type::text, is_nullable::text
               FROM information_schema.columns
               WHERE table_schema = 'public'
               ORDER BY table_name, ordinal_position"#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_query_error)?;

        let pks: Vec<(String, String)> = sqlx::query_as(
            r#"SELECT tc.table_name::text, kcu.column_name::text
               FROM information_schema.table_constraints tc
               JOIN information_schema.key_column_usage kcu
                 ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
               WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = 'public'"#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_query_error)?;

        let fks: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"SELECT kcu.table_name::text, kcu.column_name::text,
                      ccu.table_name::text, ccu.column_name::text
               FROM information_schema.table_constraints tc
               JOIN information_schema.key_column_usage kcu
                 ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
               JOIN information_schema.constraint_column_usage ccu
                 ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.table_schema
               WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public'"#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_query_error)?;

        let row_counts: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT relname::text, GREATEST(reltuples, 0)::bigint
               FROM pg_class
               WHERE relkind = 'r' AND relnamespace = 'public'::regnamespace"#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_query_error)?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for (table, column, data_type, is_nullable) in columns {
            let foreign_key = fks
                .iter()
                .find(|(t, c, _, _)| *t == table && *c == column)
                .map(|(_, _, ref_table, ref_column)| ForeignKeyRef {
                    table: ref_table.clone(),
                    column: ref_column.clone(),
                });

            let column_schema = ColumnSchema {
                primary_key: pks.iter().any(|(t, c)| *t == table && *c == column),
                name: column,
                data_type,
                nullable: is_nullable.eq_ignore_ascii_case("yes"),
                foreign_key,
            };

            match tables.last_mut() {
                Some(last) if last.name == table => last.columns.push(column_schema),
                _ => tables.push(TableSchema {
                    row_count: row_counts
                        .iter()
                        .find(|(t, _)| *t == table)
                        .map(|(_, n)| *n as u64),
                    name: table,
                    columns: vec![column_schema],
                }),
            }
        }

        Ok(SchemaDescriptor { tables, dialect: Dialect::Postgres })
    }
}

fn classify_connect_error(e: sqlx::Error) -> EngineError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => {
            EngineError::db_transient(format!("postgres connect failed: {}", e))
        },
        sqlx::Error::Configuration(_) | sqlx::Error::Database(_) => {
            EngineError::db_permanent(format!("postgres connect rejected: {}", e))
        },
        _ => EngineError::db_transient(format!("postgres connect failed: {}", e)),
    }
}

fn classify_query_error(e: sqlx::Error) -> EngineError {
    match &e {
        sqlx::Error::Database(db) => EngineError::sql(db.message().to_string()),
        sqlx::Error::Io(_) => EngineError::db_transient(format!("postgres io error: {}", e)),
        _ => EngineError::db_transient(format!("postgres driver error: {}", e)),
    }
}

/// Decode one cell to JSON by declared type; unknown types fall back to
/// text and finally null.
fn decode_cell(row: &PgRow, i: usize) -> Value {
    let Ok(raw) = row.try_get_raw(i) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    let type_name = raw.type_info().name().to_string();

    match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(i).map(Value::from).unwrap_or(Value::Null),
        "INT2" => row.try_get::<i16, _>(i).map(|v| Value::from(v as i64)).unwrap_or(Value::Null),
        "INT4" => row.try_get::<i32, _>(i).map(|v| Value::from(v as i64)).unwrap_or(Value::Null),
        "INT8" => row.try_get::<i64, _>(i).map(Value::from).unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<f32, _>(i)
            .ok()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<f64, _>(i)
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<sqlx::types::BigDecimal, _>(i)
            .map(|v| {
                let text = v.to_string();
                text.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::String(text))
            })
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<sqlx::types::Uuid, _>(i)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(i)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(i)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(i)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row.try_get::<Value, _>(i).unwrap_or(Value::Null),
        _ => row.try_get::<String, _>(i).map(Value::String).unwrap_or(Value::Null),
    }
}
