//! MySQL adapter over `mysql_async`. One adapter instance owns one raw
//! connection; the engine's own pool layer does the pooling.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, SslOpts};
use serde_json::Value;
use std::time::{Duration, Instant};

use super::{DatabaseAdapter, finalize_result};
use crate::models::{
    ColumnMeta, ColumnSchema, ConnectionInfo, Dialect, ForeignKeyRef, QueryOptions, QueryResult,
    SchemaDescriptor, TableSchema,
};
use crate::utils::{EngineError, EngineResult};

#[derive(Debug)]
pub struct MySqlAdapter {
    opts: Opts,
    database: Option<String>,
    conn: Option<Conn>,
}

impl MySqlAdapter {
    pub fn from_connection_info(info: &ConnectionInfo) -> EngineResult<Self> {
        let host = info
            .host
            .clone()
            .ok_or_else(|| EngineError::validation("mysql datasource requires 'host'"))?;

        let builder = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(info.port.unwrap_or(3306))
            .user(info.username.clone())
            .pass(info.password.clone())
            .db_name(info.database.clone())
            .prefer_socket(false)
            .ssl_opts(None::<SslOpts>)
            .tcp_keepalive(Some(30_000_u32))
            .tcp_nodelay(true);

        Ok(Self { opts: Opts::from(builder), database: info.database.clone(), conn: None })
    }

    fn conn_mut(&mut self) -> EngineResult<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::internal("mysql adapter used before connect"))
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn connect(&mut self) -> EngineResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = Conn::new(self.opts.clone()).await.map_err(classify_connect_error)?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> EngineResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await.map_err(|e| {
                EngineError::db_transient(format!("mysql disconnect failed: {}", e))
            })?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> EngineResult<()> {
        let conn = self.conn_mut()?;
        conn.ping()
            .await
            .map_err(|e| EngineError::db_transient(format!("mysql ping failed: {}", e)))
    }

    async fn execute(&mut self, sql: &str, options: &QueryOptions) -> EngineResult<QueryResult> {
        let timeout = Duration::from_millis(options.timeout_ms);
        let started = Instant::now();
        let conn = self.conn_mut()?;

        let fut = async {
            let mut result = conn.query_iter(sql).await.map_err(classify_query_error)?;
            let columns: Vec<ColumnMeta> = result
                .columns()
                .map(|cols| {
                    cols.iter()
                        .map(|c| ColumnMeta {
                            name: c.name_str().to_string(),
                            data_type: format!("{:?}", c.column_type()),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let raw: Vec<mysql_async::Row> =
                result.collect().await.map_err(classify_query_error)?;

            let rows = raw
                .iter()
                .map(|row| {
                    (0..row.len()).map(|i| cell_to_value(&row[i])).collect::<Vec<Value>>()
                })
                .collect::<Vec<_>>();

            let row_count = rows.len() as u64;
            Ok::<QueryResult, EngineError>(QueryResult {
                columns,
                rows,
                duration_ms: 0,
                row_count,
                truncated: false,
            })
        };

        let result = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| EngineError::timeout(format!("mysql query exceeded {:?}", timeout)))??;

        Ok(finalize_result(result, options, started))
    }

    async fn introspect(&mut self) -> EngineResult<SchemaDescriptor> {
        let database = self
            .database
            .clone()
            .ok_or_else(|| EngineError::validation("mysql introspection requires 'database'"))?;
        let conn = self.conn_mut()?;

        let columns: Vec<(String, String, String, String, String)> = conn
            .exec(
                r"SELECT table_name, column_name, data_type, is_nullable, column_key
                  FROM information_schema.columns
                  WHERE table_schema = ?
                  ORDER BY table_name, ordinal_position",
                (database.clone(),),
            )
            .await
            .map_err(classify_query_error)?;

        let fks: Vec<(String, String, String, String)> = conn
            .exec(
                r"SELECT table_name, column_name, referenced_table_name, referenced_column_name
                  FROM information_schema.key_column_usage
                  WHERE table_schema = ? AND referenced_table_name IS NOT NULL",
                (database.clone(),),
            )
            .await
            .map_err(classify_query_error)?;

        let row_counts: Vec<(String, Option<u64>)> = conn
            .exec(
                r"SELECT table_name, table_rows
                  FROM information_schema.tables
                  WHERE table_schema = ?",
                (database,),
            )
            .await
            .map_err(classify_query_error)?;

        let mut tables: Vec<TableSchema> = Vec::new();
        for (table, column, data_type, is_nullable, column_key) in columns {
            let foreign_key = fks
                .iter()
                .find(|(t, c, _, _)| *t == table && *c == column)
                .map(|(_, _, ref_table, ref_column)| ForeignKeyRef {
                    table: ref_table.clone(),
                    column: ref_column.clone(),
                });

            let column_schema = ColumnSchema {
                name: column,
                data_type,
                nullable: is_nullable.eq_ignore_ascii_case("yes"),
                primary_key: column_key == "PRI",
                foreign_key,
            };

            match tables.last_mut() {
                Some(last) if last.name == table => last.columns.push(column_schema),
                _ => tables.push(TableSchema {
                    row_count: row_counts
                        .iter()
                        .find(|(t, _)| *t == table)
                        .and_then(|(_, n)| *n),
                    name: table,
                    columns: vec![column_schema],
                }),
            }
        }

        Ok(SchemaDescriptor { tables, dialect: Dialect::Mysql })
    }
}

fn classify_connect_error(e: mysql_async::Error) -> EngineError {
    match &e {
        mysql_async::Error::Io(_) => {
            EngineError::db_transient(format!("mysql connect failed: {}", e))
        },
        mysql_async::Error::Server(_) => {
            EngineError::db_permanent(format!("mysql connect rejected: {}", e))
        },
        _ => EngineError::db_permanent(format!("mysql connect failed: {}", e)),
    }
}

/// Server-reported statement errors feed the correction loop; transport
/// errors stay retryable.
fn classify_query_error(e: mysql_async::Error) -> EngineError {
    match &e {
        mysql_async::Error::Server(server) => EngineError::sql(server.message.clone()),
        mysql_async::Error::Io(_) => EngineError::db_transient(format!("mysql io error: {}", e)),
        _ => EngineError::db_transient(format!("mysql driver error: {}", e)),
    }
}

fn cell_to_value(value: &mysql_async::Value) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::String(String::from_utf8_lossy(bytes).to_string()),
        },
        mysql_async::Value::Int(i) => Value::from(*i),
        mysql_async::Value::UInt(u) => Value::from(*u),
        mysql_async::Value::Float(f) => {
            serde_json::Number::from_f64(*f as f64).map(Value::Number).unwrap_or(Value::Null)
        },
        mysql_async::Value::Double(d) => {
            serde_json::Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null)
        },
        mysql_async::Value::Date(year, month, day, hour, minute, second, _micro) => {
            Value::String(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ))
        },
        mysql_async::Value::Time(negative, days, hours, minutes, seconds, _micro) => {
            let total_hours = days * 24 + (*hours as u32);
            let sign = if *negative { "-" } else { "" };
            Value::String(format!("{}{}:{:02}:{:02}", sign, total_hours, minutes, seconds))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_convert_to_json_values() {
        assert_eq!(cell_to_value(&mysql_async::Value::NULL), Value::Null);
        assert_eq!(cell_to_value(&mysql_async::Value::Int(42)), Value::from(42));
        assert_eq!(
            cell_to_value(&mysql_async::Value::Bytes(b"widget".to_vec())),
            Value::String("widget".to_string())
        );
        assert_eq!(
            cell_to_value(&mysql_async::Value::Date(2026, 1, 2, 3, 4, 5, 0)),
            Value::String("2026-01-02 03:04:05".to_string())
        );
        // Duration-style TIME values keep their sign.
        assert_eq!(
            cell_to_value(&mysql_async::Value::Time(true, 0, 10, 0, 0, 0)),
            Value::String("-10:00:00".to_string())
        );
        assert_eq!(
            cell_to_value(&mysql_async::Value::Time(false, 1, 2, 30, 15, 0)),
            Value::String("26:30:15".to_string())
        );
    }

    #[test]
    fn connection_info_requires_host() {
        let err = MySqlAdapter::from_connection_info(&ConnectionInfo::default()).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
    }
}
