//! Datasource entities: the registered engines questions run against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use validator::Validate;

use crate::utils::{EngineError, EngineResult};

/// Supported engine families. Variants without a bundled driver are rejected
/// by the adapter registry at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasourceType {
    Postgres,
    Mysql,
    Mssql,
    Clickhouse,
    Duckdb,
    Sqlite,
    Snowflake,
    Bigquery,
    Trino,
}

impl DatasourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
            Self::Clickhouse => "clickhouse",
            Self::Duckdb => "duckdb",
            Self::Sqlite => "sqlite",
            Self::Snowflake => "snowflake",
            Self::Bigquery => "bigquery",
            Self::Trino => "trino",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "mssql" => Ok(Self::Mssql),
            "clickhouse" => Ok(Self::Clickhouse),
            "duckdb" => Ok(Self::Duckdb),
            "sqlite" => Ok(Self::Sqlite),
            "snowflake" => Ok(Self::Snowflake),
            "bigquery" => Ok(Self::Bigquery),
            "trino" => Ok(Self::Trino),
            other => Err(EngineError::validation(format!("unknown datasource type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasourceStatus {
    Active,
    Inactive,
    Error,
}

impl DatasourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            _ => Self::Error,
        }
    }
}

/// Engine connection parameters. Kept permissive: the well-known fields
/// cover the bundled drivers, anything else lands in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// File path for embedded engines (sqlite).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Full connection URL; takes precedence over host/port when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Datasource {
    pub id: String,
    pub name: String,
    pub ds_type: DatasourceType,
    #[serde(skip_serializing)]
    pub connection: ConnectionInfo,
    pub status: DatasourceStatus,
    pub is_default: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw row shape; `connection_json` is parsed on the way out.
#[derive(Debug, Clone, FromRow)]
pub struct DatasourceRow {
    pub id: String,
    pub name: String,
    pub ds_type: String,
    pub connection_json: String,
    pub status: String,
    pub is_default: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatasourceRow {
    pub fn into_datasource(self) -> EngineResult<Datasource> {
        let connection: ConnectionInfo = serde_json::from_str(&self.connection_json)?;
        Ok(Datasource {
            id: self.id,
            name: self.name,
            ds_type: DatasourceType::parse(&self.ds_type)?,
            connection,
            status: DatasourceStatus::parse(&self.status),
            is_default: self.is_default,
            last_used_at: self.last_used_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateDatasourceRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub ds_type: DatasourceType,
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateDatasourceRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    pub connection: Option<ConnectionInfo>,
    pub status: Option<DatasourceStatus>,
    pub is_default: Option<bool>,
}

/// Connectivity probe reply.
#[derive(Debug, Clone, Serialize)]
pub struct TestConnectionResponse {
    pub success: bool,
    pub message: String,
    pub latency_ms: Option<i64>,
}
