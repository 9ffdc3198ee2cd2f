// Database adapter module
// Purpose: uniform query/schema capability across engine families
// Design: trait objects behind a table-driven factory registry

mod clickhouse;
mod mysql;
mod postgres;
mod sqlite;
mod trino;

#[cfg(test)]
pub mod mock;

pub use clickhouse::ClickHouseAdapter;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;
pub use trino::TrinoAdapter;

use async_trait::async_trait;

use crate::models::{ConnectionInfo, Datasource, DatasourceType, Dialect, QueryOptions, QueryResult, SchemaDescriptor};
use crate::utils::{EngineError, EngineResult};

/// Uniform engine capability. One adapter instance is one live connection;
/// pooling happens a layer above.
#[async_trait]
pub trait DatabaseAdapter: Send + std::fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Open the underlying connection. Idempotent once connected.
    async fn connect(&mut self) -> EngineResult<()>;

    async fn disconnect(&mut self) -> EngineResult<()>;

    /// Cheap liveness probe (`SELECT 1` equivalent).
    async fn ping(&mut self) -> EngineResult<()>;

    /// Run one statement under the given limits. Returns columns even for
    /// empty result sets where the driver allows it; `truncated` is set
    /// when the client-side row ceiling dropped rows.
    async fn execute(&mut self, sql: &str, options: &QueryOptions) -> EngineResult<QueryResult>;

    async fn introspect(&mut self) -> EngineResult<SchemaDescriptor>;
}

type AdapterFactory = fn(&ConnectionInfo) -> EngineResult<Box<dyn DatabaseAdapter>>;

/// Engine registry: type -> factory. Declared types without a bundled
/// driver are absent here and rejected with a clear validation error.
static REGISTRY: &[(DatasourceType, AdapterFactory)] = &[
    (DatasourceType::Mysql, |info| Ok(Box::new(MySqlAdapter::from_connection_info(info)?))),
    (DatasourceType::Postgres, |info| Ok(Box::new(PostgresAdapter::from_connection_info(info)?))),
    (DatasourceType::Sqlite, |info| Ok(Box::new(SqliteAdapter::from_connection_info(info)?))),
    (DatasourceType::Clickhouse, |info| {
        Ok(Box::new(ClickHouseAdapter::from_connection_info(info)?))
    }),
    (DatasourceType::Trino, |info| Ok(Box::new(TrinoAdapter::from_connection_info(info)?))),
];

/// Create an (unconnected) adapter for a datasource.
pub fn create_adapter(
    ds_type: DatasourceType,
    info: &ConnectionInfo,
) -> EngineResult<Box<dyn DatabaseAdapter>> {
    match REGISTRY.iter().find(|(t, _)| *t == ds_type) {
        Some((_, factory)) => factory(info),
        None => Err(EngineError::validation(format!(
            "no driver bundled for engine '{}'",
            ds_type.as_str()
        ))),
    }
}

pub fn create_adapter_for(datasource: &Datasource) -> EngineResult<Box<dyn DatabaseAdapter>> {
    create_adapter(datasource.ds_type, &datasource.connection)
}

pub fn supported_types() -> Vec<DatasourceType> {
    REGISTRY.iter().map(|(t, _)| *t).collect()
}

/// Shared helper: clamp a statement's effect with client-side truncation
/// and stamp the duration.
pub(crate) fn finalize_result(
    mut result: QueryResult,
    options: &QueryOptions,
    started: std::time::Instant,
) -> QueryResult {
    result = result.truncate_to(options.max_rows);
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}
