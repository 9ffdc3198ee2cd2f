//! In-process fake engine used across the crate's tests. Behavior is
//! scripted per call so pipeline, pool, and monitoring paths can be
//! exercised without a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::DatabaseAdapter;
use crate::models::{
    ColumnMeta, ColumnSchema, Datasource, Dialect, QueryOptions, QueryResult, SchemaDescriptor,
    TableSchema,
};
use crate::utils::{EngineError, EngineResult};

#[derive(Debug)]
pub struct MockEngine {
    pub schema: Mutex<SchemaDescriptor>,
    script: Mutex<VecDeque<EngineResult<QueryResult>>>,
    ping_failures: AtomicUsize,
    connect_failures: AtomicUsize,
    pub connect_count: AtomicUsize,
    pub execute_count: AtomicUsize,
    pub introspect_count: AtomicUsize,
    execute_delay_ms: AtomicUsize,
    open_connections: AtomicUsize,
    pub max_open_connections: AtomicUsize,
    pub executed_sql: Mutex<Vec<String>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Self::with_schema(SchemaDescriptor { tables: Vec::new(), dialect: Dialect::Sqlite })
    }

    pub fn with_schema(schema: SchemaDescriptor) -> Arc<Self> {
        Arc::new(Self {
            schema: Mutex::new(schema),
            script: Mutex::new(VecDeque::new()),
            ping_failures: AtomicUsize::new(0),
            connect_failures: AtomicUsize::new(0),
            connect_count: AtomicUsize::new(0),
            execute_count: AtomicUsize::new(0),
            introspect_count: AtomicUsize::new(0),
            execute_delay_ms: AtomicUsize::new(0),
            open_connections: AtomicUsize::new(0),
            max_open_connections: AtomicUsize::new(0),
            executed_sql: Mutex::new(Vec::new()),
        })
    }

    /// Classic sales fixture used by the pipeline tests.
    pub fn sales_schema() -> SchemaDescriptor {
        SchemaDescriptor {
            dialect: Dialect::Postgres,
            tables: vec![
                TableSchema {
                    name: "orders".to_string(),
                    row_count: Some(1_000),
                    columns: vec![
                        column("product_id", "bigint"),
                        column("revenue", "numeric"),
                        column("ordered_at", "timestamp"),
                    ],
                },
                TableSchema {
                    name: "products".to_string(),
                    row_count: Some(50),
                    columns: vec![column("id", "bigint"), column("name", "text")],
                },
            ],
        }
    }

    pub fn push_result(&self, result: EngineResult<QueryResult>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn push_rows(&self, columns: &[&str], rows: Vec<Vec<serde_json::Value>>) {
        let row_count = rows.len() as u64;
        self.push_result(Ok(QueryResult {
            columns: columns
                .iter()
                .map(|n| ColumnMeta { name: n.to_string(), data_type: "text".to_string() })
                .collect(),
            rows,
            duration_ms: 1,
            row_count,
            truncated: false,
        }));
    }

    pub fn fail_next_pings(&self, n: usize) {
        self.ping_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.execute_delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Factory closure for `PoolManager::with_factory`.
    pub fn factory(
        self: &Arc<Self>,
    ) -> Arc<dyn Fn(&Datasource) -> EngineResult<Box<dyn DatabaseAdapter>> + Send + Sync> {
        let engine = Arc::clone(self);
        Arc::new(move |_ds| {
            Ok(Box::new(MockAdapter { engine: Arc::clone(&engine), connected: false })
                as Box<dyn DatabaseAdapter>)
        })
    }
}

fn column(name: &str, data_type: &str) -> ColumnSchema {
    ColumnSchema {
        name: name.to_string(),
        data_type: data_type.to_string(),
        nullable: true,
        primary_key: name == "id",
        foreign_key: None,
    }
}

#[derive(Debug)]
pub struct MockAdapter {
    engine: Arc<MockEngine>,
    connected: bool,
}

impl Drop for MockAdapter {
    fn drop(&mut self) {
        if self.connected {
            self.engine.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl DatabaseAdapter for MockAdapter {
    fn dialect(&self) -> Dialect {
        self.engine.schema.lock().unwrap().dialect
    }

    async fn connect(&mut self) -> EngineResult<()> {
        if self.connected {
            return Ok(());
        }
        self.engine.connect_count.fetch_add(1, Ordering::SeqCst);
        let failures = self.engine.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.engine.connect_failures.store(failures - 1, Ordering::SeqCst);
            return Err(EngineError::db_transient("mock connect refused"));
        }
        self.connected = true;
        let open = self.engine.open_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.engine.max_open_connections.fetch_max(open, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> EngineResult<()> {
        if self.connected {
            self.connected = false;
            self.engine.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn ping(&mut self) -> EngineResult<()> {
        let failures = self.engine.ping_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.engine.ping_failures.store(failures - 1, Ordering::SeqCst);
            return Err(EngineError::db_transient("mock ping failed"));
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str, options: &QueryOptions) -> EngineResult<QueryResult> {
        self.engine.execute_count.fetch_add(1, Ordering::SeqCst);
        self.engine.executed_sql.lock().unwrap().push(sql.to_string());

        let delay_ms = self.engine.execute_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
        }

        let scripted = self.engine.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result.map(|r| r.truncate_to(options.max_rows)),
            None => Ok(QueryResult::empty()),
        }
    }

    async fn introspect(&mut self) -> EngineResult<SchemaDescriptor> {
        self.engine.introspect_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine.schema.lock().unwrap().clone())
    }
}
