//! Datasource service: CRUD over registered engines, connection testing,
//! schema fetch, raw query execution, and the append-only query history.

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteArguments;
use sqlx::Arguments;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    ConnectionInfo, CreateDatasourceRequest, Datasource, DatasourceRow, DatasourceType,
    QueryOptions, QueryRecord, QueryResult, QueryStatus, SchemaDescriptor, TestConnectionResponse,
    UpdateDatasourceRequest,
};
use crate::services::adapter::create_adapter;
use crate::services::memo::MemoCache;
use crate::services::pool::PoolManager;
use crate::utils::{EngineError, EngineResult};

pub struct DatasourceService {
    db: SqlitePool,
    pool_manager: Arc<PoolManager>,
    memo: Arc<MemoCache>,
}

impl DatasourceService {
    pub fn new(db: SqlitePool, pool_manager: Arc<PoolManager>, memo: Arc<MemoCache>) -> Self {
        Self { db, pool_manager, memo }
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    pub async fn create(&self, req: CreateDatasourceRequest) -> EngineResult<Datasource> {
        req.validate()
            .map_err(|e| EngineError::validation(format!("invalid datasource: {}", e)))?;

        let id = Uuid::new_v4().to_string();
        let connection_json = serde_json::to_string(&req.connection)?;

        if req.is_default {
            sqlx::query("UPDATE datasources SET is_default = FALSE")
                .execute(&self.db)
                .await?;
        }

        sqlx::query(
            r#"INSERT INTO datasources (id, name, ds_type, connection_json, status, is_default)
               VALUES (?, ?, ?, ?, 'active', ?)"#,
        )
        .bind(&id)
        .bind(&req.name)
        .bind(req.ds_type.as_str())
        .bind(&connection_json)
        .bind(req.is_default)
        .execute(&self.db)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                EngineError::conflict(format!("datasource '{}' already exists", req.name))
            },
            _ => EngineError::from(e),
        })?;

        self.get(&id).await
    }

    pub async fn list(&self) -> EngineResult<Vec<Datasource>> {
        let rows = sqlx::query_as::<_, DatasourceRow>("SELECT * FROM datasources ORDER BY name")
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(DatasourceRow::into_datasource).collect()
    }

    pub async fn get(&self, id: &str) -> EngineResult<Datasource> {
        sqlx::query_as::<_, DatasourceRow>("SELECT * FROM datasources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("datasource '{}' not found", id)))?
            .into_datasource()
    }

    /// Explicit id, or the default datasource when absent.
    pub async fn resolve(&self, id: Option<&str>) -> EngineResult<Datasource> {
        match id {
            Some(id) => self.get(id).await,
            None => sqlx::query_as::<_, DatasourceRow>(
                "SELECT * FROM datasources WHERE is_default = TRUE LIMIT 1",
            )
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found("no default datasource configured"))?
            .into_datasource(),
        }
    }

    pub async fn update(
        &self,
        id: &str,
        req: UpdateDatasourceRequest,
    ) -> EngineResult<Datasource> {
        req.validate()
            .map_err(|e| EngineError::validation(format!("invalid datasource update: {}", e)))?;

        if req.is_default == Some(true) {
            sqlx::query("UPDATE datasources SET is_default = FALSE")
                .execute(&self.db)
                .await?;
        }

        let mut sql = String::from("UPDATE datasources SET updated_at = CURRENT_TIMESTAMP");
        let mut args = SqliteArguments::default();

        if let Some(v) = &req.name {
            sql.push_str(", name = ?");
            args.add(v);
        }
        if let Some(v) = &req.connection {
            sql.push_str(", connection_json = ?");
            args.add(serde_json::to_string(v)?);
        }
        if let Some(v) = &req.status {
            sql.push_str(", status = ?");
            args.add(v.as_str());
        }
        if let Some(v) = &req.is_default {
            sql.push_str(", is_default = ?");
            args.add(v);
        }

        sql.push_str(" WHERE id = ?");
        args.add(id);

        let result = sqlx::query_with(&sql, args).execute(&self.db).await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("datasource '{}' not found", id)));
        }

        // Pooled connections and cached schemas may now point at the old
        // endpoint.
        self.pool_manager.invalidate(id);
        self.memo.invalidate_prefix(&format!("schema:{}:", id));

        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM datasources WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("datasource '{}' not found", id)));
        }
        self.pool_manager.invalidate(id);
        self.memo.invalidate_prefix(&format!("schema:{}:", id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Engine operations
    // ------------------------------------------------------------------

    /// Probe connectivity without registering anything.
    pub async fn test_connection(
        &self,
        ds_type: DatasourceType,
        connection: &ConnectionInfo,
    ) -> TestConnectionResponse {
        let started = Instant::now();
        let outcome = async {
            let mut adapter = create_adapter(ds_type, connection)?;
            adapter.connect().await?;
            adapter.ping().await?;
            adapter.disconnect().await
        }
        .await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => TestConnectionResponse {
                success: true,
                message: "Connection successful".to_string(),
                latency_ms: Some(latency_ms),
            },
            Err(e) => TestConnectionResponse {
                success: false,
                message: format!("Connection failed: {}", e),
                latency_ms: Some(latency_ms),
            },
        }
    }

    /// Uncached introspection through the pool.
    pub async fn get_schema(&self, id: &str) -> EngineResult<SchemaDescriptor> {
        let datasource = self.get(id).await?;
        let mut conn = self.pool_manager.acquire(&datasource).await?;
        conn.adapter_mut().introspect().await
    }

    /// Operator-facing raw execution; every statement lands in the query
    /// history regardless of outcome.
    pub async fn execute_query(
        &self,
        id: &str,
        sql: &str,
        options: &QueryOptions,
    ) -> EngineResult<QueryResult> {
        let datasource = self.get(id).await?;
        self.execute_on(&datasource, sql, options).await
    }

    pub async fn execute_on(
        &self,
        datasource: &Datasource,
        sql: &str,
        options: &QueryOptions,
    ) -> EngineResult<QueryResult> {
        let mut conn = self.pool_manager.acquire(datasource).await?;
        let outcome = conn.execute(sql, options).await;

        match &outcome {
            Ok(result) => {
                self.record_query(
                    &datasource.id,
                    sql,
                    result.duration_ms as i64,
                    result.row_count as i64,
                    QueryStatus::Success,
                    None,
                )
                .await;
            },
            Err(e) => {
                self.record_query(&datasource.id, sql, 0, 0, QueryStatus::Error, Some(&e.to_string()))
                    .await;
            },
        }

        self.touch_last_used(&datasource.id).await;
        outcome
    }

    /// History writes never fail the query they describe.
    pub async fn record_query(
        &self,
        datasource_id: &str,
        sql: &str,
        duration_ms: i64,
        row_count: i64,
        status: QueryStatus,
        error: Option<&str>,
    ) {
        let outcome = sqlx::query(
            r#"INSERT INTO query_history (id, datasource_id, sql, executed_at, duration_ms, row_count, status, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(datasource_id)
        .bind(sql)
        .bind(Utc::now())
        .bind(duration_ms)
        .bind(row_count)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.db)
        .await;

        if let Err(e) = outcome {
            tracing::warn!("Failed to record query history: {}", e);
        }
    }

    pub async fn query_history(
        &self,
        datasource_id: Option<&str>,
        status: Option<QueryStatus>,
        limit: i64,
    ) -> EngineResult<Vec<QueryRecord>> {
        let mut sql = String::from("SELECT * FROM query_history WHERE 1 = 1");
        let mut args = SqliteArguments::default();
        if let Some(id) = datasource_id {
            sql.push_str(" AND datasource_id = ?");
            args.add(id);
        }
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.add(status.as_str());
        }
        sql.push_str(" ORDER BY executed_at DESC LIMIT ?");
        args.add(limit.clamp(1, 1_000));

        sqlx::query_as_with::<_, QueryRecord, _>(&sql, args)
            .fetch_all(&self.db)
            .await
            .map_err(EngineError::from)
    }

    /// Built-in monitoring KPIs derived from recent history.
    pub async fn history_kpis(&self, window_minutes: i64) -> EngineResult<(f64, f64, f64)> {
        // executed_at is bound as RFC-3339; normalize both sides through
        // datetime() so the comparison is on parsed timestamps.
        let row: (i64, i64, f64) = sqlx::query_as(
            r#"SELECT COUNT(*),
                      COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0),
                      COALESCE(AVG(duration_ms), 0.0)
               FROM query_history
               WHERE datetime(executed_at) >= datetime('now', '-' || ? || ' minutes')"#,
        )
        .bind(window_minutes)
        .fetch_one(&self.db)
        .await?;

        let (total, errors, avg_duration) = row;
        let error_rate = if total > 0 { errors as f64 / total as f64 } else { 0.0 };
        Ok((total as f64, error_rate, avg_duration))
    }

    async fn touch_last_used(&self, id: &str) {
        let outcome = sqlx::query("UPDATE datasources SET last_used_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await;
        if let Err(e) = outcome {
            tracing::warn!("Failed to touch datasource {}: {}", id, e);
        }
    }
}
