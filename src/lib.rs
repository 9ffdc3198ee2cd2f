//! ChatBI core engine
//!
//! Answers natural-language business questions over relational datastores
//! by orchestrating specialized agents, executes the resulting SQL through
//! a pooled adapter layer, drives long-running analyses as an explicit
//! task state machine, and closes a monitoring loop from metric rules to
//! notified alerts.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use services::{
    AgentRuntime, AnalysisService, DatasourceService, ExecutionService, MemoCache, MemoryStore,
    MonitoringService, PlannerService, PoolManager, SchemaAgent, SqlAgent, VisualizeAgent,
};
pub use utils::{EngineError, EngineResult, Envelope};

use services::notifier::{LogNotifier, Notifier};
use services::task_agents::{
    AnalysisTaskAgent, ApprovalTaskAgent, InsightTaskAgent, SchemaTaskAgent,
};

/// Explicit wiring of every service, built once at startup and passed
/// down. Rust's type system is the DI container; everything is Arc for
/// cheap cloning across workers.
#[derive(Clone)]
pub struct Services {
    pub db: SqlitePool,
    pub pool_manager: Arc<PoolManager>,
    pub memo: Arc<MemoCache>,
    pub memory: Arc<MemoryStore>,
    pub datasources: Arc<DatasourceService>,
    pub runtime: Arc<AgentRuntime>,
    pub schema_agent: Arc<SchemaAgent>,
    pub analysis: Arc<AnalysisService>,
    pub planner: Arc<PlannerService>,
    pub executions: Arc<ExecutionService>,
    pub monitoring: Arc<MonitoringService>,
}

impl Services {
    /// Production wiring: real adapter registry, OpenAI-compatible
    /// providers, log-channel notifier.
    pub async fn build(config: &Config, db: SqlitePool) -> EngineResult<Self> {
        let pool_manager = Arc::new(PoolManager::new(config.pool.clone()));
        let runtime = Arc::new(AgentRuntime::new(db.clone(), config.llm.enabled));
        Self::assemble(config, db, pool_manager, runtime, Arc::new(LogNotifier)).await
    }

    /// Wiring with injectable pool, runtime, and notifier (tests swap in
    /// mock engines and scripted providers here).
    pub async fn assemble(
        config: &Config,
        db: SqlitePool,
        pool_manager: Arc<PoolManager>,
        runtime: Arc<AgentRuntime>,
        notifier: Arc<dyn Notifier>,
    ) -> EngineResult<Self> {
        let memo = Arc::new(MemoCache::new());
        let memory = Arc::new(MemoryStore::new(db.clone(), config.memory.max_events));
        if let Err(e) = memory.hydrate().await {
            tracing::warn!("memory hydration failed: {}", e);
        }

        let datasources = Arc::new(DatasourceService::new(
            db.clone(),
            Arc::clone(&pool_manager),
            Arc::clone(&memo),
        ));

        let schema_agent = Arc::new(SchemaAgent::new(
            Arc::clone(&pool_manager),
            Arc::clone(&memo),
            Duration::from_secs(config.llm.schema_cache_ttl_secs),
        ));
        let sql_agent = Arc::new(SqlAgent::new(Arc::clone(&runtime)));
        let visualize_agent = Arc::new(VisualizeAgent::new(Arc::clone(&runtime)));

        let analysis = Arc::new(AnalysisService::new(
            db.clone(),
            config.analyze.clone(),
            Arc::clone(&datasources),
            Arc::clone(&schema_agent),
            Arc::clone(&sql_agent),
            Arc::clone(&visualize_agent),
            Arc::clone(&runtime),
            Arc::clone(&memory),
        ));

        let planner = Arc::new(PlannerService::new(db.clone()));
        planner.seed_defaults().await?;

        let executions = Arc::new(ExecutionService::new(db.clone(), config.execution.clone()));
        executions.register_agent("analysis", Arc::new(AnalysisTaskAgent::new(Arc::clone(&analysis))));
        executions.register_agent(
            "schema",
            Arc::new(SchemaTaskAgent::new(Arc::clone(&schema_agent), Arc::clone(&datasources))),
        );
        executions.register_agent("insight", Arc::new(InsightTaskAgent::new(Arc::clone(&runtime))));
        executions.register_agent("approval", Arc::new(ApprovalTaskAgent));

        let monitoring = Arc::new(MonitoringService::new(
            db.clone(),
            config.monitoring.clone(),
            Arc::clone(&datasources),
            Arc::clone(&pool_manager),
            notifier,
            Arc::clone(&memory),
        ));

        Ok(Self {
            db,
            pool_manager,
            memo,
            memory,
            datasources,
            runtime,
            schema_agent,
            analysis,
            planner,
            executions,
            monitoring,
        })
    }
}
