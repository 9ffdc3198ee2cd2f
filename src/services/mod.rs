pub mod adapter;
pub mod analysis;
pub mod datasource;
pub mod execution;
pub mod llm;
pub mod memo;
pub mod memory;
pub mod monitoring;
pub mod notifier;
pub mod planner;
pub mod pool;
pub mod sql_validate;
pub mod task_agents;

pub use analysis::AnalysisService;
pub use datasource::DatasourceService;
pub use execution::{ExecutionService, TaskAgent, TaskContext, TaskOutcome};
pub use llm::{AgentRuntime, LanguageProvider, LlmRepository, SchemaAgent, SqlAgent, VisualizeAgent};
pub use memo::MemoCache;
pub use memory::{MemoryStore, SemanticEnhancer};
pub use monitoring::MonitoringService;
pub use notifier::{LogNotifier, Notifier};
pub use planner::PlannerService;
pub use pool::{PoolManager, PoolStats, PooledConnection};
