//! Shared test harness: full service wiring over an in-memory metadata
//! store, a scripted mock engine, a scripted LLM provider, and a mock
//! notifier.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{ConnectionInfo, CreateDatasourceRequest, DatasourceType};
use crate::services::adapter::mock::MockEngine;
use crate::services::llm::MockProvider;
use crate::services::notifier::MockNotifier;
use crate::services::pool::PoolManager;
use crate::services::AgentRuntime;
use crate::Services;

pub struct Harness {
    pub services: Services,
    pub engine: Arc<MockEngine>,
    pub provider: Arc<MockProvider>,
    pub notifier: Arc<MockNotifier>,
    pub datasource_id: String,
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

/// Harness with a config tweak (timeouts, caps).
pub async fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let mut config = Config::default();
    tweak(&mut config);

    let db = SqlitePool::connect("sqlite::memory:").await.expect("metadata store");
    crate::db::init_schema(&db).await.expect("schema bootstrap");

    let engine = MockEngine::with_schema(MockEngine::sales_schema());
    let pool_manager =
        Arc::new(PoolManager::with_factory(config.pool.clone(), engine.factory()));

    let provider = MockProvider::new();
    let runtime = Arc::new(AgentRuntime::with_provider(
        db.clone(),
        Arc::clone(&provider) as Arc<dyn crate::services::LanguageProvider>,
    ));

    let notifier = MockNotifier::new();

    let services = Services::assemble(
        &config,
        db.clone(),
        pool_manager,
        runtime,
        Arc::clone(&notifier) as Arc<dyn crate::services::Notifier>,
    )
    .await
    .expect("service wiring");

    sqlx::query(
        r#"INSERT INTO llm_bindings (id, name, api_base, model_name, is_default)
           VALUES ('binding-default', 'default', 'http://localhost', 'test-model', TRUE)"#,
    )
    .execute(&db)
    .await
    .expect("seed llm binding");

    let datasource = services
        .datasources
        .create(CreateDatasourceRequest {
            name: "ds_pg_sales".to_string(),
            ds_type: DatasourceType::Sqlite,
            connection: ConnectionInfo {
                url: Some("sqlite::memory:".to_string()),
                ..Default::default()
            },
            is_default: true,
        })
        .await
        .expect("seed datasource");

    Harness { services, engine, provider, notifier, datasource_id: datasource.id }
}
