//! Metadata store (SQLite) pool creation and schema bootstrap.
//!
//! Two table families: config (last-writer-wins, `updated_at` stamped) and
//! events (append-mostly, pruned by age or cardinality).

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

pub async fn create_pool(url: &str) -> Result<SqlitePool, anyhow::Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Idempotent schema bootstrap. Also used by tests against `sqlite::memory:`.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), anyhow::Error> {
    for ddl in SCHEMA {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

const SCHEMA: &[&str] = &[
    // ---- config family ----
    r#"
    CREATE TABLE IF NOT EXISTS datasources (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        ds_type TEXT NOT NULL,
        connection_json TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        is_default BOOLEAN NOT NULL DEFAULT FALSE,
        last_used_at TIMESTAMP,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS llm_bindings (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        api_base TEXT NOT NULL,
        model_name TEXT NOT NULL,
        api_key TEXT,
        temperature REAL NOT NULL DEFAULT 0.3,
        max_tokens INTEGER NOT NULL DEFAULT 4096,
        timeout_seconds INTEGER NOT NULL DEFAULT 60,
        scene TEXT,
        is_default BOOLEAN NOT NULL DEFAULT FALSE,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_profiles (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        binding_id TEXT,
        sql_tool BOOLEAN NOT NULL DEFAULT TRUE,
        rag_tool BOOLEAN NOT NULL DEFAULT FALSE,
        rule_validation BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS planning_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        keywords_json TEXT NOT NULL DEFAULT '[]',
        scene TEXT,
        loan_type TEXT,
        chain_id TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 100,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chains (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        nodes_json TEXT NOT NULL,
        edges_json TEXT NOT NULL DEFAULT '[]',
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metric_rules (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        metric_key TEXT NOT NULL,
        operator TEXT NOT NULL,
        threshold REAL NOT NULL,
        severity TEXT NOT NULL DEFAULT 'medium',
        scope TEXT NOT NULL DEFAULT 'data',
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metric_queries (
        metric_key TEXT PRIMARY KEY,
        datasource_id TEXT NOT NULL,
        sql TEXT NOT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS diagnosis_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        config_json TEXT NOT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS email_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        config_json TEXT NOT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    // ---- event family ----
    r#"
    CREATE TABLE IF NOT EXISTS query_history (
        id TEXT PRIMARY KEY,
        datasource_id TEXT NOT NULL,
        sql TEXT NOT NULL,
        executed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        duration_ms INTEGER NOT NULL,
        row_count INTEGER NOT NULL,
        status TEXT NOT NULL,
        error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS correction_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        sql TEXT NOT NULL,
        error TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        profile_id TEXT,
        step TEXT NOT NULL,
        status TEXT NOT NULL,
        detail TEXT NOT NULL DEFAULT '',
        metadata_json TEXT NOT NULL DEFAULT '{}',
        ts TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id TEXT PRIMARY KEY,
        rule_id TEXT NOT NULL,
        metric_key TEXT NOT NULL,
        current_value REAL NOT NULL,
        operator TEXT NOT NULL,
        threshold REAL NOT NULL,
        triggered_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        status TEXT NOT NULL DEFAULT 'triggered',
        diagnosis_json TEXT,
        notification_json TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        plan_id TEXT NOT NULL,
        question TEXT NOT NULL,
        scene TEXT,
        loan_type TEXT,
        state TEXT NOT NULL,
        tasks_json TEXT NOT NULL,
        cursor_index INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS memory_events (
        id TEXT PRIMARY KEY,
        ts TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        event_type TEXT NOT NULL,
        scene TEXT NOT NULL,
        user_text TEXT,
        result_summary TEXT,
        sql TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scene TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        sql TEXT,
        ts TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_query_history_ds ON query_history (datasource_id, executed_at)",
    "CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts (rule_id, metric_key, triggered_at)",
    "CREATE INDEX IF NOT EXISTS idx_chat_history_scene ON chat_history (scene, ts)",
];
