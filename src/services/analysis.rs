//! End-to-end analysis pipeline: question in, answer/clarification out.
//!
//! Flow: resolve datasource -> schema agent -> sql agent -> validate ->
//! execute -> (correction loop on SQL errors) -> optional visualization.
//! Observable side effects per run: query history rows, correction log
//! rows, one memory event, and two chat turns.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use validator::Validate;

use crate::config::AnalyzeConfig;
use crate::models::{
    AgentIntent, AnalysisRequest, AnalysisResult, Datasource, MemoryEventType, QueryOptions,
    QueryResult, Scene,
};
use crate::services::datasource::DatasourceService;
use crate::services::llm::{
    AgentRuntime, SchemaAgent, SqlAgent, SqlAgentInput, SqlDraft, VectorStore, VisualizeAgent,
    VisualizeInput,
};
use crate::services::memory::MemoryStore;
use crate::services::sql_validate::{self, ValidationPolicy};
use crate::utils::backoff::task_retry_backoff;
use crate::utils::{CancelFlag, EngineError, EngineResult};

/// Conversation turns carried into the SQL agent for follow-ups.
const CHAT_CONTEXT_TURNS: i64 = 6;
/// Memory events carried as few-shot context.
const MEMORY_CONTEXT_EVENTS: usize = 3;
/// Extra attempts for transient driver failures of one statement.
const TRANSIENT_RETRIES: u32 = 2;

pub struct AnalysisService {
    db: SqlitePool,
    config: AnalyzeConfig,
    datasources: Arc<DatasourceService>,
    schema_agent: Arc<SchemaAgent>,
    sql_agent: Arc<SqlAgent>,
    visualize_agent: Arc<VisualizeAgent>,
    runtime: Arc<AgentRuntime>,
    memory: Arc<MemoryStore>,
    vector_store: Option<Arc<dyn VectorStore>>,
}

impl AnalysisService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: SqlitePool,
        config: AnalyzeConfig,
        datasources: Arc<DatasourceService>,
        schema_agent: Arc<SchemaAgent>,
        sql_agent: Arc<SqlAgent>,
        visualize_agent: Arc<VisualizeAgent>,
        runtime: Arc<AgentRuntime>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            db,
            config,
            datasources,
            schema_agent,
            sql_agent,
            visualize_agent,
            runtime,
            memory,
            vector_store: None,
        }
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> EngineResult<AnalysisResult> {
        self.analyze_cancellable(request, CancelFlag::new()).await
    }

    /// Client-initiated cancellation propagates into LLM and SQL calls at
    /// their next suspension point.
    pub async fn analyze_cancellable(
        &self,
        request: AnalysisRequest,
        cancel: CancelFlag,
    ) -> EngineResult<AnalysisResult> {
        request
            .validate()
            .map_err(|e| EngineError::validation(format!("invalid analysis request: {}", e)))?;

        let deadline = Duration::from_millis(self.config.end_to_end_timeout_ms);
        match tokio::time::timeout(deadline, self.run(request, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(format!(
                "analysis exceeded end-to-end cap of {:?}",
                deadline
            ))),
        }
    }

    async fn run(
        &self,
        request: AnalysisRequest,
        cancel: CancelFlag,
    ) -> EngineResult<AnalysisResult> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        tracing::info!(request_id = %request_id, scene = %request.scene, "analyze: {}", request.question);

        let datasource = self.datasources.resolve(request.datasource_id.as_deref()).await?;
        let features = self.runtime.features(request.agent_profile_id.as_deref()).await?;
        if !features.sql_tool {
            return Err(EngineError::validation(
                "sql tool is disabled for this agent profile",
            ));
        }
        cancel.check("analyze")?;

        let schema =
            self.schema_agent.relevant_schema(&datasource, Some(&request.question)).await?;
        let history = self.recent_chat(&request.scene, CHAT_CONTEXT_TURNS).await?;
        let memory_context =
            self.memory.search(&request.question, Some(&request.scene), MEMORY_CONTEXT_EVENTS);
        let rag_context = self.rag_context(&request.question, features.rag_tool).await;
        cancel.check("analyze")?;

        let draft = self
            .sql_agent
            .generate(SqlAgentInput {
                question: &request.question,
                schema: &schema,
                dialect: schema.dialect,
                scene: request.scene.clone(),
                binding_id: request.llm_binding_id.clone(),
                profile_id: request.agent_profile_id.clone(),
                max_rows: self.config.max_rows,
                history: &history,
                memory_context: &memory_context,
                rag_context: &rag_context,
                previous_sql: None,
                engine_error: None,
            })
            .await?;

        if draft.intent == AgentIntent::Clarification {
            return self.finish_clarification(request_id, &request, draft, started).await;
        }

        let policy = ValidationPolicy {
            read_only: request.scene.read_only(),
            lint: features.rule_validation,
            max_rows: self.config.max_rows,
        };
        let options =
            QueryOptions { timeout_ms: self.config.sql_timeout_ms, max_rows: self.config.max_rows };

        let mut current_sql = sql_validate::validate(
            draft.sql.as_deref().unwrap_or_default(),
            &policy,
        )?;
        let mut attempts = 0u32;
        let mut corrections_used = 0u32;
        let mut errors: Vec<String> = Vec::new();

        let outcome: Option<QueryResult> = loop {
            cancel.check("analyze")?;
            attempts += 1;

            match self.execute_with_transient_retry(&datasource, &current_sql, &options).await {
                Ok(result) => break Some(result),
                Err(EngineError::Sql { message }) => {
                    tracing::warn!(
                        request_id = %request_id,
                        attempt = attempts,
                        "SQL error: {}",
                        message
                    );
                    errors.push(message.clone());

                    if corrections_used >= self.config.max_correction_attempts {
                        break None;
                    }
                    corrections_used += 1;

                    let correction = self
                        .sql_agent
                        .generate(SqlAgentInput {
                            question: &request.question,
                            schema: &schema,
                            dialect: schema.dialect,
                            scene: request.scene.clone(),
                            binding_id: request.llm_binding_id.clone(),
                            profile_id: request.agent_profile_id.clone(),
                            max_rows: self.config.max_rows,
                            history: &history,
                            memory_context: &memory_context,
                            rag_context: &rag_context,
                            previous_sql: Some(&current_sql),
                            engine_error: Some(&message),
                        })
                        .await?;

                    if correction.intent == AgentIntent::Clarification {
                        return self
                            .finish_clarification(request_id, &request, correction, started)
                            .await;
                    }

                    let corrected = match sql_validate::validate(
                        correction.sql.as_deref().unwrap_or_default(),
                        &policy,
                    ) {
                        Ok(sql) => sql,
                        Err(e) => {
                            errors.push(e.to_string());
                            break None;
                        },
                    };

                    self.record_correction(&request_id, corrections_used, &corrected, &message)
                        .await;

                    // Fixed point: the agent resubmitted the failing SQL.
                    if corrected == current_sql {
                        break None;
                    }
                    current_sql = corrected;
                },
                Err(other) => return Err(other),
            }
        };

        match outcome {
            Some(result) => {
                self.finish_answer(request_id, &request, draft, current_sql, result, attempts, errors, started)
                    .await
            },
            None => {
                // Correction budget exhausted: surface the trail, not just
                // the last error.
                self.append_chat(&request.scene, "user", &request.question, None).await;
                self.record_memory(&request, None, Some("analysis failed")).await;
                Ok(AnalysisResult {
                    request_id,
                    intent: AgentIntent::Error,
                    sql: Some(current_sql),
                    columns: None,
                    rows: None,
                    row_count: None,
                    truncated: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    insight: None,
                    visualization: None,
                    clarification: None,
                    attempts,
                    errors,
                })
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_answer(
        &self,
        request_id: String,
        request: &AnalysisRequest,
        draft: SqlDraft,
        sql: String,
        result: QueryResult,
        attempts: u32,
        errors: Vec<String>,
        started: Instant,
    ) -> EngineResult<AnalysisResult> {
        let mut visualization = None;
        if (request.visualize || draft.should_visualize)
            && VisualizeAgent::chartable(&result.columns, &result.rows)
        {
            match self
                .visualize_agent
                .recommend(VisualizeInput {
                    question: &request.question,
                    columns: &result.columns,
                    rows: &result.rows,
                    scene: request.scene.clone(),
                    binding_id: request.llm_binding_id.clone(),
                    profile_id: request.agent_profile_id.clone(),
                })
                .await
            {
                Ok(viz) => visualization = Some(viz),
                Err(e) => {
                    // A failed chart never fails the answer.
                    tracing::warn!("visualization failed for {}: {}", request_id, e);
                },
            }
        }

        let insight = visualization.as_ref().and_then(|v| v.insight.clone());

        self.append_chat(&request.scene, "user", &request.question, None).await;
        self.append_chat(
            &request.scene,
            "assistant",
            &format!("{} rows", result.row_count),
            Some(&sql),
        )
        .await;
        self.record_memory(
            request,
            Some(&sql),
            Some(&format!("{} rows in {}ms", result.row_count, result.duration_ms)),
        )
        .await;

        Ok(AnalysisResult {
            request_id,
            intent: AgentIntent::Answer,
            sql: Some(sql),
            columns: Some(result.columns),
            row_count: Some(result.row_count),
            rows: Some(result.rows),
            truncated: result.truncated,
            duration_ms: started.elapsed().as_millis() as u64,
            insight,
            visualization,
            clarification: None,
            attempts,
            errors,
        })
    }

    async fn finish_clarification(
        &self,
        request_id: String,
        request: &AnalysisRequest,
        draft: SqlDraft,
        started: Instant,
    ) -> EngineResult<AnalysisResult> {
        let clarification = draft
            .clarification
            .ok_or_else(|| EngineError::llm_protocol("clarification draft without payload"))?;

        self.append_chat(&request.scene, "user", &request.question, None).await;
        self.append_chat(&request.scene, "assistant", &clarification.question, None).await;
        self.record_memory(request, None, Some(&clarification.question)).await;

        let mut result = AnalysisResult::clarification(request_id, clarification);
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Transient driver failures retry the same statement with backoff;
    /// everything else propagates.
    async fn execute_with_transient_retry(
        &self,
        datasource: &Datasource,
        sql: &str,
        options: &QueryOptions,
    ) -> EngineResult<QueryResult> {
        let mut attempt = 0u32;
        loop {
            match self.datasources.execute_on(datasource, sql, options).await {
                Err(EngineError::DbTransient(msg)) if attempt < TRANSIENT_RETRIES => {
                    let wait = task_retry_backoff(attempt);
                    tracing::warn!("transient engine failure ({}); retrying in {:?}", msg, wait);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                },
                other => return other,
            }
        }
    }

    async fn rag_context(&self, question: &str, enabled: bool) -> Vec<String> {
        if !enabled {
            return Vec::new();
        }
        let Some(store) = &self.vector_store else {
            return Vec::new();
        };
        match store.query(question, 3).await {
            Ok(snippets) => snippets,
            Err(e) => {
                tracing::warn!("vector store lookup failed: {}", e);
                Vec::new()
            },
        }
    }

    // ------------------------------------------------------------------
    // Chat history (conversation context for follow-up questions)
    // ------------------------------------------------------------------

    pub async fn recent_chat(
        &self,
        scene: &Scene,
        limit: i64,
    ) -> EngineResult<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"SELECT role, content FROM chat_history
               WHERE scene = ? ORDER BY ts DESC, id DESC LIMIT ?"#,
        )
        .bind(scene.as_str())
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().rev().collect())
    }

    async fn append_chat(&self, scene: &Scene, role: &str, content: &str, sql: Option<&str>) {
        let outcome = sqlx::query(
            "INSERT INTO chat_history (scene, role, content, sql) VALUES (?, ?, ?, ?)",
        )
        .bind(scene.as_str())
        .bind(role)
        .bind(content)
        .bind(sql)
        .execute(&self.db)
        .await;
        if let Err(e) = outcome {
            tracing::warn!("Failed to append chat history: {}", e);
        }
    }

    async fn record_memory(
        &self,
        request: &AnalysisRequest,
        sql: Option<&str>,
        summary: Option<&str>,
    ) {
        let outcome = self
            .memory
            .append(
                MemoryEventType::AnalysisResult,
                request.scene.clone(),
                Some(request.question.clone()),
                summary.map(str::to_string),
                sql.map(str::to_string),
            )
            .await;
        if let Err(e) = outcome {
            tracing::warn!("Failed to record memory event: {}", e);
        }
    }

    async fn record_correction(
        &self,
        request_id: &str,
        attempt: u32,
        sql: &str,
        error: &str,
    ) {
        let outcome = sqlx::query(
            "INSERT INTO correction_logs (request_id, attempt, sql, error) VALUES (?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(attempt as i64)
        .bind(sql)
        .bind(error)
        .execute(&self.db)
        .await;
        if let Err(e) = outcome {
            tracing::warn!("Failed to record correction log: {}", e);
        }
    }

    #[cfg(test)]
    pub async fn correction_log_count(&self, request_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM correction_logs WHERE request_id = ?")
            .bind(request_id)
            .fetch_one(&self.db)
            .await
            .unwrap_or(0)
    }
}
