//! SQL agent: turns a question plus schema context into a SQL draft, or a
//! clarification when the question is under-specified. Also serves the
//! correction loop by taking the previous statement and its engine error.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::runtime::{AgentRuntime, InvokeSpec};
use crate::models::{AgentIntent, Clarification, Dialect, MemoryEvent, Scene, SchemaDescriptor};
use crate::utils::{EngineError, EngineResult};

const PROMPT: &str = include_str!("sql_agent_prompt.md");

/// Clarifications carry at most this many options.
const MAX_CLARIFICATION_OPTIONS: usize = 4;

pub struct SqlAgentInput<'a> {
    pub question: &'a str,
    pub schema: &'a SchemaDescriptor,
    pub dialect: Dialect,
    pub scene: Scene,
    pub binding_id: Option<String>,
    pub profile_id: Option<String>,
    pub max_rows: u64,
    /// Recent conversation turns for follow-up questions.
    pub history: &'a [(String, String)],
    pub memory_context: &'a [MemoryEvent],
    /// RAG snippets, present only when the profile enables the tool.
    pub rag_context: &'a [String],
    /// Correction-loop context.
    pub previous_sql: Option<&'a str>,
    pub engine_error: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct SqlDraft {
    pub intent: AgentIntent,
    pub sql: Option<String>,
    pub should_visualize: bool,
    pub clarification: Option<Clarification>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReply {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    should_visualize: bool,
    #[serde(default)]
    clarification: Option<RawClarification>,
}

#[derive(Debug, Default, Deserialize)]
struct RawClarification {
    #[serde(default)]
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

pub struct SqlAgent {
    runtime: Arc<AgentRuntime>,
}

impl SqlAgent {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn generate(&self, input: SqlAgentInput<'_>) -> EngineResult<SqlDraft> {
        let step = if input.previous_sql.is_some() { "sql_agent_correction" } else { "sql_agent" };

        let message = self
            .runtime
            .invoke(InvokeSpec {
                scene: input.scene.clone(),
                binding_id: input.binding_id.clone(),
                profile_id: input.profile_id.clone(),
                step: step.to_string(),
                system: PROMPT.to_string(),
                user: render_user_payload(&input)?,
                expect_json: true,
            })
            .await?;

        let data = message
            .data
            .ok_or_else(|| EngineError::llm_protocol("sql agent returned no JSON payload"))?;
        let raw: RawReply = serde_json::from_value(data)
            .map_err(|e| EngineError::llm_protocol(format!("sql agent reply malformed: {}", e)))?;

        self.normalize(raw)
    }

    fn normalize(&self, raw: RawReply) -> EngineResult<SqlDraft> {
        if raw.intent == "clarification" {
            let clarification = raw.clarification.ok_or_else(|| {
                EngineError::llm_protocol("clarification reply without a question")
            })?;
            if clarification.question.trim().is_empty() {
                return Err(EngineError::llm_protocol("clarification reply without a question"));
            }
            let mut options = clarification.options;
            options.truncate(MAX_CLARIFICATION_OPTIONS);
            return Ok(SqlDraft {
                intent: AgentIntent::Clarification,
                sql: None,
                should_visualize: false,
                clarification: Some(Clarification {
                    question: clarification.question,
                    options,
                }),
            });
        }

        let sql = raw
            .sql
            .map(|s| s.trim().trim_end_matches(';').trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::llm_protocol("answer reply without sql"))?;

        Ok(SqlDraft {
            intent: AgentIntent::Answer,
            sql: Some(sql),
            should_visualize: raw.should_visualize,
            clarification: None,
        })
    }
}

fn render_user_payload(input: &SqlAgentInput<'_>) -> EngineResult<String> {
    let history: Vec<Value> = input
        .history
        .iter()
        .map(|(role, content)| serde_json::json!({ "role": role, "content": content }))
        .collect();

    let memory: Vec<Value> = input
        .memory_context
        .iter()
        .filter_map(|event| {
            let text = event.user_text.as_deref()?;
            Some(serde_json::json!({
                "question": text,
                "sql": event.sql,
            }))
        })
        .collect();

    let mut payload = serde_json::json!({
        "question": input.question,
        "dialect": input.dialect.as_str(),
        "max_rows": input.max_rows,
        "schema": input.schema.render_for_prompt(),
    });

    if !history.is_empty() {
        payload["history"] = Value::Array(history);
    }
    if !memory.is_empty() {
        payload["similar_past_queries"] = Value::Array(memory);
    }
    if !input.rag_context.is_empty() {
        payload["reference_documents"] = serde_json::json!(input.rag_context);
    }
    if let Some(previous_sql) = input.previous_sql {
        payload["previous_sql"] = Value::String(previous_sql.to_string());
    }
    if let Some(engine_error) = input.engine_error {
        payload["engine_error"] = Value::String(engine_error.to_string());
    }

    serde_json::to_string_pretty(&payload).map_err(EngineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::provider::MockProvider;
    use sqlx::SqlitePool;

    async fn runtime_with(provider: Arc<MockProvider>) -> Arc<AgentRuntime> {
        let pool = SqlitePool::connect("sqlite::memory:").await.expect("pool");
        crate::db::init_schema(&pool).await.expect("schema");
        sqlx::query(
            r#"INSERT INTO llm_bindings (id, name, api_base, model_name, is_default)
               VALUES ('b1', 'default', 'http://localhost', 'test-model', TRUE)"#,
        )
        .execute(&pool)
        .await
        .expect("seed binding");
        Arc::new(AgentRuntime::with_provider(pool, provider))
    }

    fn input<'a>(schema: &'a SchemaDescriptor) -> SqlAgentInput<'a> {
        SqlAgentInput {
            question: "top 5 products by revenue last 30d",
            schema,
            dialect: Dialect::Postgres,
            scene: Scene::Dashboard,
            binding_id: None,
            profile_id: None,
            max_rows: 1_000,
            history: &[],
            memory_context: &[],
            rag_context: &[],
            previous_sql: None,
            engine_error: None,
        }
    }

    #[tokio::test]
    async fn answer_reply_produces_draft() {
        let provider = MockProvider::new();
        provider.push_reply(
            r#"{"intent": "answer", "sql": "SELECT 1;", "should_visualize": true}"#,
        );
        let runtime = runtime_with(Arc::clone(&provider)).await;
        let agent = SqlAgent::new(runtime);

        let schema = crate::services::adapter::mock::MockEngine::sales_schema();
        let draft = agent.generate(input(&schema)).await.expect("draft");

        assert_eq!(draft.intent, AgentIntent::Answer);
        assert_eq!(draft.sql.as_deref(), Some("SELECT 1"));
        assert!(draft.should_visualize);
    }

    #[tokio::test]
    async fn clarification_options_are_capped_at_four() {
        let provider = MockProvider::new();
        provider.push_reply(
            r#"{"intent": "clarification", "clarification": {
                "question": "Which time window?",
                "options": ["today", "last 7 days", "last 30 days", "custom", "extra"]
            }}"#,
        );
        let runtime = runtime_with(provider).await;
        let agent = SqlAgent::new(runtime);

        let schema = crate::services::adapter::mock::MockEngine::sales_schema();
        let draft = agent.generate(input(&schema)).await.expect("draft");

        assert_eq!(draft.intent, AgentIntent::Clarification);
        let clarification = draft.clarification.expect("clarification");
        assert_eq!(clarification.question, "Which time window?");
        assert_eq!(clarification.options.len(), 4);
        assert!(draft.sql.is_none());
    }

    #[tokio::test]
    async fn correction_context_reaches_the_prompt() {
        let provider = MockProvider::new();
        provider.push_reply(r#"{"intent": "answer", "sql": "SELECT ordered_at FROM orders"}"#);
        let runtime = runtime_with(Arc::clone(&provider)).await;
        let agent = SqlAgent::new(runtime);

        let schema = crate::services::adapter::mock::MockEngine::sales_schema();
        let mut correction_input = input(&schema);
        correction_input.previous_sql = Some("SELECT ordered_on FROM orders");
        correction_input.engine_error = Some("column \"ordered_on\" does not exist");

        agent.generate(correction_input).await.expect("draft");

        let requests = provider.requests.lock().unwrap();
        assert!(requests[0].user.contains("ordered_on"));
        assert!(requests[0].user.contains("engine_error"));
    }
}
