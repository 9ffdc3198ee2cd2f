//! Visualize agent: chart recommendation plus a short insight over a
//! tabular result. Pure function of its inputs apart from the LLM call.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::runtime::{AgentRuntime, InvokeSpec};
use crate::models::{ColumnMeta, Scene, Visualization};
use crate::utils::{EngineError, EngineResult};

const PROMPT: &str = include_str!("visualize_agent_prompt.md");

/// Rows sampled into the prompt; enough for shape, cheap on tokens.
const SAMPLE_ROWS: usize = 20;

pub struct VisualizeInput<'a> {
    pub question: &'a str,
    pub columns: &'a [ColumnMeta],
    pub rows: &'a [Vec<Value>],
    pub scene: Scene,
    pub binding_id: Option<String>,
    pub profile_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReply {
    #[serde(default)]
    chart_type: String,
    #[serde(default)]
    spec: Value,
    #[serde(default)]
    insight: Option<String>,
}

pub struct VisualizeAgent {
    runtime: Arc<AgentRuntime>,
}

impl VisualizeAgent {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    /// Whether a result is worth charting: at least one categorical-ish
    /// and one numeric column, and at least one row.
    pub fn chartable(columns: &[ColumnMeta], rows: &[Vec<Value>]) -> bool {
        if rows.is_empty() || columns.len() < 2 {
            return false;
        }
        let first = match rows.first() {
            Some(row) => row,
            None => return false,
        };
        let has_numeric = first.iter().any(|v| v.is_number());
        let has_categorical = first.iter().any(|v| v.is_string() || v.is_boolean());
        has_numeric && has_categorical
    }

    pub async fn recommend(&self, input: VisualizeInput<'_>) -> EngineResult<Visualization> {
        let payload = serde_json::json!({
            "question": input.question,
            "columns": input.columns,
            "rows": input.rows.iter().take(SAMPLE_ROWS).collect::<Vec<_>>(),
            "total_rows": input.rows.len(),
        });

        let message = self
            .runtime
            .invoke(InvokeSpec {
                scene: input.scene,
                binding_id: input.binding_id,
                profile_id: input.profile_id,
                step: "visualize_agent".to_string(),
                system: PROMPT.to_string(),
                user: serde_json::to_string_pretty(&payload)?,
                expect_json: true,
            })
            .await?;

        let data = message
            .data
            .ok_or_else(|| EngineError::llm_protocol("visualize agent returned no JSON"))?;
        let raw: RawReply = serde_json::from_value(data).map_err(|e| {
            EngineError::llm_protocol(format!("visualize agent reply malformed: {}", e))
        })?;

        let chart_type = match raw.chart_type.as_str() {
            "bar" | "line" | "pie" | "scatter" | "table" => raw.chart_type,
            _ => "table".to_string(),
        };

        Ok(Visualization { chart_type, spec: raw.spec, insight: raw.insight })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta { name: "product".to_string(), data_type: "text".to_string() },
            ColumnMeta { name: "revenue".to_string(), data_type: "numeric".to_string() },
        ]
    }

    #[test]
    fn chartable_needs_category_and_number() {
        let rows = vec![vec![Value::from("widget"), Value::from(10.5)]];
        assert!(VisualizeAgent::chartable(&columns(), &rows));

        let numeric_only = vec![vec![Value::from(1), Value::from(2)]];
        assert!(!VisualizeAgent::chartable(&columns(), &numeric_only));

        assert!(!VisualizeAgent::chartable(&columns(), &[]));
    }

    #[tokio::test]
    async fn unknown_chart_types_fall_back_to_table() {
        let provider = crate::services::llm::provider::MockProvider::new();
        provider.push_reply(r#"{"chart_type": "hologram", "spec": {"x": "product", "y": "revenue"}}"#);

        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.expect("pool");
        crate::db::init_schema(&pool).await.expect("schema");
        sqlx::query(
            r#"INSERT INTO llm_bindings (id, name, api_base, model_name, is_default)
               VALUES ('b1', 'default', 'http://localhost', 'test-model', TRUE)"#,
        )
        .execute(&pool)
        .await
        .expect("seed binding");

        let runtime = Arc::new(AgentRuntime::with_provider(pool, provider));
        let agent = VisualizeAgent::new(runtime);

        let rows = vec![vec![Value::from("widget"), Value::from(10.5)]];
        let viz = agent
            .recommend(VisualizeInput {
                question: "revenue by product",
                columns: &columns(),
                rows: &rows,
                scene: Scene::Dashboard,
                binding_id: None,
                profile_id: None,
            })
            .await
            .expect("visualization");

        assert_eq!(viz.chart_type, "table");
    }
}
