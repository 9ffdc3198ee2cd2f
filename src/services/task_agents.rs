//! Built-in task agents the execution engine dispatches to.
//!
//! `analysis` runs the full NL-to-SQL pipeline for the task at hand;
//! `schema` summarizes the data available; `insight` synthesizes upstream
//! outputs; `approval` blocks until an operator completes it.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::models::{AgentIntent, AnalysisRequest, Task};
use crate::services::analysis::AnalysisService;
use crate::services::datasource::DatasourceService;
use crate::services::execution::{TaskAgent, TaskContext, TaskOutcome};
use crate::services::llm::{AgentRuntime, InvokeSpec, SchemaAgent};
use crate::utils::{EngineError, EngineResult};

// ============================================================================
// analysis
// ============================================================================

pub struct AnalysisTaskAgent {
    analysis: Arc<AnalysisService>,
}

impl AnalysisTaskAgent {
    pub fn new(analysis: Arc<AnalysisService>) -> Self {
        Self { analysis }
    }
}

#[async_trait]
impl TaskAgent for AnalysisTaskAgent {
    async fn run(&self, task: &Task, ctx: &TaskContext) -> EngineResult<TaskOutcome> {
        ctx.cancel.check("analysis task")?;

        // The task title scopes the plan-level question to this step.
        let question = if task.title.is_empty() {
            ctx.question.clone()
        } else {
            format!("{} ({})", ctx.question, task.title)
        };

        let result = self
            .analysis
            .analyze_cancellable(
                AnalysisRequest {
                    question,
                    datasource_id: None,
                    scene: ctx.scene.clone(),
                    llm_binding_id: None,
                    agent_profile_id: None,
                    visualize: false,
                },
                ctx.cancel.clone(),
            )
            .await?;

        match result.intent {
            AgentIntent::Answer => Ok(TaskOutcome::Completed(serde_json::to_value(&result)?)),
            AgentIntent::Clarification => Ok(TaskOutcome::Blocked(
                result
                    .clarification
                    .map(|c| c.question)
                    .unwrap_or_else(|| "clarification required".to_string()),
            )),
            AgentIntent::Error => Err(EngineError::sql(
                result.errors.last().cloned().unwrap_or_else(|| "analysis failed".to_string()),
            )),
        }
    }
}

// ============================================================================
// schema
// ============================================================================

pub struct SchemaTaskAgent {
    schema_agent: Arc<SchemaAgent>,
    datasources: Arc<DatasourceService>,
}

impl SchemaTaskAgent {
    pub fn new(schema_agent: Arc<SchemaAgent>, datasources: Arc<DatasourceService>) -> Self {
        Self { schema_agent, datasources }
    }
}

#[async_trait]
impl TaskAgent for SchemaTaskAgent {
    async fn run(&self, _task: &Task, ctx: &TaskContext) -> EngineResult<TaskOutcome> {
        ctx.cancel.check("schema task")?;
        let datasource = self.datasources.resolve(None).await?;
        let descriptor =
            self.schema_agent.relevant_schema(&datasource, Some(&ctx.question)).await?;
        Ok(TaskOutcome::Completed(serde_json::json!({
            "datasource_id": datasource.id,
            "dialect": descriptor.dialect,
            "tables": descriptor.tables.iter().map(|t| &t.name).collect::<Vec<_>>(),
            "schema": descriptor,
        })))
    }
}

// ============================================================================
// insight
// ============================================================================

pub struct InsightTaskAgent {
    runtime: Arc<AgentRuntime>,
}

impl InsightTaskAgent {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }
}

const INSIGHT_PROMPT: &str = "You are an analyst writing up intermediate findings. \
Given a business question and the JSON outputs of the steps taken so far, \
write a concise summary: what was measured, the headline numbers, and any \
follow-up worth running. Plain text, at most one short paragraph.";

#[async_trait]
impl TaskAgent for InsightTaskAgent {
    async fn run(&self, _task: &Task, ctx: &TaskContext) -> EngineResult<TaskOutcome> {
        ctx.cancel.check("insight task")?;

        let payload = serde_json::json!({
            "question": ctx.question,
            "step_outputs": ctx.outputs,
        });
        let message = self
            .runtime
            .invoke(InvokeSpec {
                scene: ctx.scene.clone(),
                binding_id: None,
                profile_id: None,
                step: "insight_agent".to_string(),
                system: INSIGHT_PROMPT.to_string(),
                user: serde_json::to_string_pretty(&payload)?,
                expect_json: false,
            })
            .await?;

        Ok(TaskOutcome::Completed(Value::String(message.content)))
    }
}

// ============================================================================
// approval
// ============================================================================

/// Human-in-the-loop gate: always blocks; an operator resolves it through
/// `task_action(complete)`.
pub struct ApprovalTaskAgent;

#[async_trait]
impl TaskAgent for ApprovalTaskAgent {
    async fn run(&self, task: &Task, _ctx: &TaskContext) -> EngineResult<TaskOutcome> {
        Ok(TaskOutcome::Blocked(format!("'{}' awaits operator approval", task.title)))
    }
}
