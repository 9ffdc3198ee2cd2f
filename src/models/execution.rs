//! Execution entities: a running plan instance and its per-task state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::analysis::Scene;
use super::plan::{Plan, TaskSpec};
use crate::utils::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }

    /// Terminal task states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Counts as satisfied from a dependent's point of view.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub assigned_agent: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub skippable: bool,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl Task {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self {
            task_id: spec.task_id.clone(),
            title: spec.title.clone(),
            assigned_agent: spec.assigned_agent.clone(),
            depends_on: spec.depends_on.clone(),
            skippable: spec.skippable,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Created,
    Running,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "created" => Self::Created,
            "running" => Self::Running,
            "blocked" => Self::Blocked,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Terminal states are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Operator override actions on a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Start,
    Complete,
    Fail,
    Retry,
    Skip,
}

impl TaskAction {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "start" => Ok(Self::Start),
            "complete" => Ok(Self::Complete),
            "fail" => Ok(Self::Fail),
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            other => Err(EngineError::validation(format!("unknown task action: {}", other))),
        }
    }
}

/// Running instance of a plan. Owns snapshots of its tasks; related records
/// are referenced by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub plan_id: String,
    pub question: String,
    pub scene: Scene,
    #[serde(default)]
    pub loan_type: Option<String>,
    pub state: ExecutionState,
    pub tasks: Vec<Task>,
    pub cursor_index: u32,
}

impl Execution {
    pub fn from_plan(execution_id: String, plan: &Plan) -> Self {
        Self {
            execution_id,
            plan_id: plan.id.clone(),
            question: plan.question.clone(),
            scene: plan.scene.clone(),
            loan_type: plan.loan_type.clone(),
            state: ExecutionState::Created,
            tasks: plan.tasks.iter().map(Task::from_spec).collect(),
            cursor_index: 0,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_task_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.satisfies_dependency());
    }

    #[test]
    fn terminal_execution_states() {
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Cancelled.is_terminal());
        assert!(!ExecutionState::Blocked.is_terminal());
        assert_eq!(ExecutionState::parse("blocked"), ExecutionState::Blocked);
    }
}
