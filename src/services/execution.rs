//! A2A execution engine: drives a Plan as a durable task DAG.
//!
//! Transitions are serialized per execution by a tokio mutex; the registry
//! itself is lock-free. Snapshots are persisted to the `executions` table
//! on every mutation so executions survive restarts.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::models::{
    Execution, ExecutionState, Plan, Scene, Task, TaskAction, TaskStatus,
};
use crate::utils::backoff::task_retry_backoff;
use crate::utils::{CancelFlag, EngineError, EngineResult};

pub const UPSTREAM_SKIPPED: &str = "UPSTREAM_SKIPPED";
pub const CANCELLED: &str = "CANCELLED";

/// Context handed to a task agent: the question plus every completed
/// upstream output, keyed by task id.
#[derive(Clone)]
pub struct TaskContext {
    pub execution_id: String,
    pub question: String,
    pub scene: Scene,
    pub loan_type: Option<String>,
    pub outputs: serde_json::Map<String, Value>,
    pub cancel: CancelFlag,
}

pub enum TaskOutcome {
    Completed(Value),
    /// Waiting on an external signal (e.g. operator approval).
    Blocked(String),
}

#[async_trait]
pub trait TaskAgent: Send + Sync {
    async fn run(&self, task: &Task, ctx: &TaskContext) -> EngineResult<TaskOutcome>;
}

pub struct ExecutionService {
    db: SqlitePool,
    config: ExecutionConfig,
    registry: DashMap<String, Arc<Mutex<Execution>>>,
    cancel_flags: DashMap<String, CancelFlag>,
    agents: RwLock<HashMap<String, Arc<dyn TaskAgent>>>,
}

impl ExecutionService {
    pub fn new(db: SqlitePool, config: ExecutionConfig) -> Self {
        Self {
            db,
            config,
            registry: DashMap::new(),
            cancel_flags: DashMap::new(),
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_agent(&self, name: impl Into<String>, agent: Arc<dyn TaskAgent>) {
        if let Ok(mut agents) = self.agents.write() {
            agents.insert(name.into(), agent);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Materialize an execution from a plan: initial ready set computed,
    /// state moves created -> running.
    pub async fn start(&self, plan: &Plan) -> EngineResult<Execution> {
        let execution_id = Uuid::new_v4().to_string();
        let mut execution = Execution::from_plan(execution_id.clone(), plan);

        refresh_tasks(&mut execution);
        execution.state = ExecutionState::Running;

        self.persist(&execution).await?;
        self.registry.insert(execution_id.clone(), Arc::new(Mutex::new(execution.clone())));
        self.cancel_flags.insert(execution_id, CancelFlag::new());

        tracing::info!(
            "Execution {} started with {} tasks",
            execution.execution_id,
            execution.tasks.len()
        );
        Ok(execution)
    }

    pub async fn get(&self, execution_id: &str) -> EngineResult<Execution> {
        let entry = self.entry(execution_id).await?;
        let execution = entry.lock().await;
        Ok(execution.clone())
    }

    pub async fn list(&self, limit: i64) -> EngineResult<Vec<Execution>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT execution_id FROM executions ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.db)
        .await?;

        let mut executions = Vec::with_capacity(rows.len());
        for (id,) in rows {
            executions.push(self.get(&id).await?);
        }
        Ok(executions)
    }

    /// Advance by one step: run the lexicographically smallest ready task.
    /// A no-op on terminal executions.
    pub async fn tick(&self, execution_id: &str) -> EngineResult<Execution> {
        let entry = self.entry(execution_id).await?;
        let cancel = self.cancel_flag(execution_id);
        let mut execution = entry.lock().await;

        if execution.state.is_terminal() {
            return Ok(execution.clone());
        }
        if cancel.is_cancelled() {
            finalize_cancelled(&mut execution);
            self.persist(&execution).await?;
            return Ok(execution.clone());
        }
        if execution.state == ExecutionState::Created {
            execution.state = ExecutionState::Running;
        }

        refresh_tasks(&mut execution);

        let Some(task_id) = next_ready_task(&execution) else {
            execution.state = derive_state(&execution);
            self.persist(&execution).await?;
            return Ok(execution.clone());
        };

        let (agent_name, prior_attempts) = {
            let task = execution
                .task_mut(&task_id)
                .ok_or_else(|| EngineError::internal("ready task vanished"))?;
            task.status = TaskStatus::Running;
            task.attempts += 1;
            (task.assigned_agent.clone(), task.attempts - 1)
        };
        execution.cursor_index += 1;
        self.persist(&execution).await?;

        // Retried tasks back off with full jitter before re-running.
        if prior_attempts > 0 {
            tokio::time::sleep(task_retry_backoff(prior_attempts.saturating_sub(1))).await;
        }

        let context = build_context(&execution, &cancel);
        let agent = self.agent(&agent_name);
        let task_snapshot = execution
            .task(&task_id)
            .cloned()
            .ok_or_else(|| EngineError::internal("running task vanished"))?;

        let outcome = match agent {
            Some(agent) => agent.run(&task_snapshot, &context).await,
            None => Err(EngineError::validation(format!(
                "no task agent registered for '{}'",
                agent_name
            ))),
        };

        let max_attempts = self.config.max_attempts_per_task;
        if let Some(task) = execution.task_mut(&task_id) {
            match outcome {
                Ok(TaskOutcome::Completed(output)) => {
                    task.status = TaskStatus::Completed;
                    task.output = Some(output);
                    task.last_error = None;
                },
                Ok(TaskOutcome::Blocked(reason)) => {
                    task.status = TaskStatus::Blocked;
                    task.last_error = Some(reason);
                },
                Err(e) if matches!(e, EngineError::Cancelled(_)) => {
                    task.status = TaskStatus::Failed;
                    task.last_error = Some(CANCELLED.to_string());
                },
                Err(e) => {
                    task.last_error = Some(e.to_string());
                    if e.is_retryable() && task.attempts < max_attempts {
                        task.status = TaskStatus::Ready;
                    } else {
                        task.status = TaskStatus::Failed;
                    }
                },
            }
        }

        if cancel.is_cancelled() {
            finalize_cancelled(&mut execution);
        } else {
            refresh_tasks(&mut execution);
            execution.state = derive_state(&execution);
        }
        self.persist(&execution).await?;
        Ok(execution.clone())
    }

    /// Tick until terminal, blocked, or the step budget is spent.
    pub async fn run(&self, execution_id: &str, max_steps: u32) -> EngineResult<Execution> {
        let budget = max_steps.min(self.config.step_cap);
        let mut last = self.get(execution_id).await?;

        for _ in 0..budget {
            if last.state.is_terminal() || last.state == ExecutionState::Blocked {
                break;
            }
            let before = last.cursor_index;
            last = self.tick(execution_id).await?;
            if last.cursor_index == before {
                // No ready work; state already reflects why.
                break;
            }
        }
        Ok(last)
    }

    /// Operator override on one task.
    pub async fn task_action(
        &self,
        execution_id: &str,
        task_id: &str,
        action: TaskAction,
        output: Option<Value>,
    ) -> EngineResult<Execution> {
        let entry = self.entry(execution_id).await?;
        let mut execution = entry.lock().await;

        let max_attempts = self.config.max_attempts_per_task;
        let task = execution
            .task(task_id)
            .ok_or_else(|| EngineError::not_found(format!("task '{}' not found", task_id)))?;
        let status = task.status;

        // Idempotent completion first: valid even on a finished execution.
        if action == TaskAction::Complete && status == TaskStatus::Completed {
            return Ok(execution.clone());
        }

        if execution.state.is_terminal() {
            return Err(EngineError::conflict(format!(
                "execution is {} and cannot be modified",
                execution.state.as_str()
            )));
        }

        {
            let task = execution
                .task_mut(task_id)
                .ok_or_else(|| EngineError::not_found(format!("task '{}' not found", task_id)))?;

            match action {
                TaskAction::Start => {
                    if status != TaskStatus::Ready {
                        return Err(EngineError::conflict(format!(
                            "cannot start task in state '{}'",
                            status.as_str()
                        )));
                    }
                    task.status = TaskStatus::Running;
                    task.attempts += 1;
                },
                TaskAction::Complete => {
                    if status.is_terminal() {
                        return Err(EngineError::conflict("cannot complete a skipped task"));
                    }
                    task.status = TaskStatus::Completed;
                    task.output = Some(output.unwrap_or(Value::Null));
                    task.last_error = None;
                },
                TaskAction::Fail => {
                    if status.is_terminal() {
                        return Err(EngineError::conflict("task already finished"));
                    }
                    task.status = TaskStatus::Failed;
                    task.last_error = Some("failed by operator".to_string());
                },
                TaskAction::Retry => {
                    if status != TaskStatus::Failed {
                        return Err(EngineError::conflict("only failed tasks can be retried"));
                    }
                    if task.attempts >= max_attempts {
                        return Err(EngineError::validation(format!(
                            "task '{}' exhausted its {} attempts",
                            task_id, max_attempts
                        )));
                    }
                    task.status = TaskStatus::Ready;
                    task.last_error = None;
                },
                TaskAction::Skip => {
                    if status.is_terminal() {
                        return Err(EngineError::conflict("task already finished"));
                    }
                    task.status = TaskStatus::Skipped;
                    task.output = None;
                },
            }
        }

        refresh_tasks(&mut execution);
        execution.state = derive_state(&execution);
        self.persist(&execution).await?;
        Ok(execution.clone())
    }

    /// Mark the execution cancelled. The running task (if any) observes the
    /// flag at its next suspension point; every other live task finalizes
    /// as failed[CANCELLED] immediately.
    pub async fn cancel(&self, execution_id: &str) -> EngineResult<Execution> {
        // Raise the flag before taking the lock so an in-flight tick sees
        // it mid-run.
        self.cancel_flag(execution_id).cancel();

        let entry = self.entry(execution_id).await?;
        let mut execution = entry.lock().await;
        if execution.state.is_terminal() {
            return Ok(execution.clone());
        }

        finalize_cancelled(&mut execution);
        self.persist(&execution).await?;
        tracing::info!("Execution {} cancelled", execution_id);
        Ok(execution.clone())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn agent(&self, name: &str) -> Option<Arc<dyn TaskAgent>> {
        self.agents.read().ok()?.get(name).cloned()
    }

    fn cancel_flag(&self, execution_id: &str) -> CancelFlag {
        self.cancel_flags
            .entry(execution_id.to_string())
            .or_default()
            .clone()
    }

    async fn entry(&self, execution_id: &str) -> EngineResult<Arc<Mutex<Execution>>> {
        if let Some(entry) = self.registry.get(execution_id) {
            return Ok(Arc::clone(entry.value()));
        }

        // Fall back to the persisted snapshot (restart path).
        let row: Option<(String, String, String, Option<String>, Option<String>, String, i64)> =
            sqlx::query_as(
                r#"SELECT plan_id, question, state, scene, loan_type, tasks_json, cursor_index
                   FROM executions WHERE execution_id = ?"#,
            )
            .bind(execution_id)
            .fetch_optional(&self.db)
            .await?;

        let (plan_id, question, state, scene, loan_type, tasks_json, cursor_index) = row
            .ok_or_else(|| {
                EngineError::not_found(format!("execution '{}' not found", execution_id))
            })?;

        let execution = Execution {
            execution_id: execution_id.to_string(),
            plan_id,
            question,
            scene: scene.map(|s| Scene::parse(&s)).unwrap_or_default(),
            loan_type,
            state: ExecutionState::parse(&state),
            tasks: serde_json::from_str(&tasks_json)?,
            cursor_index: cursor_index as u32,
        };

        let entry = Arc::new(Mutex::new(execution));
        self.registry.insert(execution_id.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    async fn persist(&self, execution: &Execution) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO executions
               (execution_id, plan_id, question, scene, loan_type, state, tasks_json, cursor_index)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id) DO UPDATE SET
               state = excluded.state,
               tasks_json = excluded.tasks_json,
               cursor_index = excluded.cursor_index,
               updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(&execution.execution_id)
        .bind(&execution.plan_id)
        .bind(&execution.question)
        .bind(execution.scene.as_str())
        .bind(&execution.loan_type)
        .bind(execution.state.as_str())
        .bind(serde_json::to_string(&execution.tasks)?)
        .bind(execution.cursor_index as i64)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

/// pending -> ready when every dependency is satisfied; dependents of a
/// non-skippable skipped task fail with UPSTREAM_SKIPPED.
fn refresh_tasks(execution: &mut Execution) {
    let snapshot: HashMap<String, (TaskStatus, bool)> = execution
        .tasks
        .iter()
        .map(|t| (t.task_id.clone(), (t.status, t.skippable)))
        .collect();

    for task in &mut execution.tasks {
        if task.status != TaskStatus::Pending {
            continue;
        }

        let mut poisoned = false;
        let mut satisfied = true;
        for dep in &task.depends_on {
            match snapshot.get(dep) {
                Some((TaskStatus::Completed, _)) => {},
                Some((TaskStatus::Skipped, true)) => {},
                Some((TaskStatus::Skipped, false)) => {
                    poisoned = true;
                    break;
                },
                Some(_) => satisfied = false,
                None => {
                    poisoned = true;
                    break;
                },
            }
        }

        if poisoned {
            task.status = TaskStatus::Failed;
            task.last_error = Some(UPSTREAM_SKIPPED.to_string());
        } else if satisfied {
            task.status = TaskStatus::Ready;
        }
    }
}

fn next_ready_task(execution: &Execution) -> Option<String> {
    execution
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .map(|t| t.task_id.clone())
        .min()
}

fn derive_state(execution: &Execution) -> ExecutionState {
    let tasks = &execution.tasks;
    if tasks.iter().all(|t| t.status.is_terminal()) {
        return ExecutionState::Completed;
    }
    if tasks
        .iter()
        .any(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::Running))
    {
        return ExecutionState::Running;
    }
    if tasks.iter().any(|t| t.status == TaskStatus::Blocked) {
        return ExecutionState::Blocked;
    }
    // Only pending/failed remain with nothing runnable.
    ExecutionState::Failed
}

fn finalize_cancelled(execution: &mut Execution) {
    for task in &mut execution.tasks {
        if !task.status.is_terminal() {
            task.status = TaskStatus::Failed;
            task.last_error = Some(CANCELLED.to_string());
        }
    }
    execution.state = ExecutionState::Cancelled;
}

fn build_context(execution: &Execution, cancel: &CancelFlag) -> TaskContext {
    let mut outputs = serde_json::Map::new();
    for task in &execution.tasks {
        if task.status == TaskStatus::Completed
            && let Some(output) = &task.output
        {
            outputs.insert(task.task_id.clone(), output.clone());
        }
    }
    TaskContext {
        execution_id: execution.execution_id.clone(),
        question: execution.question.clone(),
        scene: execution.scene.clone(),
        loan_type: execution.loan_type.clone(),
        outputs,
        cancel: cancel.clone(),
    }
}
