//! Execution state machine tests: DAG ordering, skips, blocking,
//! retries, cancellation, and persistence.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::common::harness;
use crate::models::{
    ExecutionState, Plan, Scene, Task, TaskAction, TaskSpec, TaskStatus,
};
use crate::services::execution::{TaskAgent, TaskContext, TaskOutcome, CANCELLED, UPSTREAM_SKIPPED};
use crate::utils::{EngineError, EngineResult};

/// Scripted task agent: records run order, fails on demand.
struct RecordingAgent {
    order: Arc<Mutex<Vec<String>>>,
    failures: Mutex<HashMap<String, VecDeque<EngineError>>>,
}

impl RecordingAgent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            order: Arc::new(Mutex::new(Vec::new())),
            failures: Mutex::new(HashMap::new()),
        })
    }

    fn fail(&self, task_id: &str, error: EngineError) {
        self.failures
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push_back(error);
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskAgent for RecordingAgent {
    async fn run(&self, task: &Task, ctx: &TaskContext) -> EngineResult<TaskOutcome> {
        ctx.cancel.check("recording task")?;
        self.order.lock().unwrap().push(task.task_id.clone());
        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&task.task_id)
            .and_then(|q| q.pop_front())
        {
            return Err(error);
        }
        Ok(TaskOutcome::Completed(Value::String(format!("done:{}", task.task_id))))
    }
}

fn spec(id: &str, deps: &[&str], skippable: bool) -> TaskSpec {
    TaskSpec {
        task_id: id.to_string(),
        title: id.to_uppercase(),
        assigned_agent: "recording".to_string(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        skippable,
    }
}

fn plan(tasks: Vec<TaskSpec>, edges: Vec<(&str, &str)>) -> Plan {
    Plan {
        id: Uuid::new_v4().to_string(),
        question: "quarterly portfolio review".to_string(),
        scene: Scene::Dashboard,
        loan_type: None,
        tasks,
        edges: edges
            .into_iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect(),
        created_at: Utc::now(),
    }
}

fn diamond() -> Plan {
    plan(
        vec![
            spec("a", &[], false),
            spec("b", &["a"], false),
            spec("c", &["a"], false),
            spec("d", &["b", "c"], false),
        ],
        vec![("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
    )
}

#[tokio::test]
async fn diamond_dag_runs_in_topological_order() {
    let h = harness().await;
    let agent = RecordingAgent::new();
    h.services.executions.register_agent("recording", Arc::clone(&agent) as Arc<dyn TaskAgent>);

    let execution = h.services.executions.start(&diamond()).await.expect("start");
    assert_eq!(execution.state, ExecutionState::Running);

    // Only the root is ready at start.
    let ready: Vec<&str> = execution
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .map(|t| t.task_id.as_str())
        .collect();
    assert_eq!(ready, vec!["a"]);

    let finished = h
        .services
        .executions
        .run(&execution.execution_id, 10)
        .await
        .expect("run");

    assert_eq!(finished.state, ExecutionState::Completed);
    // Lexicographically smallest ready task first: a, then b before c,
    // then d once both parents finished.
    assert_eq!(agent.order(), vec!["a", "b", "c", "d"]);
    for task in &finished.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 1);
    }
}

#[tokio::test]
async fn cancel_mid_flight_fails_remaining_tasks() {
    let h = harness().await;
    let agent = RecordingAgent::new();
    h.services.executions.register_agent("recording", Arc::clone(&agent) as Arc<dyn TaskAgent>);

    let execution = h.services.executions.start(&diamond()).await.expect("start");

    // a then b complete.
    h.services.executions.tick(&execution.execution_id).await.expect("tick a");
    h.services.executions.tick(&execution.execution_id).await.expect("tick b");

    let cancelled = h.services.executions.cancel(&execution.execution_id).await.expect("cancel");
    assert_eq!(cancelled.state, ExecutionState::Cancelled);

    let status_of = |id: &str| cancelled.tasks.iter().find(|t| t.task_id == id).unwrap().status;
    assert_eq!(status_of("a"), TaskStatus::Completed);
    assert_eq!(status_of("b"), TaskStatus::Completed);
    assert_eq!(status_of("c"), TaskStatus::Failed);
    assert_eq!(status_of("d"), TaskStatus::Failed);
    for id in ["c", "d"] {
        let task = cancelled.tasks.iter().find(|t| t.task_id == id).unwrap();
        assert_eq!(task.last_error.as_deref(), Some(CANCELLED));
    }

    // Subsequent ticks are no-ops (cancel is absorbing).
    let after = h.services.executions.tick(&execution.execution_id).await.expect("tick");
    assert_eq!(after.state, ExecutionState::Cancelled);
    assert_eq!(after.cursor_index, cancelled.cursor_index);
    assert_eq!(agent.order(), vec!["a", "b"]);
}

#[tokio::test]
async fn skipping_a_non_skippable_dependency_poisons_dependents() {
    let h = harness().await;
    let agent = RecordingAgent::new();
    h.services.executions.register_agent("recording", Arc::clone(&agent) as Arc<dyn TaskAgent>);

    let execution = h
        .services
        .executions
        .start(&plan(
            vec![spec("extract", &[], false), spec("report", &["extract"], false)],
            vec![("extract", "report")],
        ))
        .await
        .expect("start");

    let after = h
        .services
        .executions
        .task_action(&execution.execution_id, "extract", TaskAction::Skip, None)
        .await
        .expect("skip");

    let report = after.tasks.iter().find(|t| t.task_id == "report").unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.last_error.as_deref(), Some(UPSTREAM_SKIPPED));
    assert_eq!(after.state, ExecutionState::Failed);
}

#[tokio::test]
async fn skipping_a_skippable_dependency_unblocks_dependents() {
    let h = harness().await;
    let agent = RecordingAgent::new();
    h.services.executions.register_agent("recording", Arc::clone(&agent) as Arc<dyn TaskAgent>);

    let execution = h
        .services
        .executions
        .start(&plan(
            vec![spec("extract", &[], true), spec("report", &["extract"], false)],
            vec![("extract", "report")],
        ))
        .await
        .expect("start");

    h.services
        .executions
        .task_action(&execution.execution_id, "extract", TaskAction::Skip, None)
        .await
        .expect("skip");

    let finished = h
        .services
        .executions
        .run(&execution.execution_id, 5)
        .await
        .expect("run");
    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(agent.order(), vec!["report"]);
}

#[tokio::test]
async fn approval_tasks_block_until_operator_completes() {
    let h = harness().await;

    let execution = h
        .services
        .executions
        .start(&plan(
            vec![TaskSpec {
                task_id: "approve".to_string(),
                title: "Strategy approval".to_string(),
                assigned_agent: "approval".to_string(),
                depends_on: Vec::new(),
                skippable: false,
            }],
            Vec::new(),
        ))
        .await
        .expect("start");

    let blocked = h.services.executions.run(&execution.execution_id, 5).await.expect("run");
    assert_eq!(blocked.state, ExecutionState::Blocked);
    assert_eq!(blocked.tasks[0].status, TaskStatus::Blocked);

    let completed = h
        .services
        .executions
        .task_action(
            &execution.execution_id,
            "approve",
            TaskAction::Complete,
            Some(Value::String("approved by ops".to_string())),
        )
        .await
        .expect("complete");
    assert_eq!(completed.state, ExecutionState::Completed);

    // Completing again is an idempotent no-op.
    let again = h
        .services
        .executions
        .task_action(&execution.execution_id, "approve", TaskAction::Complete, None)
        .await
        .expect("idempotent complete");
    assert_eq!(
        again.tasks[0].output,
        Some(Value::String("approved by ops".to_string()))
    );
}

#[tokio::test]
async fn transient_failures_retry_up_to_the_attempt_cap() {
    let h = harness().await;
    let agent = RecordingAgent::new();
    agent.fail("only", EngineError::db_transient("flaky"));
    agent.fail("only", EngineError::db_transient("flaky again"));
    h.services.executions.register_agent("recording", Arc::clone(&agent) as Arc<dyn TaskAgent>);

    let execution = h
        .services
        .executions
        .start(&plan(vec![spec("only", &[], false)], Vec::new()))
        .await
        .expect("start");

    let finished = h
        .services
        .executions
        .run(&execution.execution_id, 10)
        .await
        .expect("run");

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(finished.tasks[0].attempts, 3);
    assert_eq!(agent.order(), vec!["only", "only", "only"]);
}

#[tokio::test]
async fn non_retryable_failure_is_terminal_for_the_execution() {
    let h = harness().await;
    let agent = RecordingAgent::new();
    agent.fail("only", EngineError::sql("no such table"));
    h.services.executions.register_agent("recording", Arc::clone(&agent) as Arc<dyn TaskAgent>);

    let execution = h
        .services
        .executions
        .start(&plan(vec![spec("only", &[], false)], Vec::new()))
        .await
        .expect("start");

    let finished = h
        .services
        .executions
        .run(&execution.execution_id, 10)
        .await
        .expect("run");
    assert_eq!(finished.state, ExecutionState::Failed);
    assert_eq!(finished.tasks[0].status, TaskStatus::Failed);

    // Terminal executions reject further operator actions.
    let err = h
        .services
        .executions
        .task_action(&execution.execution_id, "only", TaskAction::Retry, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "CONFLICT");
}

#[tokio::test]
async fn executions_reload_from_the_store() {
    let h = harness().await;
    let agent = RecordingAgent::new();
    h.services.executions.register_agent("recording", Arc::clone(&agent) as Arc<dyn TaskAgent>);

    let execution = h.services.executions.start(&diamond()).await.expect("start");
    let finished = h
        .services
        .executions
        .run(&execution.execution_id, 10)
        .await
        .expect("run");
    assert_eq!(finished.state, ExecutionState::Completed);

    // A fresh service over the same store sees the persisted snapshot.
    let fresh = crate::services::ExecutionService::new(
        h.services.db.clone(),
        crate::config::ExecutionConfig::default(),
    );
    let reloaded = fresh.get(&execution.execution_id).await.expect("reload");
    assert_eq!(reloaded.state, ExecutionState::Completed);
    assert_eq!(reloaded.tasks.len(), 4);
    assert!(reloaded.tasks.iter().all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test]
async fn plan_built_by_the_planner_executes_end_to_end() {
    let h = harness().await;

    // The loan review chain: schema -> analysis -> insight -> approval.
    h.provider
        .push_reply(r#"{"intent": "answer", "sql": "SELECT COUNT(*) AS overdue FROM orders LIMIT 1"}"#);
    h.engine.push_rows(&["overdue"], vec![vec![Value::from(12)]]);
    h.provider.push_reply("Overdue balances are concentrated in one branch.");

    let plan = h
        .services
        .planner
        .build_plan("overdue loan portfolio breakdown", &Scene::LoanOps, None)
        .await
        .expect("plan");

    let execution = h.services.executions.start(&plan).await.expect("start");
    let paused = h
        .services
        .executions
        .run(&execution.execution_id, 10)
        .await
        .expect("run");

    // Everything runs up to the human approval gate.
    assert_eq!(paused.state, ExecutionState::Blocked);
    let status_of =
        |id: &str| paused.tasks.iter().find(|t| t.task_id == id).unwrap().status;
    assert_eq!(status_of("schema"), TaskStatus::Completed);
    assert_eq!(status_of("analyze"), TaskStatus::Completed);
    assert_eq!(status_of("insight"), TaskStatus::Completed);
    assert_eq!(status_of("approval"), TaskStatus::Blocked);

    let done = h
        .services
        .executions
        .task_action(&execution.execution_id, "approval", TaskAction::Complete, None)
        .await
        .expect("approve");
    assert_eq!(done.state, ExecutionState::Completed);
}
