//! End-to-end pipeline tests: question in, answer/clarification out, with
//! the correction loop and its observable side effects.

use serde_json::Value;

use super::common::harness;
use super::common::harness_with;
use crate::models::{AgentIntent, AnalysisRequest, QueryStatus, Scene};

fn request(question: &str, visualize: bool) -> AnalysisRequest {
    AnalysisRequest {
        question: question.to_string(),
        datasource_id: None,
        scene: Scene::Dashboard,
        llm_binding_id: None,
        agent_profile_id: None,
        visualize,
    }
}

#[tokio::test]
async fn happy_path_returns_rows_and_chart() {
    let h = harness().await;

    h.provider.push_reply(
        r#"{"intent": "answer", "should_visualize": true,
            "sql": "SELECT p.name, SUM(o.revenue) AS revenue FROM orders o JOIN products p ON o.product_id = p.id GROUP BY p.name ORDER BY revenue DESC LIMIT 5"}"#,
    );
    h.provider.push_reply(
        r#"{"chart_type": "bar", "spec": {"x": "name", "y": "revenue", "series": null},
            "insight": "Widgets dominate revenue."}"#,
    );
    h.engine.push_rows(
        &["name", "revenue"],
        (0..5)
            .map(|i| vec![Value::from(format!("product-{}", i)), Value::from(100.0 - i as f64)])
            .collect(),
    );

    let result = h
        .services
        .analysis
        .analyze(request("top 5 products by revenue last 30d", true))
        .await
        .expect("analysis");

    assert_eq!(result.intent, AgentIntent::Answer);
    assert_eq!(result.row_count, Some(5));
    assert_eq!(result.attempts, 1);
    assert!(result.errors.is_empty());

    let sql = result.sql.expect("sql");
    assert!(sql.contains("GROUP BY"));
    assert!(sql.contains("ORDER BY revenue DESC"));
    assert!(sql.contains("LIMIT 5"));

    let viz = result.visualization.expect("visualization");
    assert_eq!(viz.chart_type, "bar");
    assert_eq!(result.insight.as_deref(), Some("Widgets dominate revenue."));

    // Side effects: one history row, one memory event, two chat turns.
    let history = h
        .services
        .datasources
        .query_history(Some(&h.datasource_id), None, 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "success");
    assert!(!h.services.memory.is_empty());

    let chat = h
        .services
        .analysis
        .recent_chat(&Scene::Dashboard, 10)
        .await
        .expect("chat");
    assert_eq!(chat.len(), 2);
    assert_eq!(chat[0].0, "user");

    // Each agent invocation left an execution log record.
    let repo = h.services.runtime.repository();
    assert_eq!(repo.count_logs("sql_agent").await.expect("logs"), 1);
    assert_eq!(repo.count_logs("visualize_agent").await.expect("logs"), 1);
}

#[tokio::test]
async fn underspecified_question_returns_clarification() {
    let h = harness().await;

    h.provider.push_reply(
        r#"{"intent": "clarification", "clarification": {
            "question": "Which time window?",
            "options": ["today", "last 7 days", "last 30 days", "custom"]
        }}"#,
    );

    let result = h
        .services
        .analysis
        .analyze(request("show sales", false))
        .await
        .expect("analysis");

    assert_eq!(result.intent, AgentIntent::Clarification);
    assert!(result.sql.is_none());
    let clarification = result.clarification.expect("clarification");
    assert_eq!(clarification.question, "Which time window?");
    assert_eq!(
        clarification.options,
        vec!["today", "last 7 days", "last 30 days", "custom"]
    );

    // Nothing was executed.
    assert_eq!(h.engine.execute_count.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn correction_loop_recovers_from_bad_column() {
    let h = harness().await;

    h.provider
        .push_reply(r#"{"intent": "answer", "sql": "SELECT ordered_on FROM orders LIMIT 10"}"#);
    h.provider
        .push_reply(r#"{"intent": "answer", "sql": "SELECT ordered_at FROM orders LIMIT 10"}"#);

    h.engine.push_result(Err(crate::utils::EngineError::sql(
        "column \"ordered_on\" does not exist",
    )));
    h.engine.push_rows(&["ordered_at"], vec![vec![Value::from("2026-07-01 00:00:00")]]);

    let result = h
        .services
        .analysis
        .analyze(request("orders over time", false))
        .await
        .expect("analysis");

    assert_eq!(result.intent, AgentIntent::Answer);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("ordered_on"));
    assert_eq!(
        h.services.analysis.correction_log_count(&result.request_id).await,
        1
    );

    // Both executions are in the history: one error, one success.
    let failures = h
        .services
        .datasources
        .query_history(Some(&h.datasource_id), Some(QueryStatus::Error), 10)
        .await
        .expect("history");
    assert_eq!(failures.len(), 1);
}

#[tokio::test]
async fn exhausted_corrections_surface_the_error_trail() {
    let h = harness().await;

    for i in 0..4 {
        h.provider.push_reply(format!(
            r#"{{"intent": "answer", "sql": "SELECT broken_{} FROM orders"}}"#,
            i
        ));
        h.engine.push_result(Err(crate::utils::EngineError::sql(format!(
            "column \"broken_{}\" does not exist",
            i
        ))));
    }

    let result = h
        .services
        .analysis
        .analyze(request("hopeless question", false))
        .await
        .expect("analysis still returns the trail");

    assert_eq!(result.intent, AgentIntent::Error);
    assert_eq!(result.attempts, 4);
    assert_eq!(result.errors.len(), 4);
    assert!(result.sql.is_some());
    assert_eq!(
        h.services.analysis.correction_log_count(&result.request_id).await,
        3
    );
}

#[tokio::test]
async fn repeated_sql_is_a_fixed_point() {
    let h = harness().await;

    h.provider
        .push_reply(r#"{"intent": "answer", "sql": "SELECT broken FROM orders LIMIT 1"}"#);
    // The "correction" resubmits the same statement.
    h.provider
        .push_reply(r#"{"intent": "answer", "sql": "SELECT broken FROM orders LIMIT 1"}"#);
    h.engine
        .push_result(Err(crate::utils::EngineError::sql("column \"broken\" does not exist")));

    let result = h
        .services
        .analysis
        .analyze(request("stuck question", false))
        .await
        .expect("analysis");

    assert_eq!(result.intent, AgentIntent::Error);
    // The duplicate was never re-executed.
    assert_eq!(result.attempts, 1);
    assert_eq!(h.engine.execute_count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn generated_writes_are_rejected() {
    let h = harness().await;

    h.provider.push_reply(r#"{"intent": "answer", "sql": "DELETE FROM orders"}"#);

    let err = h
        .services
        .analysis
        .analyze(request("clean up the orders table", false))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "VALIDATION");
    assert_eq!(h.engine.execute_count.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_results_answer_without_visualization() {
    let h = harness().await;

    h.provider.push_reply(
        r#"{"intent": "answer", "should_visualize": true,
            "sql": "SELECT name, revenue FROM orders WHERE 1 = 0 LIMIT 10"}"#,
    );
    h.engine.push_rows(&["name", "revenue"], Vec::new());

    let result = h
        .services
        .analysis
        .analyze(request("revenue for a product that does not exist", true))
        .await
        .expect("analysis");

    assert_eq!(result.intent, AgentIntent::Answer);
    assert_eq!(result.row_count, Some(0));
    assert!(result.rows.as_ref().is_some_and(|rows| rows.is_empty()));
    assert!(result.visualization.is_none());
}

#[tokio::test]
async fn end_to_end_cap_yields_timeout() {
    let h = harness_with(|config| {
        config.analyze.end_to_end_timeout_ms = 80;
    })
    .await;

    h.provider
        .push_reply(r#"{"intent": "answer", "sql": "SELECT name FROM products LIMIT 1"}"#);
    h.engine.set_execute_delay(std::time::Duration::from_millis(400));
    h.engine.push_rows(&["name"], vec![vec![Value::from("widget")]]);

    let err = h
        .services
        .analysis
        .analyze(request("slow question", false))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "TIMEOUT");
}

#[tokio::test]
async fn profile_without_sql_tool_is_rejected() {
    let h = harness().await;

    let profile = h
        .services
        .runtime
        .repository()
        .upsert_profile(
            "read-only-chat",
            None,
            crate::services::llm::FeatureMask {
                sql_tool: false,
                rag_tool: false,
                rule_validation: true,
            },
        )
        .await
        .expect("profile");

    let mut req = request("anything", false);
    req.agent_profile_id = Some(profile.id);
    let err = h.services.analysis.analyze(req).await.unwrap_err();
    assert_eq!(err.kind(), "VALIDATION");
}
