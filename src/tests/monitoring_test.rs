//! Monitoring loop tests: rule evaluation, suppression, diagnosis,
//! notification retries, and the alert lifecycle.

use serde_json::Value;

use super::common::{harness, Harness};
use crate::models::{
    AlertStatus, AttributionRule, DiagnosisConfig, EmailSettings, MetricRule, QueryStatus,
    RuleOperator, RuleScope, RuleSeverity,
};

fn overdue_rule() -> MetricRule {
    MetricRule {
        id: String::new(),
        name: "overdue rate breach".to_string(),
        metric_key: "bl_overdue_rate".to_string(),
        operator: RuleOperator::Gt,
        threshold: 0.03,
        severity: RuleSeverity::High,
        scope: RuleScope::Data,
        enabled: true,
    }
}

async fn install_overdue_rule(h: &Harness) -> MetricRule {
    let rules = h
        .services
        .monitoring
        .put_rules(vec![overdue_rule()])
        .await
        .expect("put rules");
    h.services
        .monitoring
        .put_metric_query("bl_overdue_rate", &h.datasource_id, "SELECT overdue_rate")
        .await
        .expect("metric query");
    rules.into_iter().next().expect("one rule")
}

fn push_metric_value(h: &Harness, value: f64) {
    h.engine.push_rows(&["overdue_rate"], vec![vec![Value::from(value)]]);
}

#[tokio::test]
async fn alert_lifecycle_with_suppression() {
    let h = harness().await;
    install_overdue_rule(&h).await;

    // Breach fires exactly one alert and notifies it.
    push_metric_value(&h, 0.035);
    let alerts = h.services.monitoring.check().await.expect("check");
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.status, AlertStatus::Notified);
    assert!((alert.current_value - 0.035).abs() < f64::EPSILON);
    assert_eq!(h.notifier.sent_count(), 1);

    // Sustained breach inside the suppression window stays silent.
    push_metric_value(&h, 0.036);
    let second = h.services.monitoring.check().await.expect("check");
    assert!(second.is_empty());
    assert_eq!(h.notifier.sent_count(), 1);

    // Acknowledge closes the lifecycle; the next breach may fire again.
    let acked = h.services.monitoring.ack(&alert.id).await.expect("ack");
    assert_eq!(acked.status, AlertStatus::Acknowledged);

    push_metric_value(&h, 0.04);
    let third = h.services.monitoring.check().await.expect("check");
    assert_eq!(third.len(), 1);

    // Lifecycle never moves backwards.
    let err = h.services.monitoring.ack(&alert.id).await.unwrap_err();
    assert_eq!(err.kind(), "CONFLICT");
}

#[tokio::test]
async fn below_threshold_values_do_not_fire() {
    let h = harness().await;
    install_overdue_rule(&h).await;

    push_metric_value(&h, 0.02);
    let alerts = h.services.monitoring.check().await.expect("check");
    assert!(alerts.is_empty());
    assert_eq!(h.notifier.sent_count(), 0);
}

#[tokio::test]
async fn diagnosis_substitutes_the_observation() {
    let h = harness().await;
    install_overdue_rule(&h).await;

    h.services
        .monitoring
        .put_diagnosis_config(DiagnosisConfig {
            attribution_rules: vec![AttributionRule {
                metric_key: "bl_overdue_rate".to_string(),
                possible_causes: vec!["{metric} climbed to {value}".to_string()],
                suggested_actions: vec!["review accounts above {threshold}".to_string()],
            }],
            default_actions: vec!["escalate to the data team".to_string()],
        })
        .await
        .expect("diagnosis config");

    push_metric_value(&h, 0.035);
    let alerts = h.services.monitoring.check().await.expect("check");
    let diagnosis = alerts[0].diagnosis.as_ref().expect("diagnosis");

    assert!(diagnosis.summary.contains("bl_overdue_rate"));
    assert!(diagnosis
        .key_points
        .contains(&"bl_overdue_rate climbed to 0.035".to_string()));
    assert!(diagnosis
        .key_points
        .contains(&"review accounts above 0.03".to_string()));
}

#[tokio::test]
async fn notification_failures_keep_the_alert_and_resend_recovers() {
    let h = harness().await;
    install_overdue_rule(&h).await;

    // Every delivery attempt fails; the alert still exists, marked with
    // the failed delivery.
    h.notifier.fail_next(3);
    push_metric_value(&h, 0.05);
    let alerts = h.services.monitoring.check().await.expect("check");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].status, AlertStatus::Triggered);
    let record = alerts[0].notification.as_ref().expect("notification record");
    assert!(record.result.contains("delivery failed"));

    // Operator resend succeeds and advances the lifecycle.
    let resent = h.services.monitoring.resend(&alerts[0].id).await.expect("resend");
    assert_eq!(resent.status, AlertStatus::Notified);
    assert_eq!(h.notifier.sent_count(), 1);
}

#[tokio::test]
async fn transient_notification_failure_is_retried_within_the_pass() {
    let h = harness().await;
    install_overdue_rule(&h).await;

    h.notifier.fail_next(1);
    push_metric_value(&h, 0.05);
    let alerts = h.services.monitoring.check().await.expect("check");
    assert_eq!(alerts[0].status, AlertStatus::Notified);
    assert_eq!(h.notifier.sent_count(), 1);
}

#[tokio::test]
async fn builtin_kpis_feed_rules() {
    let h = harness().await;

    h.services
        .monitoring
        .put_rules(vec![MetricRule {
            id: String::new(),
            name: "query error rate".to_string(),
            metric_key: "query_error_rate".to_string(),
            operator: RuleOperator::Gt,
            threshold: 0.4,
            severity: RuleSeverity::Medium,
            scope: RuleScope::Data,
            enabled: true,
        }])
        .await
        .expect("put rules");

    // Half of the recent statements failed.
    for i in 0..2 {
        h.services
            .datasources
            .record_query(&h.datasource_id, &format!("SELECT {}", i), 5, 1, QueryStatus::Success, None)
            .await;
        h.services
            .datasources
            .record_query(
                &h.datasource_id,
                &format!("SELECT broken_{}", i),
                5,
                0,
                QueryStatus::Error,
                Some("boom"),
            )
            .await;
    }

    let snapshot = h.services.monitoring.snapshot().await.expect("snapshot");
    assert!((snapshot.values["query_error_rate"] - 0.5).abs() < f64::EPSILON);
    assert!(snapshot.values.contains_key("pool_occupancy"));

    let alerts = h.services.monitoring.check().await.expect("check");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].metric_key, "query_error_rate");
}

#[tokio::test]
async fn config_endpoints_round_trip() {
    let h = harness().await;

    let rules = h
        .services
        .monitoring
        .put_rules(vec![overdue_rule()])
        .await
        .expect("put rules");
    let fetched = h.services.monitoring.get_rules().await.expect("get rules");
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, rules[0].id);
    assert_eq!(fetched[0].metric_key, "bl_overdue_rate");

    let email = EmailSettings {
        enabled: true,
        smtp_host: "mail.internal".to_string(),
        smtp_port: 587,
        from: "chatbi@internal".to_string(),
        to: vec!["ops@internal".to_string()],
    };
    let echoed = h.services.monitoring.put_email_config(email.clone()).await.expect("put email");
    assert_eq!(echoed, email);
    assert_eq!(h.services.monitoring.get_email_config().await.expect("get email"), email);

    let diagnosis = DiagnosisConfig {
        attribution_rules: vec![AttributionRule {
            metric_key: "pool_occupancy".to_string(),
            possible_causes: vec!["connection leak".to_string()],
            suggested_actions: vec!["inspect long-running queries".to_string()],
        }],
        default_actions: vec!["page the on-call".to_string()],
    };
    let echoed = h
        .services
        .monitoring
        .put_diagnosis_config(diagnosis.clone())
        .await
        .expect("put diagnosis");
    assert_eq!(echoed, diagnosis);
}
