//! Monitoring and diagnosis control loop: snapshot -> evaluate ->
//! deduplicate -> diagnose -> notify -> persist.
//!
//! One logical evaluation pass runs at a time; the snapshot a pass
//! observes is taken atomically at its start. Alert suppression is keyed
//! by `(rule_id, metric_key)`.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::MonitoringConfig;
use crate::models::{
    Alert, AlertStatus, Diagnosis, DiagnosisConfig, EmailSettings, MetricRule, MetricSnapshot,
    NotificationRecord, QueryOptions, RuleOperator, RuleScope, RuleSeverity, Scene,
};
use crate::services::datasource::DatasourceService;
use crate::services::memory::MemoryStore;
use crate::services::notifier::{NotificationMessage, Notifier};
use crate::services::pool::PoolManager;
use crate::utils::backoff::task_retry_backoff;
use crate::utils::scheduled_executor::ScheduledTask;
use crate::utils::{EngineError, EngineResult};

pub struct MonitoringService {
    db: SqlitePool,
    config: MonitoringConfig,
    datasources: Arc<DatasourceService>,
    pool_manager: Arc<PoolManager>,
    notifier: Arc<dyn Notifier>,
    memory: Arc<MemoryStore>,
    /// One evaluation pass at a time.
    pass_gate: Mutex<()>,
}

impl MonitoringService {
    pub fn new(
        db: SqlitePool,
        config: MonitoringConfig,
        datasources: Arc<DatasourceService>,
        pool_manager: Arc<PoolManager>,
        notifier: Arc<dyn Notifier>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self { db, config, datasources, pool_manager, notifier, memory, pass_gate: Mutex::new(()) }
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Current value of every known metric: built-in engine KPIs plus the
    /// operator-defined metric queries.
    pub async fn snapshot(&self) -> EngineResult<MetricSnapshot> {
        let mut values: HashMap<String, f64> = HashMap::new();

        let (total, error_rate, avg_duration) = self.datasources.history_kpis(15).await?;
        values.insert("query_total_15m".to_string(), total);
        values.insert("query_error_rate".to_string(), error_rate);
        values.insert("query_avg_duration_ms".to_string(), avg_duration);
        values.insert("pool_occupancy".to_string(), self.pool_manager.occupancy());

        let metric_queries: Vec<(String, String, String)> =
            sqlx::query_as("SELECT metric_key, datasource_id, sql FROM metric_queries")
                .fetch_all(&self.db)
                .await?;

        for (metric_key, datasource_id, sql) in metric_queries {
            match self.evaluate_metric_query(&datasource_id, &sql).await {
                Ok(value) => {
                    values.insert(metric_key, value);
                },
                Err(e) => {
                    // A broken metric query must not sink the whole pass.
                    tracing::warn!("metric query '{}' failed: {}", metric_key, e);
                },
            }
        }

        Ok(MetricSnapshot { ts: Utc::now(), values })
    }

    async fn evaluate_metric_query(&self, datasource_id: &str, sql: &str) -> EngineResult<f64> {
        let options = QueryOptions { timeout_ms: 15_000, max_rows: 1 };
        let result = self.datasources.execute_query(datasource_id, sql, &options).await?;
        let cell = result
            .rows
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| EngineError::validation("metric query returned no rows"))?;

        match cell {
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| EngineError::validation("metric value is not a finite number")),
            serde_json::Value::String(s) => s
                .parse::<f64>()
                .map_err(|_| EngineError::validation("metric value is not numeric")),
            other => Err(EngineError::validation(format!(
                "metric query returned non-numeric cell: {}",
                other
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Check pass
    // ------------------------------------------------------------------

    /// One full control-loop pass. Returns the alerts created this pass.
    pub async fn check(&self) -> EngineResult<Vec<Alert>> {
        let _pass = self.pass_gate.lock().await;

        let snapshot = self.snapshot().await?;
        let rules: Vec<MetricRule> =
            self.get_rules().await?.into_iter().filter(|r| r.enabled).collect();
        let diagnosis_config = self.get_diagnosis_config().await?;
        let email = self.get_email_config().await?;

        let mut created = Vec::new();
        for rule in rules {
            let Some(value) = snapshot.values.get(&rule.metric_key).copied() else {
                tracing::debug!("no snapshot value for metric '{}'", rule.metric_key);
                continue;
            };
            if !rule.operator.evaluate(value, rule.threshold) {
                continue;
            }
            if self.is_suppressed(&rule).await? {
                tracing::debug!(
                    "rule '{}' firing but suppressed (open alert within window)",
                    rule.name
                );
                continue;
            }

            let diagnosis = diagnose(&rule, value, &diagnosis_config);
            let mut alert = Alert {
                id: Uuid::new_v4().to_string(),
                rule_id: rule.id.clone(),
                metric_key: rule.metric_key.clone(),
                current_value: value,
                operator: rule.operator,
                threshold: rule.threshold,
                triggered_at: snapshot.ts,
                status: AlertStatus::Triggered,
                diagnosis: Some(diagnosis),
                notification: None,
            };
            self.insert_alert(&alert).await?;
            tracing::info!(
                "Alert {} triggered: {} = {} {} {}",
                alert.id,
                alert.metric_key,
                value,
                alert.operator.as_str(),
                alert.threshold
            );

            self.dispatch(&mut alert, &rule, &email).await;
            self.record_metric_memory(&rule, value).await;
            created.push(alert);
        }

        Ok(created)
    }

    /// Suppression: an unacknowledged alert for the same `(rule_id,
    /// metric_key)` younger than the window silences the rule.
    async fn is_suppressed(&self, rule: &MetricRule) -> EngineResult<bool> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.config.suppression_ms as i64);
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM alerts
               WHERE rule_id = ? AND metric_key = ? AND status != 'acknowledged'
                 AND triggered_at >= ?"#,
        )
        .bind(&rule.id)
        .bind(&rule.metric_key)
        .bind(cutoff)
        .fetch_one(&self.db)
        .await?;
        Ok(count > 0)
    }

    /// Notify with bounded retries. Failures never roll the alert back;
    /// the outcome is recorded either way.
    async fn dispatch(&self, alert: &mut Alert, rule: &MetricRule, email: &EmailSettings) {
        let message = NotificationMessage {
            to: email.to.clone(),
            subject: format!(
                "[{}] {}: {} {} {}",
                rule.severity.as_str().to_uppercase(),
                rule.name,
                alert.current_value,
                alert.operator.as_str(),
                alert.threshold
            ),
            body: alert
                .diagnosis
                .as_ref()
                .map(|d| format!("{}\n- {}", d.summary, d.key_points.join("\n- ")))
                .unwrap_or_else(|| "no diagnosis available".to_string()),
        };

        let mut last_error = None;
        for attempt in 0..self.config.notify_max_attempts {
            match self.notifier.send(&message).await {
                Ok(receipt) => {
                    alert.status = AlertStatus::Notified;
                    alert.notification = Some(NotificationRecord {
                        channel: self.notifier.channel().to_string(),
                        result: receipt.provider_response,
                        ts: Utc::now(),
                    });
                    self.update_alert(alert).await;
                    return;
                },
                Err(e) => {
                    tracing::warn!(
                        "notification attempt {} for alert {} failed: {}",
                        attempt + 1,
                        alert.id,
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.config.notify_max_attempts {
                        tokio::time::sleep(task_retry_backoff(attempt)).await;
                    }
                },
            }
        }

        alert.notification = Some(NotificationRecord {
            channel: self.notifier.channel().to_string(),
            result: format!(
                "delivery failed: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
            ts: Utc::now(),
        });
        self.update_alert(alert).await;
    }

    async fn record_metric_memory(&self, rule: &MetricRule, value: f64) {
        let outcome = self
            .memory
            .append(
                crate::models::MemoryEventType::MetricAction,
                Scene::Dashboard,
                None,
                Some(format!(
                    "alert: {} = {} (threshold {} {})",
                    rule.metric_key,
                    value,
                    rule.operator.as_str(),
                    rule.threshold
                )),
                None,
            )
            .await;
        if let Err(e) = outcome {
            tracing::warn!("failed to record metric memory event: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------

    pub async fn ack(&self, alert_id: &str) -> EngineResult<Alert> {
        let mut alert = self.get_alert(alert_id).await?;
        if !alert.status.can_transition_to(AlertStatus::Acknowledged) {
            return Err(EngineError::conflict(format!(
                "alert in status '{}' cannot be acknowledged",
                alert.status.as_str()
            )));
        }
        alert.status = AlertStatus::Acknowledged;
        self.update_alert(&alert).await;
        Ok(alert)
    }

    /// Re-dispatch an alert whose delivery failed (or needs repeating).
    pub async fn resend(&self, alert_id: &str) -> EngineResult<Alert> {
        let mut alert = self.get_alert(alert_id).await?;
        if alert.status == AlertStatus::Acknowledged {
            return Err(EngineError::conflict("acknowledged alerts are not resent"));
        }
        let rules = self.get_rules().await?;
        let rule = rules
            .into_iter()
            .find(|r| r.id == alert.rule_id)
            .ok_or_else(|| EngineError::not_found(format!("rule '{}' not found", alert.rule_id)))?;
        let email = self.get_email_config().await?;
        self.dispatch(&mut alert, &rule, &email).await;
        Ok(alert)
    }

    pub async fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        limit: i64,
    ) -> EngineResult<Vec<Alert>> {
        let rows: Vec<AlertRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM alerts WHERE status = ? ORDER BY triggered_at DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit.clamp(1, 500))
                .fetch_all(&self.db)
                .await?
            },
            None => {
                sqlx::query_as("SELECT * FROM alerts ORDER BY triggered_at DESC LIMIT ?")
                    .bind(limit.clamp(1, 500))
                    .fetch_all(&self.db)
                    .await?
            },
        };
        rows.into_iter().map(AlertRow::into_alert).collect()
    }

    pub async fn get_alert(&self, alert_id: &str) -> EngineResult<Alert> {
        let row: Option<AlertRow> = sqlx::query_as("SELECT * FROM alerts WHERE id = ?")
            .bind(alert_id)
            .fetch_optional(&self.db)
            .await?;
        row.ok_or_else(|| EngineError::not_found(format!("alert '{}' not found", alert_id)))?
            .into_alert()
    }

    /// Prune acknowledged alerts older than the retention horizon.
    pub async fn prune_alerts(&self, older_than_days: i64) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM alerts
               WHERE status = 'acknowledged'
                 AND datetime(triggered_at) < datetime('now', '-' || ? || ' days')"#,
        )
        .bind(older_than_days)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Configuration (rules / diagnosis / email)
    // ------------------------------------------------------------------

    pub async fn get_rules(&self) -> EngineResult<Vec<MetricRule>> {
        let rows: Vec<(String, String, String, String, f64, String, String, bool)> =
            sqlx::query_as(
                r#"SELECT id, name, metric_key, operator, threshold, severity, scope, enabled
                   FROM metric_rules ORDER BY name"#,
            )
            .fetch_all(&self.db)
            .await?;

        rows.into_iter()
            .map(|(id, name, metric_key, operator, threshold, severity, scope, enabled)| {
                Ok(MetricRule {
                    id,
                    name,
                    metric_key,
                    operator: RuleOperator::parse(&operator)?,
                    threshold,
                    severity: RuleSeverity::parse(&severity),
                    scope: RuleScope::parse(&scope),
                    enabled,
                })
            })
            .collect()
    }

    pub async fn put_rules(&self, rules: Vec<MetricRule>) -> EngineResult<Vec<MetricRule>> {
        for rule in &rules {
            if rule.metric_key.is_empty() {
                return Err(EngineError::validation(format!(
                    "rule '{}' has no metric_key",
                    rule.name
                )));
            }
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM metric_rules").execute(&mut *tx).await?;
        for rule in &rules {
            let id = if rule.id.is_empty() { Uuid::new_v4().to_string() } else { rule.id.clone() };
            sqlx::query(
                r#"INSERT INTO metric_rules
                   (id, name, metric_key, operator, threshold, severity, scope, enabled)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&id)
            .bind(&rule.name)
            .bind(&rule.metric_key)
            .bind(rule.operator.as_str())
            .bind(rule.threshold)
            .bind(rule.severity.as_str())
            .bind(rule.scope.as_str())
            .bind(rule.enabled)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_rules().await
    }

    pub async fn put_metric_query(
        &self,
        metric_key: &str,
        datasource_id: &str,
        sql: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO metric_queries (metric_key, datasource_id, sql, updated_at)
               VALUES (?, ?, ?, CURRENT_TIMESTAMP)
               ON CONFLICT(metric_key) DO UPDATE SET
               datasource_id = excluded.datasource_id,
               sql = excluded.sql,
               updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(metric_key)
        .bind(datasource_id)
        .bind(sql)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_diagnosis_config(&self) -> EngineResult<DiagnosisConfig> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT config_json FROM diagnosis_config WHERE id = 1")
                .fetch_optional(&self.db)
                .await?;
        match row {
            Some((json,)) => Ok(serde_json::from_str(&json)?),
            None => Ok(DiagnosisConfig::default()),
        }
    }

    pub async fn put_diagnosis_config(
        &self,
        config: DiagnosisConfig,
    ) -> EngineResult<DiagnosisConfig> {
        sqlx::query(
            r#"INSERT INTO diagnosis_config (id, config_json, updated_at)
               VALUES (1, ?, CURRENT_TIMESTAMP)
               ON CONFLICT(id) DO UPDATE SET
               config_json = excluded.config_json, updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(serde_json::to_string(&config)?)
        .execute(&self.db)
        .await?;
        self.get_diagnosis_config().await
    }

    pub async fn get_email_config(&self) -> EngineResult<EmailSettings> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT config_json FROM email_config WHERE id = 1")
                .fetch_optional(&self.db)
                .await?;
        match row {
            Some((json,)) => Ok(serde_json::from_str(&json)?),
            None => Ok(EmailSettings::default()),
        }
    }

    pub async fn put_email_config(&self, config: EmailSettings) -> EngineResult<EmailSettings> {
        sqlx::query(
            r#"INSERT INTO email_config (id, config_json, updated_at)
               VALUES (1, ?, CURRENT_TIMESTAMP)
               ON CONFLICT(id) DO UPDATE SET
               config_json = excluded.config_json, updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(serde_json::to_string(&config)?)
        .execute(&self.db)
        .await?;
        self.get_email_config().await
    }

    // ------------------------------------------------------------------
    // Alert rows
    // ------------------------------------------------------------------

    async fn insert_alert(&self, alert: &Alert) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO alerts
               (id, rule_id, metric_key, current_value, operator, threshold, triggered_at,
                status, diagnosis_json, notification_json)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&alert.id)
        .bind(&alert.rule_id)
        .bind(&alert.metric_key)
        .bind(alert.current_value)
        .bind(alert.operator.as_str())
        .bind(alert.threshold)
        .bind(alert.triggered_at)
        .bind(alert.status.as_str())
        .bind(alert.diagnosis.as_ref().map(serde_json::to_string).transpose()?)
        .bind(alert.notification.as_ref().map(serde_json::to_string).transpose()?)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_alert(&self, alert: &Alert) {
        let notification_json = match alert
            .notification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
        {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("failed to serialize notification record: {}", e);
                None
            },
        };

        let outcome = sqlx::query(
            "UPDATE alerts SET status = ?, notification_json = ? WHERE id = ?",
        )
        .bind(alert.status.as_str())
        .bind(notification_json)
        .bind(&alert.id)
        .execute(&self.db)
        .await;
        if let Err(e) = outcome {
            tracing::warn!("failed to update alert {}: {}", alert.id, e);
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    id: String,
    rule_id: String,
    metric_key: String,
    current_value: f64,
    operator: String,
    threshold: f64,
    triggered_at: DateTime<Utc>,
    status: String,
    diagnosis_json: Option<String>,
    notification_json: Option<String>,
}

impl AlertRow {
    fn into_alert(self) -> EngineResult<Alert> {
        Ok(Alert {
            id: self.id,
            rule_id: self.rule_id,
            metric_key: self.metric_key,
            current_value: self.current_value,
            operator: RuleOperator::parse(&self.operator)?,
            threshold: self.threshold,
            triggered_at: self.triggered_at,
            status: AlertStatus::parse(&self.status),
            diagnosis: self.diagnosis_json.as_deref().map(serde_json::from_str).transpose()?,
            notification: self
                .notification_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

/// Attribution: substitute the observation into the matching template, or
/// fall back to the default actions.
fn diagnose(rule: &MetricRule, value: f64, config: &DiagnosisConfig) -> Diagnosis {
    let summary = format!(
        "{} is {} (threshold {} {})",
        rule.metric_key,
        value,
        rule.operator.as_str(),
        rule.threshold
    );

    let substitute = |template: &str| -> String {
        template
            .replace("{metric}", &rule.metric_key)
            .replace("{value}", &value.to_string())
            .replace("{threshold}", &rule.threshold.to_string())
    };

    let key_points = match config.rule_for(&rule.metric_key) {
        Some(attribution) => {
            let mut points: Vec<String> =
                attribution.possible_causes.iter().map(|c| substitute(c)).collect();
            points.extend(attribution.suggested_actions.iter().map(|a| substitute(a)));
            points
        },
        None => config.default_actions.iter().map(|a| substitute(a)).collect(),
    };

    Diagnosis { summary, key_points }
}

impl ScheduledTask for MonitoringService {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            let alerts = self.check().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
            if !alerts.is_empty() {
                tracing::info!("monitoring pass created {} alert(s)", alerts.len());
            }
            Ok(())
        })
    }
}
