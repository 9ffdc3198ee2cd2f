//! Monitoring entities: metric rules, alerts, and attribution config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utils::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl RuleOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            "==" => Ok(Self::Eq),
            other => Err(EngineError::validation(format!("unknown operator: {}", other))),
        }
    }

    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Low,
    Medium,
    High,
}

impl RuleSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Data,
    Market,
}

impl RuleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Market => "market",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "market" => Self::Market,
            _ => Self::Data,
        }
    }
}

/// Threshold rule evaluated every monitoring pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRule {
    pub id: String,
    pub name: String,
    pub metric_key: String,
    pub operator: RuleOperator,
    pub threshold: f64,
    pub severity: RuleSeverity,
    pub scope: RuleScope,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Triggered,
    Notified,
    Acknowledged,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Notified => "notified",
            Self::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "notified" => Self::Notified,
            "acknowledged" => Self::Acknowledged,
            _ => Self::Triggered,
        }
    }

    /// Lifecycle is strictly forward: triggered -> notified -> acknowledged.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (Self::Triggered, Self::Notified) | (Self::Notified, Self::Acknowledged)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub summary: String,
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub channel: String,
    pub result: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub metric_key: String,
    pub current_value: f64,
    pub operator: RuleOperator,
    pub threshold: f64,
    pub triggered_at: DateTime<Utc>,
    pub status: AlertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationRecord>,
}

/// Attribution template for one metric key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRule {
    pub metric_key: String,
    #[serde(default)]
    pub possible_causes: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisConfig {
    #[serde(default)]
    pub attribution_rules: Vec<AttributionRule>,
    #[serde(default)]
    pub default_actions: Vec<String>,
}

impl DiagnosisConfig {
    pub fn rule_for(&self, metric_key: &str) -> Option<&AttributionRule> {
        self.attribution_rules.iter().find(|r| r.metric_key == metric_key)
    }
}

/// One atomic observation of every known metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub ts: DateTime<Utc>,
    pub values: HashMap<String, f64>,
}

/// Notification channel settings (echoed by the config API; transport is
/// an external capability).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default)]
    pub smtp_port: u16,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_evaluation() {
        assert!(RuleOperator::Gt.evaluate(0.035, 0.03));
        assert!(!RuleOperator::Gt.evaluate(0.03, 0.03));
        assert!(RuleOperator::Ge.evaluate(0.03, 0.03));
        assert!(RuleOperator::Lt.evaluate(1.0, 2.0));
        assert!(RuleOperator::Eq.evaluate(5.0, 5.0));
        assert_eq!(RuleOperator::parse(">=").unwrap(), RuleOperator::Ge);
    }

    #[test]
    fn alert_status_never_moves_backwards() {
        assert!(AlertStatus::Triggered.can_transition_to(AlertStatus::Notified));
        assert!(AlertStatus::Notified.can_transition_to(AlertStatus::Acknowledged));
        assert!(!AlertStatus::Acknowledged.can_transition_to(AlertStatus::Triggered));
        assert!(!AlertStatus::Notified.can_transition_to(AlertStatus::Triggered));
        assert!(!AlertStatus::Triggered.can_transition_to(AlertStatus::Acknowledged));
    }
}
