//! Analysis request/result shapes for the NL-to-answer pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::message::AgentIntent;
use super::query::ColumnMeta;

/// Operating context a request runs under. Known scenes get defaults; the
/// set is open so new scenes don't require a code change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scene {
    Dashboard,
    DataDiscuss,
    LoanOps,
    Custom(String),
}

impl Scene {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Dashboard => "dashboard",
            Self::DataDiscuss => "data_discuss",
            Self::LoanOps => "loan_ops",
            Self::Custom(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "dashboard" => Self::Dashboard,
            "data_discuss" => Self::DataDiscuss,
            "loan_ops" => Self::LoanOps,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Scenes where generated SQL must be read-only.
    pub fn read_only(&self) -> bool {
        // Every shipped scene is analytic; writes would need a new scene
        // that opts out explicitly.
        true
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::Dashboard
    }
}

impl std::fmt::Display for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Scene {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Scene {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Scene::parse(&s))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AnalysisRequest {
    #[validate(length(min = 1, max = 4096))]
    pub question: String,
    /// Falls back to the default datasource when absent.
    #[serde(default)]
    pub datasource_id: Option<String>,
    #[serde(default)]
    pub scene: Scene,
    #[serde(default)]
    pub llm_binding_id: Option<String>,
    #[serde(default)]
    pub agent_profile_id: Option<String>,
    #[serde(default)]
    pub visualize: bool,
}

/// Follow-up the engine asks when the question is under-specified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionAttempt {
    pub attempt: u32,
    pub sql: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visualization {
    pub chart_type: String,
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    /// Correlation id carried through logs and event rows.
    pub request_id: String,
    pub intent: AgentIntent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnMeta>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    pub truncated: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<Visualization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
    pub attempts: u32,
    pub errors: Vec<String>,
}

impl AnalysisResult {
    pub fn clarification(request_id: String, clarification: Clarification) -> Self {
        Self {
            request_id,
            intent: AgentIntent::Clarification,
            sql: None,
            columns: None,
            rows: None,
            row_count: None,
            truncated: false,
            duration_ms: 0,
            insight: None,
            visualization: None,
            clarification: Some(clarification),
            attempts: 0,
            errors: Vec::new(),
        }
    }
}
