//! LLM configuration entities: bindings, agent profiles, execution logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::Scene;

/// One reachable chat-completion endpoint plus its sampling defaults.
/// A binding may be pinned to a scene; one binding may be the default.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LlmBinding {
    pub id: String,
    pub name: String,
    pub api_base: String,
    pub model_name: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f64,
    pub max_tokens: i64,
    pub timeout_seconds: i64,
    pub scene: Option<String>,
    pub is_default: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Binding info for display, API key masked.
#[derive(Debug, Clone, Serialize)]
pub struct LlmBindingInfo {
    pub id: String,
    pub name: String,
    pub api_base: String,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_masked: Option<String>,
    pub temperature: f64,
    pub max_tokens: i64,
    pub timeout_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
    pub is_default: bool,
    pub enabled: bool,
}

impl From<&LlmBinding> for LlmBindingInfo {
    fn from(b: &LlmBinding) -> Self {
        let api_key_masked = b.api_key.as_ref().map(|key| {
            if key.len() > 8 {
                format!("{}...{}", &key[..4], &key[key.len() - 4..])
            } else {
                "****".to_string()
            }
        });

        Self {
            id: b.id.clone(),
            name: b.name.clone(),
            api_base: b.api_base.clone(),
            model_name: b.model_name.clone(),
            api_key_masked,
            temperature: b.temperature,
            max_tokens: b.max_tokens,
            timeout_seconds: b.timeout_seconds,
            scene: b.scene.clone(),
            is_default: b.is_default,
            enabled: b.enabled,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBindingRequest {
    pub name: String,
    pub api_base: String,
    pub model_name: String,
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub scene: Option<Scene>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBindingRequest {
    pub name: Option<String>,
    pub api_base: Option<String>,
    pub model_name: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub scene: Option<Scene>,
    pub is_default: Option<bool>,
    pub enabled: Option<bool>,
}

fn default_temperature() -> f64 {
    0.3
}
fn default_max_tokens() -> i64 {
    4096
}
fn default_timeout() -> i64 {
    60
}

// ============================================================================
// Agent profiles
// ============================================================================

/// Per-profile tool switches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureMask {
    pub sql_tool: bool,
    pub rag_tool: bool,
    pub rule_validation: bool,
}

impl Default for FeatureMask {
    fn default() -> Self {
        Self { sql_tool: true, rag_tool: false, rule_validation: true }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub binding_id: Option<String>,
    pub sql_tool: bool,
    pub rag_tool: bool,
    pub rule_validation: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn features(&self) -> FeatureMask {
        FeatureMask {
            sql_tool: self.sql_tool,
            rag_tool: self.rag_tool,
            rule_validation: self.rule_validation,
        }
    }
}

// ============================================================================
// Execution log records
// ============================================================================

/// One structured record per agent invocation.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLogRecord {
    pub profile_id: Option<String>,
    pub step: String,
    pub status: String,
    pub detail: String,
    pub metadata: serde_json::Value,
    pub ts: DateTime<Utc>,
}
