//! Structured agent messages (immutable once emitted).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentIntent {
    Answer,
    Clarification,
    Error,
}

impl AgentIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answer => "answer",
            Self::Clarification => "clarification",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: AgentRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub intent: AgentIntent,
    /// Unknown provider fields are preserved here rather than dropped.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl AgentMessage {
    pub fn assistant(content: impl Into<String>, intent: AgentIntent) -> Self {
        Self {
            role: AgentRole::Assistant,
            content: content.into(),
            data: None,
            intent,
            metadata: serde_json::Map::new(),
        }
    }
}
