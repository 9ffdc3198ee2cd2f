//! Event memory entities (capped ring).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::analysis::Scene;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventType {
    TextInput,
    VoiceInput,
    FileUpload,
    ImageUpload,
    MetricAction,
    AnalysisResult,
}

impl MemoryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextInput => "text_input",
            Self::VoiceInput => "voice_input",
            Self::FileUpload => "file_upload",
            Self::ImageUpload => "image_upload",
            Self::MetricAction => "metric_action",
            Self::AnalysisResult => "analysis_result",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub event_type: MemoryEventType,
    pub scene: Scene,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
