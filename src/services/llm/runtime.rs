//! Agent runtime: resolves the bound provider, dispatches one prompt, and
//! post-processes the reply into a structured [`AgentMessage`].
//!
//! Every invocation, success or failure, appends one `agent_logs` record.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use super::models::{AgentLogRecord, AgentProfile, FeatureMask, LlmBinding};
use super::provider::{CompletionRequest, LanguageProvider, OpenAiCompatProvider};
use super::repository::LlmRepository;
use crate::models::{AgentIntent, AgentMessage, AgentRole, Scene};
use crate::utils::{EngineError, EngineResult};

/// One agent invocation.
pub struct InvokeSpec {
    pub scene: Scene,
    pub binding_id: Option<String>,
    pub profile_id: Option<String>,
    /// Pipeline step name for the execution log ("sql_agent", "visualize").
    pub step: String,
    pub system: String,
    pub user: String,
    pub expect_json: bool,
}

pub struct AgentRuntime {
    repository: LlmRepository,
    enabled: bool,
    provider_override: Option<Arc<dyn LanguageProvider>>,
}

impl AgentRuntime {
    pub fn new(pool: SqlitePool, enabled: bool) -> Self {
        Self { repository: LlmRepository::new(pool), enabled, provider_override: None }
    }

    /// Pin a provider instead of building one per binding (tests).
    pub fn with_provider(pool: SqlitePool, provider: Arc<dyn LanguageProvider>) -> Self {
        Self {
            repository: LlmRepository::new(pool),
            enabled: true,
            provider_override: Some(provider),
        }
    }

    pub fn is_available(&self) -> bool {
        self.enabled
    }

    pub fn repository(&self) -> &LlmRepository {
        &self.repository
    }

    pub async fn profile(&self, profile_id: Option<&str>) -> EngineResult<Option<AgentProfile>> {
        match profile_id {
            Some(id) => {
                let profile = self.repository.get_profile(id).await?.ok_or_else(|| {
                    EngineError::not_found(format!("agent profile '{}' not found", id))
                })?;
                Ok(Some(profile))
            },
            None => Ok(None),
        }
    }

    pub async fn features(&self, profile_id: Option<&str>) -> EngineResult<FeatureMask> {
        Ok(self
            .profile(profile_id)
            .await?
            .map(|p| p.features())
            .unwrap_or_default())
    }

    /// Invoke the bound provider and wrap the reply. JSON replies are
    /// parsed permissively: known fields drive `intent`/`data`, unknown
    /// fields are preserved in `metadata`.
    pub async fn invoke(&self, spec: InvokeSpec) -> EngineResult<AgentMessage> {
        if !self.enabled {
            return Err(EngineError::llm_unavailable("llm runtime disabled by configuration"));
        }

        let binding =
            self.repository.resolve_binding(&spec.scene, spec.binding_id.as_deref()).await?;
        let provider = self.provider_for(&binding)?;

        let request = CompletionRequest {
            system: spec.system,
            user: spec.user,
            temperature: binding.temperature,
            max_tokens: binding.max_tokens.max(1) as u32,
            timeout: Duration::from_secs(binding.timeout_seconds.max(1) as u64),
            json_response: spec.expect_json,
        };

        let started = std::time::Instant::now();
        let outcome = provider.complete(&request).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(completion) => {
                let message = if spec.expect_json {
                    parse_json_reply(&completion.text)
                } else {
                    AgentMessage::assistant(completion.text.clone(), AgentIntent::Answer)
                };

                self.log(
                    &spec.profile_id,
                    &spec.step,
                    "completed",
                    &format!("{} chars in {}ms", completion.text.len(), latency_ms),
                    serde_json::json!({
                        "binding": binding.name,
                        "model": binding.model_name,
                        "input_tokens": completion.input_tokens,
                        "output_tokens": completion.output_tokens,
                        "latency_ms": latency_ms,
                    }),
                )
                .await;

                Ok(message)
            },
            Err(e) => {
                self.log(
                    &spec.profile_id,
                    &spec.step,
                    "failed",
                    &e.to_string(),
                    serde_json::json!({
                        "binding": binding.name,
                        "kind": e.kind(),
                        "latency_ms": latency_ms,
                    }),
                )
                .await;
                Err(e)
            },
        }
    }

    fn provider_for(&self, binding: &LlmBinding) -> EngineResult<Arc<dyn LanguageProvider>> {
        if let Some(provider) = &self.provider_override {
            return Ok(Arc::clone(provider));
        }
        Ok(Arc::new(OpenAiCompatProvider::from_binding(binding)?))
    }

    async fn log(
        &self,
        profile_id: &Option<String>,
        step: &str,
        status: &str,
        detail: &str,
        metadata: Value,
    ) {
        let record = AgentLogRecord {
            profile_id: profile_id.clone(),
            step: step.to_string(),
            status: status.to_string(),
            detail: detail.to_string(),
            metadata,
            ts: Utc::now(),
        };
        if let Err(e) = self.repository.append_log(&record).await {
            tracing::warn!("Failed to append agent log for step '{}': {}", step, e);
        }
    }
}

/// First pass is permissive: strip code fences, accept any JSON object,
/// keep unknown fields. A non-JSON reply degrades to a plain answer.
fn parse_json_reply(text: &str) -> AgentMessage {
    let stripped = strip_code_fence(text);

    let Ok(value) = serde_json::from_str::<Value>(stripped) else {
        let mut message = AgentMessage::assistant(text.to_string(), AgentIntent::Answer);
        message.metadata.insert("unparsed".to_string(), Value::Bool(true));
        return message;
    };

    let intent = match value.get("intent").and_then(Value::as_str) {
        Some("clarification") => AgentIntent::Clarification,
        Some("error") => AgentIntent::Error,
        _ => AgentIntent::Answer,
    };

    let content = value
        .get("content")
        .or_else(|| value.get("summary"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut metadata = serde_json::Map::new();
    if let Value::Object(obj) = &value {
        const KNOWN: [&str; 8] = [
            "intent",
            "content",
            "summary",
            "sql",
            "should_visualize",
            "clarification",
            "chart_type",
            "spec",
        ];
        for (k, v) in obj {
            if !KNOWN.contains(&k.as_str()) {
                metadata.insert(k.clone(), v.clone());
            }
        }
    }

    AgentMessage { role: AgentRole::Assistant, content, data: Some(value), intent, metadata }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_parses() {
        let message = parse_json_reply("```json\n{\"intent\": \"answer\", \"sql\": \"SELECT 1\"}\n```");
        assert_eq!(message.intent, AgentIntent::Answer);
        assert_eq!(
            message.data.as_ref().and_then(|d| d.get("sql")).and_then(Value::as_str),
            Some("SELECT 1")
        );
    }

    #[test]
    fn unknown_fields_land_in_metadata() {
        let message = parse_json_reply(r#"{"intent": "answer", "confidence": 0.9}"#);
        assert_eq!(message.metadata.get("confidence"), Some(&Value::from(0.9)));
    }

    #[test]
    fn non_json_degrades_to_plain_answer() {
        let message = parse_json_reply("I could not produce JSON");
        assert_eq!(message.intent, AgentIntent::Answer);
        assert_eq!(message.content, "I could not produce JSON");
        assert_eq!(message.metadata.get("unparsed"), Some(&Value::Bool(true)));
    }
}
