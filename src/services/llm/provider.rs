//! Language provider capability and the OpenAI-compatible HTTP transport.
//!
//! Compatible with OpenAI, Azure OpenAI, DeepSeek, and other
//! `/chat/completions` endpoints.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::models::LlmBinding;
use crate::utils::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// Ask the provider for a JSON object response.
    pub json_response: bool,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
}

/// External capability: a chat-completion endpoint.
#[async_trait]
pub trait LanguageProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> EngineResult<Completion>;
}

/// Optional retrieval capability used only when a profile enables the RAG
/// tool.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, id: &str, text: &str) -> EngineResult<()>;
    async fn query(&self, text: &str, limit: usize) -> EngineResult<Vec<String>>;
}

// ============================================================================
// OpenAI-compatible HTTP provider
// ============================================================================

pub struct OpenAiCompatProvider {
    http_client: Client,
    api_base: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn from_binding(binding: &LlmBinding) -> EngineResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::internal(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http_client,
            api_base: binding.api_base.trim_end_matches('/').to_string(),
            model: binding.model_name.clone(),
            api_key: binding.api_key.clone(),
        })
    }
}

#[async_trait]
impl LanguageProvider for OpenAiCompatProvider {
    async fn complete(&self, request: &CompletionRequest) -> EngineResult<Completion> {
        let chat_request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: request.system.clone() },
                ChatMessage { role: "user".to_string(), content: request.user.clone() },
            ],
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
            response_format: request
                .json_response
                .then(|| ResponseFormat { r#type: "json_object".to_string() }),
        };

        let url = format!("{}/chat/completions", self.api_base);
        tracing::debug!("Calling LLM API: {} with model {}", url, self.model);

        let mut builder = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(request.timeout)
            .json(&chat_request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::llm_unavailable(format!(
                    "provider timed out after {:?}",
                    request.timeout
                ))
            } else {
                EngineError::llm_unavailable(format!("provider request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(EngineError::llm_unavailable(format!(
                "provider rate limited, retry after {}s",
                retry_after
            )));
        }

        if !status.is_success() {
            let error_text =
                response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(EngineError::llm_unavailable(format!(
                "provider error {}: {}",
                status, error_text
            )));
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::llm_protocol(format!("response not JSON: {}", e)))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| EngineError::llm_protocol("empty completion from provider"))?;

        let input_tokens = chat_response.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
        let output_tokens =
            chat_response.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0);

        Ok(Completion { text: content.clone(), input_tokens, output_tokens })
    }
}

// ============================================================================
// OpenAI API request/response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i32,
    completion_tokens: i32,
}

// ============================================================================
// Scripted provider for tests
// ============================================================================

#[cfg(test)]
pub struct MockProvider {
    replies: std::sync::Mutex<std::collections::VecDeque<EngineResult<String>>>,
    pub requests: std::sync::Mutex<Vec<CompletionRequest>>,
}

#[cfg(test)]
impl MockProvider {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            replies: std::sync::Mutex::new(std::collections::VecDeque::new()),
            requests: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: EngineError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }
}

#[cfg(test)]
#[async_trait]
impl LanguageProvider for MockProvider {
    async fn complete(&self, request: &CompletionRequest) -> EngineResult<Completion> {
        self.requests.lock().unwrap().push(request.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(Completion { text, input_tokens: 10, output_tokens: 10 }),
            Some(Err(e)) => Err(e),
            None => Err(EngineError::llm_protocol("mock provider has no scripted reply")),
        }
    }
}
