//! LLM module: provider transport, agent runtime, and the specialist
//! agents built on top of it.
//!
//! # Architecture
//! ```text
//! ┌──────────────────┐
//! │   AgentRuntime   │  ← binding resolution, prompt dispatch, agent_logs
//! └────────┬─────────┘
//!          │ LanguageProvider (capability)
//!    ┌─────┴──────────────┐
//!    ▼                    ▼
//! ┌────────────────┐  ┌────────────┐
//! │ OpenAI-compat  │  │  Mock      │
//! │ HTTP provider  │  │ (tests)    │
//! └────────────────┘  └────────────┘
//! ```
//!
//! Specialist agents: schema relevance, SQL generation/correction, and
//! visualization.

mod models;
mod provider;
mod repository;
mod runtime;
mod schema_agent;
mod sql_agent;
mod visualize_agent;

pub use models::*;
pub use provider::{Completion, CompletionRequest, LanguageProvider, OpenAiCompatProvider, VectorStore};
pub use repository::LlmRepository;
pub use runtime::{AgentRuntime, InvokeSpec};
pub use schema_agent::SchemaAgent;
pub use sql_agent::{SqlAgent, SqlAgentInput, SqlDraft};
pub use visualize_agent::{VisualizeAgent, VisualizeInput};

#[cfg(test)]
pub use provider::MockProvider;
