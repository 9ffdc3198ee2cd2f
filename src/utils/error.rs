//! Engine error taxonomy and the standard result envelope.
//!
//! Every public operation returns `EngineResult<T>`; callers that need the
//! wire shape convert through [`Envelope`].

use serde::Serialize;

pub type EngineResult<T> = Result<T, EngineError>;

/// Domain errors, one variant per taxonomy kind.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PoolExhausted(String),

    /// Driver or network failure that is worth retrying.
    #[error("{0}")]
    DbTransient(String),

    /// Driver failure that retrying will not fix (bad credentials, unknown host).
    #[error("{0}")]
    DbPermanent(String),

    /// SQL-level engine error; carries the raw engine message so the
    /// correction loop can feed it back to the SQL agent.
    #[error("SQL error: {message}")]
    Sql { message: String },

    #[error("{0}")]
    LlmUnavailable(String),

    /// The provider answered but outside its contract (empty choice,
    /// unparseable JSON payload).
    #[error("{0}")]
    LlmProtocol(String),

    #[error("{0}")]
    PlanInfeasible(String),

    #[error("{0}")]
    ExecutionBlocked(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::PoolExhausted(msg.into())
    }

    pub fn db_transient(msg: impl Into<String>) -> Self {
        Self::DbTransient(msg.into())
    }

    pub fn db_permanent(msg: impl Into<String>) -> Self {
        Self::DbPermanent(msg.into())
    }

    pub fn sql(message: impl Into<String>) -> Self {
        Self::Sql { message: message.into() }
    }

    pub fn llm_unavailable(msg: impl Into<String>) -> Self {
        Self::LlmUnavailable(msg.into())
    }

    pub fn llm_protocol(msg: impl Into<String>) -> Self {
        Self::LlmProtocol(msg.into())
    }

    pub fn plan_infeasible(msg: impl Into<String>) -> Self {
        Self::PlanInfeasible(msg.into())
    }

    pub fn execution_blocked(msg: impl Into<String>) -> Self {
        Self::ExecutionBlocked(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable taxonomy tag for logs and the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::PoolExhausted(_) => "POOL_EXHAUSTED",
            Self::DbTransient(_) => "DB_TRANSIENT",
            Self::DbPermanent(_) => "DB_PERMANENT",
            Self::Sql { .. } => "SQL_ERROR",
            Self::LlmUnavailable(_) => "LLM_UNAVAILABLE",
            Self::LlmProtocol(_) => "LLM_PROTOCOL",
            Self::PlanInfeasible(_) => "PLAN_INFEASIBLE",
            Self::ExecutionBlocked(_) => "EXECUTION_BLOCKED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled(_) => "CANCELLED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a local bounded retry is appropriate for this error.
    ///
    /// SQL errors are recovered by the correction loop, not by retrying the
    /// same statement, so they report false here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DbTransient(_) | Self::LlmUnavailable(_))
    }
}

// Metadata-store failures have no user-facing recovery; adapters map their
// driver errors explicitly instead of relying on these.
impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Internal(format!("metadata store error: {}", other)),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {}", e))
    }
}

// ============================================================================
// Result envelope
// ============================================================================

/// Wire shape of an error inside the envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        let details = match e {
            EngineError::Sql { message } => {
                Some(serde_json::json!({ "engine_message": message }))
            },
            _ => None,
        };
        Self { kind: e.kind(), message: e.to_string(), retryable: e.is_retryable(), details }
    }
}

/// Standard `{ok, data?, error?}` envelope for public operations.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> Envelope<T> {
    pub fn from_result(result: EngineResult<T>) -> Self {
        match result {
            Ok(data) => Self { ok: true, data: Some(data), error: None },
            Err(e) => Self { ok: false, data: None, error: Some(ErrorBody::from(&e)) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(EngineError::validation("x").kind(), "VALIDATION");
        assert_eq!(EngineError::sql("boom").kind(), "SQL_ERROR");
        assert_eq!(EngineError::pool_exhausted("full").kind(), "POOL_EXHAUSTED");
    }

    #[test]
    fn retryable_covers_transient_only() {
        assert!(EngineError::db_transient("reset").is_retryable());
        assert!(EngineError::llm_unavailable("503").is_retryable());
        assert!(!EngineError::sql("bad column").is_retryable());
        assert!(!EngineError::timeout("deadline").is_retryable());
        assert!(!EngineError::pool_exhausted("full").is_retryable());
    }

    #[test]
    fn envelope_round_trip() {
        let ok = Envelope::from_result(Ok(42u32));
        assert!(ok.ok);
        assert_eq!(ok.data, Some(42));

        let err: Envelope<u32> = Envelope::from_result(Err(EngineError::not_found("nope")));
        assert!(!err.ok);
        let body = err.error.expect("error body");
        assert_eq!(body.kind, "NOT_FOUND");
        assert!(!body.retryable);
    }
}
