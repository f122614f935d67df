//! Error types for the classification and digest core.
//!
//! Errors are tagged values, classified by recoverability:
//! - Retryable: transient LLM failures, timeouts
//! - Admission: rate limits, open circuit breaker
//! - Fatal: contract violations, tenancy violations
//!
//! No variant ever carries raw email content. Internal detail that would
//! leak across the HTTP boundary is hashed before logging.

use thiserror::Error;

/// Error kinds propagated through the core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rate limited on {limit}, retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        limit: &'static str,
    },

    #[error("circuit open: {reason}")]
    CircuitOpen { reason: String },

    #[error("transient llm failure: {0}")]
    LlmTransient(String),

    #[error("llm output failed schema validation: {0}")]
    LlmSchemaInvalid(String),

    #[error("llm call exceeded deadline of {0}ms")]
    LlmTimeout(u64),

    #[error("llm refused the request")]
    LlmRefused,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("tenancy violation")]
    TenancyViolation,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True when retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::LlmTransient(_) | CoreError::LlmTimeout(_) | CoreError::LlmSchemaInvalid(_)
        )
    }

    /// True when the classifier should fall back instead of propagating.
    pub fn is_llm_failure(&self) -> bool {
        matches!(
            self,
            CoreError::LlmTransient(_)
                | CoreError::LlmSchemaInvalid(_)
                | CoreError::LlmTimeout(_)
                | CoreError::LlmRefused
                | CoreError::CircuitOpen { .. }
        )
    }

    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::CircuitOpen { .. } => "circuit_open",
            CoreError::LlmTransient(_) => "llm_transient",
            CoreError::LlmSchemaInvalid(_) => "llm_schema_invalid",
            CoreError::LlmTimeout(_) => "llm_timeout",
            CoreError::LlmRefused => "llm_refused",
            CoreError::StorageUnavailable(_) => "storage_unavailable",
            CoreError::ContractViolation(_) => "contract_violation",
            CoreError::TenancyViolation => "tenancy_violation",
            CoreError::Internal(_) => "internal",
        }
    }

    /// HTTP status this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::InvalidInput(_) => 400,
            CoreError::TenancyViolation => 403,
            CoreError::RateLimited { .. } => 429,
            CoreError::LlmTransient(_)
            | CoreError::LlmSchemaInvalid(_)
            | CoreError::LlmTimeout(_)
            | CoreError::LlmRefused => 502,
            CoreError::CircuitOpen { .. } | CoreError::StorageUnavailable(_) => 503,
            CoreError::ContractViolation(_) | CoreError::Internal(_) => 500,
        }
    }

    /// Message safe to surface to a caller. Internal and storage detail is
    /// replaced by a hash so operators can correlate with logs.
    pub fn public_message(&self) -> String {
        match self {
            CoreError::Internal(detail) | CoreError::StorageUnavailable(detail) => {
                format!("{} (ref {})", self.code(), crate::hygiene::hash_pii(detail))
            }
            other => other.to_string(),
        }
    }
}

impl From<crate::db::DbError> for CoreError {
    fn from(err: crate::db::DbError) -> Self {
        CoreError::StorageUnavailable(err.to_string())
    }
}
