//! Error types for glyphos.

use thiserror::Error;

/// Result type alias using glyphos's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory-system operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad filter, unknown type tag, malformed action, invalid argument
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store-level failure (disk, lock, mirror append)
    #[error("Store error: {0}")]
    Storage(String),

    /// Schema mismatch that additive migration could not resolve
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// LLM provider failure (timeout, rate limit, transport)
    #[error("Provider error: {provider} - {message}")]
    Provider { provider: String, message: String },

    /// Every model in the fallback chain failed or was unavailable
    #[error("Routing exhausted after {attempts} attempts: {last_error}")]
    RoutingExhausted { attempts: u32, last_error: String },

    /// Firewall refused the action
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// Path escaped the sandbox jail
    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    /// Execution budget ceiling reached
    #[error("Budget exhausted: {resource}")]
    BudgetExhausted { resource: String },

    /// Orchestration stopped (max rounds, repeated signature, spawn failure)
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// Sub-agent or provider call exceeded its wall-clock limit
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a store error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a budget exhausted error.
    pub fn budget_exhausted(resource: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
        }
    }

    /// True for failures worth retrying after a sync (transient lock contention).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(msg) if msg.contains("locked") || msg.contains("busy"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::provider("ollama", "connection refused");
        assert_eq!(
            err.to_string(),
            "Provider error: ollama - connection refused"
        );

        let err = Error::RoutingExhausted {
            attempts: 3,
            last_error: "timeout".to_string(),
        };
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::storage("database is locked").is_retryable());
        assert!(!Error::storage("disk I/O error").is_retryable());
        assert!(!Error::validation("bad filter").is_retryable());
    }
}
