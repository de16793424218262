use thiserror::Error;

use crate::domain::Endpoint;

/// Main error type for the connectivity core
#[derive(Error, Debug)]
pub enum LanyardError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Rate limited on {endpoint}: {detail}")]
    RateLimited { endpoint: Endpoint, detail: String },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Authentication errors (fatal for the affected connection, never retried)
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Signature error: {0}")]
    Signature(String),

    // Stream protocol errors (connection is closed and reconnection proceeds)
    #[error("Protocol error: {0}")]
    Protocol(String),

    // Data validation errors (handled per bound policy, never fatal)
    #[error("Validation failed: {0}")]
    Validation(String),

    // State reconciliation errors (logged and discarded, state unchanged)
    #[error("Consistency error: {0}")]
    Consistency(String),

    // Caller-visible deadline expiry while queued or awaiting a reply
    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Shutdown in progress")]
    Shutdown,

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LanyardError {
    /// Whether this error is resolved inside the core via a retry/backoff
    /// cycle rather than escalated to the engine.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LanyardError::RateLimited { .. }
                | LanyardError::TransientNetwork(_)
                | LanyardError::Http(_)
        )
    }

    /// Whether this error is fatal for the affected connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LanyardError::Auth(_) | LanyardError::Signature(_))
    }
}

/// Result type alias for LanyardError
pub type Result<T> = std::result::Result<T, LanyardError>;
