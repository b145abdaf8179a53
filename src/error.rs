//! Error types for reply-proxy.

use std::time::Duration;

/// Top-level error type. Startup failures only; per-message failures are
/// handled where they occur.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },
}

/// Failures of a `classify`/`generate` call.
///
/// All of these are recoverable: callers retry once and then fall back.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{task} call timed out after {timeout:?}")]
    Timeout { task: String, timeout: Duration },

    #[error("Malformed {task} output: {reason}")]
    Malformed { task: String, reason: String },

    #[error("Capability unavailable: {0}")]
    Unavailable(#[from] LlmError),
}

impl CapabilityError {
    /// Short label for structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Malformed { .. } => "malformed",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Context retrieval errors. Always soft: the planner degrades to empty context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Outbound send errors. Retry policy belongs to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to send to channel {channel_id}: {reason}")]
    SendFailed { channel_id: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Rejected by remote API: {0}")]
    Rejected(String),
}

/// Planner-level errors (only surfaced for unrecoverable wiring problems).
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("Checkpoint store failed: {0}")]
    Checkpoint(#[from] DatabaseError),

    #[error("Planner task for {message_id} failed: {reason}")]
    Task { message_id: String, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
