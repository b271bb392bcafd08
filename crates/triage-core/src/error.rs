//! Error types for Triage

use thiserror::Error;

/// Result type alias using Triage's Error
pub type Result<T> = std::result::Result<T, Error>;

/// How the workflow engine treats an error raised by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The run is aborted immediately and never retried
    NonRetriable,
    /// The whole run is retried until the attempt bound is reached
    Retriable,
}

impl ErrorClass {
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorClass::Retriable)
    }
}

/// Triage error types with helpful messages
#[derive(Error, Debug)]
pub enum Error {
    // Entity errors (E001-E099)
    #[error("Invalid ticket id '{0}'. Ticket ids are UUIDs.")]
    InvalidTicketId(String),

    #[error("Ticket '{0}' not found. Run `triage tickets list` to see all tickets.")]
    TicketNotFound(String),

    #[error("User '{0}' not found. Run `triage users list` to see all users.")]
    UserNotFound(String),

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    // Network errors (E100-E199)
    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    #[error("LLM API error: {0}. Check your API key with `triage config get llm.api_key`.")]
    LLMError(String),

    #[error("Rate limited. Waiting {0} seconds before retry.")]
    RateLimited(u64),

    #[error("Operation '{operation}' timed out after {secs} seconds")]
    Timeout { operation: String, secs: u64 },

    // Storage errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Knowledge graph error: {0}")]
    GraphStore(String),

    // Analysis errors (E500-E599)
    #[error("AI response is not valid JSON: {0}")]
    JudgementParse(String),

    // Embedding errors (E600-E699)
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Notification errors (E700-E799)
    #[error("Mail delivery to '{to}' failed: {reason}")]
    MailFailed { to: String, reason: String },

    // Config errors (E800-E899)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Serialization errors (E900-E999)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTicketId(_) => "E001",
            Self::TicketNotFound(_) => "E002",
            Self::UserNotFound(_) => "E003",
            Self::InvalidPayload(_) => "E004",
            Self::NetworkError(_) => "E100",
            Self::LLMError(_) => "E101",
            Self::RateLimited(_) => "E102",
            Self::Timeout { .. } => "E103",
            Self::DatabaseError(_) => "E400",
            Self::GraphStore(_) => "E401",
            Self::JudgementParse(_) => "E500",
            Self::EmbeddingFailed(_) => "E600",
            Self::DimensionMismatch { .. } => "E601",
            Self::MailFailed { .. } => "E700",
            Self::ConfigError(_) => "E800",
            Self::InvalidInput(_) => "E801",
            Self::Serialization(_) => "E900",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Classify this error for the workflow engine.
    ///
    /// Structural problems with the input can never succeed on replay, so
    /// they abort the run. Everything that depends on a remote system or a
    /// non-deterministic model is worth another attempt.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidTicketId(_)
            | Self::TicketNotFound(_)
            | Self::UserNotFound(_)
            | Self::InvalidPayload(_)
            | Self::DimensionMismatch { .. }
            | Self::ConfigError(_)
            | Self::InvalidInput(_)
            | Self::Serialization(_) => ErrorClass::NonRetriable,
            Self::NetworkError(_)
            | Self::LLMError(_)
            | Self::RateLimited(_)
            | Self::Timeout { .. }
            | Self::DatabaseError(_)
            | Self::GraphStore(_)
            | Self::JudgementParse(_)
            | Self::EmbeddingFailed(_)
            | Self::MailFailed { .. }
            | Self::Other(_)
            | Self::Io(_) => ErrorClass::Retriable,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }
}
