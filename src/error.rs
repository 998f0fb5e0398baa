//! Error types for Koi

use thiserror::Error;

/// Whether an upstream failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// Rate limits, timeouts, 5xx responses
    Transient,
    /// Bad requests, auth failures, malformed responses
    Permanent,
}

impl std::fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamKind::Transient => write!(f, "transient"),
            UpstreamKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Main error type for the memory system
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Malformed message or role; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown session or memory
    #[error("Not found: {0}")]
    NotFound(String),

    /// Completion, embedding, topic or NER service failure
    #[error("Upstream {service} error ({kind}): {message}")]
    Upstream {
        service: &'static str,
        kind: UpstreamKind,
        message: String,
    },

    /// Persistence failure outside of sqlx
    #[error("Storage error: {0}")]
    Store(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Session lock not acquired in time
    #[error("Timed out after {waited_ms}ms waiting for session {namespace}/{session_id}")]
    ConcurrencyTimeout {
        namespace: String,
        session_id: String,
        waited_ms: u64,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        MemoryError::Upstream {
            service,
            kind: UpstreamKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(service: &'static str, message: impl Into<String>) -> Self {
        MemoryError::Upstream {
            service,
            kind: UpstreamKind::Permanent,
            message: message.into(),
        }
    }

    /// Transient upstream failures and store hiccups can be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            MemoryError::Upstream { kind, .. } => *kind == UpstreamKind::Transient,
            MemoryError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            MemoryError::ConcurrencyTimeout { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MemoryError>;
