//! Error types for the boardcal ecosystem.

use thiserror::Error;

/// Errors that can occur while syncing a board and a calendar.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed or missing field data. Non-retryable: the engine never
    /// guesses a default date.
    #[error("Translation error: {0}")]
    Translation(String),

    /// Timeout / 5xx / rate-limit from a provider. Retried with backoff,
    /// bounded attempts.
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    /// Credential or permission failure. Fatal to the affected channel.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Two different source entities claim the same counterpart. Never
    /// auto-resolved; flagged for manual reconciliation.
    #[error("Correlation conflict: {0}")]
    CorrelationConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientProvider(_))
    }
}

/// Result type alias for boardcal operations.
pub type SyncResult<T> = Result<T, SyncError>;
