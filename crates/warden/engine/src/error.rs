//! Error types for the governance engine

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for engine operations
pub type GovernanceResult<T> = Result<T, GovernanceError>;

/// Storage-layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Attempted mutation of write-once data
    #[error("immutability violation: {0}")]
    ImmutabilityViolation(String),

    /// Backend could not be reached
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Engine errors surfaced to callers
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Malformed filter, window or request parameters; rejected before any read
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Re-resolution, ledger id reuse with different content, or an illegal stage transition
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stage handler or collaborator could not be reached
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Kill-switch state could not be read; the entity is treated as frozen
    #[error("fail-closed: {0}")]
    FailClosed(String),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for GovernanceError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Conflict(msg) | StorageError::ImmutabilityViolation(msg) => {
                Self::Conflict(msg)
            }
            other => Self::Storage(other),
        }
    }
}

impl GovernanceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Operator actions must name who performed them
pub(crate) fn require_actor(actor: &str) -> GovernanceResult<()> {
    if actor.trim().is_empty() {
        return Err(GovernanceError::validation("actor must not be empty"));
    }
    Ok(())
}
