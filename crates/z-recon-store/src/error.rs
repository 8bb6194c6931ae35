//! Error types for z-recon storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A unique index already holds a different record.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The unit of work lost a lock race or timed out waiting for one.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Record not found.
    #[error("not found")]
    NotFound,

    /// A ledger key was reserved but no record was completed for it.
    #[error("ledger key {0} reserved but not completed")]
    ReservationNotCompleted(String),

    /// A ledger record was completed without a reservation in the same unit of work.
    #[error("ledger key {0} completed without a reservation")]
    NotReserved(String),
}

impl StoreError {
    /// Whether retrying the same unit of work may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Conflict(_))
    }
}
