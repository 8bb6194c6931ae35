//! Error types for z-recon core.

use crate::ids::IdError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while constructing or validating domain values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Currency is not a three-letter ISO 4217 code.
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),

    /// Unknown provider name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}
