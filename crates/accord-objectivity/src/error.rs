//! Error types for accord-objectivity.

use accord_identity::ValidationResult;
use thiserror::Error;

/// Result type for objectivity operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Id allocation or hashing error
    #[error("Identity error: {0}")]
    Identity(#[from] accord_identity::Error),

    /// An object failed validation inside a sequence
    #[error("Validation failed: {0}")]
    Validation(ValidationResult),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Broken internal invariant
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl From<Error> for accord_catchup::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Invariant(msg) => accord_catchup::Error::Invariant(msg),
            other => accord_catchup::Error::Storage(other.to_string()),
        }
    }
}
