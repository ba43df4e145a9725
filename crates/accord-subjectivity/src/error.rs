//! Error types for accord-subjectivity.

use accord_identity::Id;
use thiserror::Error;

/// Result type for subjectivity operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Snapshot storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A peer interaction failed
    #[error("Network error: {0}")]
    Network(String),

    /// Power outside [0, 1] or NaN
    #[error("invalid power {value} for administrator {administrator}")]
    InvalidPower { administrator: Id, value: f64 },
}
