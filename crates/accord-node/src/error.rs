//! Error types for the node.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Peer sent something we cannot accept
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Canonical encoding error
    #[error(transparent)]
    Identity(#[from] accord_identity::Error),

    #[error(transparent)]
    Objectivity(#[from] accord_objectivity::Error),

    #[error(transparent)]
    Subjectivity(#[from] accord_subjectivity::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<Error> for accord_subjectivity::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Subjectivity(inner) => inner,
            Error::Storage(msg) => accord_subjectivity::Error::Storage(msg),
            other => accord_subjectivity::Error::Network(other.to_string()),
        }
    }
}
