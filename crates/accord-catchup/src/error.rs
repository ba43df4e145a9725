//! Error types for accord-catchup.

use thiserror::Error;

/// Result type for catch-up operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a catch-up step.
///
/// Network failures and invalid payloads are not errors: they are recorded in
/// the machine's statistics and retried on a later tick.
#[derive(Debug, Error)]
pub enum Error {
    /// Local storage failed. The step is abandoned and retried next tick.
    #[error("storage error: {0}")]
    Storage(String),

    /// An internal invariant was broken. The machine stops until reset.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether the machine must stop until the next reset.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}
