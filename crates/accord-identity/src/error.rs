//! Error types for accord-identity.

use crate::id::Id;
use thiserror::Error;

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by id allocation, canonical encoding and reference lookups.
///
/// Validation failures are never reported through this type; they are
/// accumulated in a [`ValidationResult`](crate::ValidationResult).
#[derive(Debug, Error)]
pub enum Error {
    /// Special ids are never handed out or taken back by an allocator.
    #[error("id {0} is not a recyclable id")]
    NotRecyclable(Id),

    /// The id is currently held by another object.
    #[error("id {0} is already in use")]
    IdInUse(Id),

    /// The id lies beyond anything this allocator has handed out.
    #[error("id {0} was never allocated")]
    NeverAllocated(Id),

    /// The id was already released.
    #[error("id {0} is already free")]
    AlreadyFree(Id),

    /// Claiming the id would create an unreasonably large hole.
    #[error("claiming id {id} would skip {gap} ids")]
    ClaimGapTooLarge { id: Id, gap: i64 },

    /// Canonical encoding failed.
    #[error("canonical encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    /// The storage behind a reference lookup failed.
    #[error("reference lookup failed: {0}")]
    Lookup(String),
}
