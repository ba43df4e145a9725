//! Storage lookups needed by the validation stages, and the referrer protocol.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::Id;

/// Existence checks against committed storage.
///
/// Implemented by store transactions. A lookup failure is a storage error,
/// not a validation finding.
pub trait ReferenceLookup {
    /// Whether a user with this id exists.
    fn user_exists(&self, id: Id) -> Result<bool>;
}

/// Id occupancy checks for create-with-specified-id.
pub trait IdOccupancy {
    /// Whether `id` is currently held by an object of class `model`.
    fn id_in_use(&self, model: &'static str, id: Id) -> Result<bool>;
}

/// The slot through which one object refers to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceRole {
    Registerer,
    Administrator,
}

/// What a referrer does when the object it points at is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferrerAction {
    /// Replace the reference with [`Id::DELETED`].
    Rewrite,
    /// Delete the referrer as well.
    Cascade,
}
