//! Identity and Validation Model
//!
//! Every replicated object in Accord is named by a **recycle id**: a
//! sequential, non-negative integer unique within its class. Ids are reused
//! only after their previous holder has been deleted, and a handful of
//! negative sentinels (unset, exceptional, vote, system, deleted) are
//! reserved and never allocated.
//!
//! # Validation stages
//!
//! Objects are checked at three points in their life:
//!
//! - **create**: a fresh object, id still unset
//! - **create with specified id**: the id is chosen up front and must be free
//! - **update**: a new version; with the previous version at hand, immutable
//!   fields and the history index are compared as well
//!
//! Catch-up accepts an object that passes either of the last two. Reference
//! validation is a separate stage because it needs a storage transaction.
//!
//! Validation never fails loudly. It returns a [`ValidationResult`] that is
//! empty when the object is valid; only storage errors surface as `Err`.
//!
//! # Content hashes
//!
//! Replicated state is compared across nodes by [`ContentHash`], a BLAKE3
//! digest over a canonical bincode encoding.

mod allocator;
mod canonical;
mod entity;
mod error;
mod id;
mod reference;
mod validation;

pub use allocator::{IdAllocator, MAX_CLAIM_GAP};
pub use canonical::{canonical_bytes, content_hash, ContentHash};
pub use entity::{
    on_reference_deleted, rewrite_deleted_reference, validate_at_catch_up, validate_at_create,
    validate_at_create_specified_id, validate_at_update, validate_reference, ObjectHeader,
    Validatable,
};
pub use error::{Error, Result};
pub use id::{is_special, Id};
pub use reference::{IdOccupancy, ReferenceLookup, ReferenceRole, ReferrerAction};
pub use validation::{fields, ErrorKind, ValidationError, ValidationResult};
