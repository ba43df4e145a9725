//! Recycle identifiers and the reserved sentinel ids.
//!
//! Every replicated object carries an [`Id`] that is unique within its class.
//! Standard ids start at [`Id::FIRST`] and count upwards; an id is handed out
//! again only after its previous holder has been deleted.
//!
//! Negative values are reserved sentinels:
//!
//! ```text
//!  -1  UNSET        nothing assigned yet
//!  -2  EXCEPTIONAL  display-only marker for out-of-band values
//!  -3  VOTE         created by a network vote
//!  -4  SYSTEM       created by the system itself
//!  -5  DELETED      the referenced object was deleted
//! ```
//!
//! `DELETED` is deliberately not "special": a special id is a valid author,
//! while a deleted id is a consumed reference that can never be followed.

use serde::{Deserialize, Serialize};

/// A per-class recycle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub i64);

impl Id {
    /// Smallest standard id. Changing this breaks every stored hash.
    pub const FIRST: Id = Id(0);
    /// No id assigned.
    pub const UNSET: Id = Id(-1);
    /// Display-only marker.
    pub const EXCEPTIONAL: Id = Id(-2);
    /// Created by vote.
    pub const VOTE: Id = Id(-3);
    /// Created by the system.
    pub const SYSTEM: Id = Id(-4);
    /// Reference to an object that no longer exists.
    pub const DELETED: Id = Id(-5);

    /// The ids reported by [`Id::is_special`].
    pub const SPECIAL: [Id; 4] = [Id::UNSET, Id::EXCEPTIONAL, Id::VOTE, Id::SYSTEM];

    /// Encoded width of an id in bytes.
    pub const BYTES: usize = std::mem::size_of::<i64>();

    /// Wrap a raw value.
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw value.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// True for UNSET, EXCEPTIONAL, VOTE and SYSTEM. DELETED is not special.
    pub const fn is_special(self) -> bool {
        matches!(self.0, -4..=-1)
    }

    /// True for sequential ids handed out by an allocator.
    pub const fn is_standard(self) -> bool {
        self.0 >= Self::FIRST.0
    }

    /// True for the deleted-reference sentinel.
    pub const fn is_deleted(self) -> bool {
        self.0 == Self::DELETED.0
    }
}

/// Free-function form of [`Id::is_special`].
pub const fn is_special(id: Id) -> bool {
    id.is_special()
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Id::UNSET => write!(f, "unset"),
            Id::EXCEPTIONAL => write!(f, "exceptional"),
            Id::VOTE => write!(f, "vote"),
            Id::SYSTEM => write!(f, "system"),
            Id::DELETED => write!(f, "deleted"),
            Id(raw) => write!(f, "{}", raw),
        }
    }
}

impl From<i64> for Id {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sentinels_are_special_except_deleted() {
        for id in Id::SPECIAL {
            assert!(id.is_special(), "{} should be special", id);
            assert!(!id.is_standard());
        }
        assert!(!Id::DELETED.is_special());
        assert!(Id::DELETED.is_deleted());
        assert!(!Id::DELETED.is_standard());
    }

    #[test]
    fn standard_ids_start_at_zero() {
        assert!(Id::FIRST.is_standard());
        assert!(Id(42).is_standard());
        assert!(!Id(42).is_special());
    }

    #[test]
    fn display_names_sentinels() {
        assert_eq!(Id::VOTE.to_string(), "vote");
        assert_eq!(Id::DELETED.to_string(), "deleted");
        assert_eq!(Id(7).to_string(), "7");
    }

    proptest! {
        #[test]
        fn is_special_matches_sentinel_set(raw in any::<i64>()) {
            let expected = [-1i64, -2, -3, -4].contains(&raw);
            prop_assert_eq!(is_special(Id(raw)), expected);
        }

        #[test]
        fn special_and_standard_are_disjoint(raw in any::<i64>()) {
            let id = Id(raw);
            prop_assert!(!(id.is_special() && id.is_standard()));
        }
    }
}
