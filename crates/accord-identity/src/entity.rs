//! Replicated object header and the staged validation pipeline.
//!
//! Each family implements [`Validatable`]: it declares its special-id policy
//! and supplies four hooks. The free functions in this module run the common
//! checks first and then the family hook, so every family is validated the
//! same way at each stage.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::Id;
use crate::reference::{IdOccupancy, ReferenceLookup, ReferenceRole, ReferrerAction};
use crate::validation::{fields, ErrorKind, ValidationResult};

/// Fields every replicated object carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub id: Id,
    pub registerer: Id,
    pub administrator: Id,
    /// Position in the replicated history at which the object was last written.
    pub history_index: u64,
}

impl ObjectHeader {
    /// Header for an object that has not been created yet.
    pub fn unset() -> Self {
        Self {
            id: Id::UNSET,
            registerer: Id::UNSET,
            administrator: Id::UNSET,
            history_index: 0,
        }
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::unset()
    }
}

/// A replicated object family.
pub trait Validatable: Sized {
    /// Class name used for id occupancy and logs.
    const MODEL_NAME: &'static str;

    fn header(&self) -> &ObjectHeader;
    fn header_mut(&mut self) -> &mut ObjectHeader;

    /// Special ids accepted as registerer.
    fn special_registerer_ids(&self) -> &'static [Id] {
        &[]
    }

    /// Special ids accepted as administrator.
    fn special_administrator_ids(&self) -> &'static [Id] {
        &[]
    }

    /// When true, a registerer outside the special list is invalid.
    fn registerer_restricted_to_special(&self) -> bool {
        false
    }

    /// When true, an administrator outside the special list is invalid.
    fn administrator_restricted_to_special(&self) -> bool {
        false
    }

    /// The object administers itself: administrator equal to its own id is
    /// always accepted and never looked up.
    fn administrator_is_self(&self) -> bool {
        false
    }

    /// Reaction to deletion of the object referenced through `role`.
    fn deletion_policy(&self, role: ReferenceRole) -> ReferrerAction {
        match role {
            ReferenceRole::Registerer => ReferrerAction::Cascade,
            ReferenceRole::Administrator => ReferrerAction::Rewrite,
        }
    }

    fn validate_create_concrete(&self, result: &mut ValidationResult);

    fn validate_update_concrete(&self, result: &mut ValidationResult);

    /// Checks comparing this version with the previous one.
    fn validate_update_change_concrete(&self, old: &Self, result: &mut ValidationResult);

    fn validate_reference_concrete(
        &self,
        lookup: &dyn ReferenceLookup,
        result: &mut ValidationResult,
    ) -> Result<()>;

    /// Standard ids this object points at, by role.
    fn references(&self) -> Vec<(ReferenceRole, Id)> {
        let h = self.header();
        let mut refs = Vec::with_capacity(2);
        if h.registerer.is_standard() {
            refs.push((ReferenceRole::Registerer, h.registerer));
        }
        if h.administrator.is_standard() && !(self.administrator_is_self() && h.administrator == h.id) {
            refs.push((ReferenceRole::Administrator, h.administrator));
        }
        refs
    }
}

fn check_author(
    field: &'static str,
    value: Id,
    allowed: &[Id],
    restricted: bool,
    result: &mut ValidationResult,
) {
    if allowed.contains(&value) {
        return;
    }
    if value == Id::UNSET {
        result.add(field, ErrorKind::Empty);
        return;
    }
    if restricted {
        result.add_detail(field, ErrorKind::Invalid, format!("{} is not an allowed special id", value));
        return;
    }
    if !value.is_standard() {
        result.add_detail(field, ErrorKind::Invalid, format!("{} is not a standard id", value));
    }
}

fn validate_common<E: Validatable>(entity: &E, result: &mut ValidationResult) {
    let h = entity.header();
    check_author(
        fields::REGISTERER,
        h.registerer,
        entity.special_registerer_ids(),
        entity.registerer_restricted_to_special(),
        result,
    );
    if entity.administrator_is_self() && h.administrator == h.id {
        return;
    }
    check_author(
        fields::ADMINISTRATOR,
        h.administrator,
        entity.special_administrator_ids(),
        entity.administrator_restricted_to_special(),
        result,
    );
}

/// Validate a new object whose id will be allocated.
pub fn validate_at_create<E: Validatable>(entity: &E) -> ValidationResult {
    let mut result = ValidationResult::new();
    validate_common(entity, &mut result);
    let id = entity.header().id;
    if id != Id::UNSET {
        result.add_detail(fields::ID, ErrorKind::Invalid, format!("expected unset id, got {}", id));
    }
    entity.validate_create_concrete(&mut result);
    result
}

/// Validate a new object that arrives with its id already chosen.
pub fn validate_at_create_specified_id<E: Validatable, O: IdOccupancy + ?Sized>(
    entity: &E,
    occupancy: &O,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();
    validate_common(entity, &mut result);
    let id = entity.header().id;
    if !id.is_standard() {
        result.add_detail(fields::ID, ErrorKind::Invalid, format!("{} is not a standard id", id));
    } else if occupancy.id_in_use(E::MODEL_NAME, id)? {
        result.add_detail(fields::ID, ErrorKind::IdInUse, id.to_string());
    }
    entity.validate_create_concrete(&mut result);
    Ok(result)
}

/// Validate a new version of an existing object.
///
/// Without `old` only the structural checks run.
pub fn validate_at_update<E: Validatable>(entity: &E, old: Option<&E>) -> ValidationResult {
    let mut result = ValidationResult::new();
    validate_common(entity, &mut result);
    let h = entity.header();
    if !h.id.is_standard() {
        result.add_detail(fields::ID, ErrorKind::Invalid, format!("{} is not a standard id", h.id));
    }
    entity.validate_update_concrete(&mut result);

    if let Some(old) = old {
        let oh = old.header();
        if oh.id != h.id {
            result.add_detail(fields::ID, ErrorKind::ChangedImmutable, format!("{} -> {}", oh.id, h.id));
        }
        if h.history_index < oh.history_index {
            result.add_detail(
                fields::HISTORY_INDEX,
                ErrorKind::Regressed,
                format!("{} -> {}", oh.history_index, h.history_index),
            );
        }
        entity.validate_update_change_concrete(old, &mut result);
    }
    result
}

/// Accept an object received during catch-up.
///
/// Passes when it is valid either as a creation with a specified id or as a
/// structural update.
pub fn validate_at_catch_up<E: Validatable, O: IdOccupancy + ?Sized>(
    entity: &E,
    occupancy: &O,
) -> Result<bool> {
    if validate_at_create_specified_id(entity, occupancy)?.is_valid() {
        return Ok(true);
    }
    Ok(validate_at_update(entity, None).is_valid())
}

/// Check that every standard id the object references exists.
pub fn validate_reference<E: Validatable, L: ReferenceLookup + ?Sized>(
    entity: &E,
    lookup: &L,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();
    let h = entity.header();

    if !entity.special_registerer_ids().contains(&h.registerer)
        && h.registerer.is_standard()
        && !lookup.user_exists(h.registerer)?
    {
        result.add_detail(fields::REGISTERER, ErrorKind::NotFoundReference, h.registerer.to_string());
    }

    let self_admin = entity.administrator_is_self() && h.administrator == h.id;
    if !self_admin
        && !entity.special_administrator_ids().contains(&h.administrator)
        && h.administrator.is_standard()
        && !lookup.user_exists(h.administrator)?
    {
        result.add_detail(
            fields::ADMINISTRATOR,
            ErrorKind::NotFoundReference,
            h.administrator.to_string(),
        );
    }

    entity.validate_reference_concrete(&LookupRef(lookup), &mut result)?;
    Ok(result)
}

struct LookupRef<'a, L: ?Sized>(&'a L);

impl<L: ReferenceLookup + ?Sized> ReferenceLookup for LookupRef<'_, L> {
    fn user_exists(&self, id: Id) -> Result<bool> {
        self.0.user_exists(id)
    }
}

/// How this object reacts to deletion of `deleted`, if it refers to it.
///
/// Cascade wins when the object refers to `deleted` through several roles.
pub fn on_reference_deleted<E: Validatable>(entity: &E, deleted: Id) -> Option<ReferrerAction> {
    entity
        .references()
        .into_iter()
        .filter(|(_, id)| *id == deleted)
        .map(|(role, _)| entity.deletion_policy(role))
        .max()
}

/// Replace every reference to `deleted` with [`Id::DELETED`].
pub fn rewrite_deleted_reference<E: Validatable>(entity: &mut E, deleted: Id) {
    let h = entity.header_mut();
    if h.registerer == deleted {
        h.registerer = Id::DELETED;
    }
    if h.administrator == deleted {
        h.administrator = Id::DELETED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[derive(Debug, Clone)]
    struct Note {
        header: ObjectHeader,
        text: String,
    }

    impl Validatable for Note {
        const MODEL_NAME: &'static str = "note";

        fn header(&self) -> &ObjectHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut ObjectHeader {
            &mut self.header
        }

        fn special_registerer_ids(&self) -> &'static [Id] {
            &[Id::SYSTEM]
        }

        fn special_administrator_ids(&self) -> &'static [Id] {
            &[Id::VOTE]
        }

        fn validate_create_concrete(&self, result: &mut ValidationResult) {
            self.validate_update_concrete(result);
        }

        fn validate_update_concrete(&self, result: &mut ValidationResult) {
            if self.text.is_empty() {
                result.add("text", ErrorKind::Empty);
            }
        }

        fn validate_update_change_concrete(&self, _old: &Self, _result: &mut ValidationResult) {}

        fn validate_reference_concrete(
            &self,
            _lookup: &dyn ReferenceLookup,
            _result: &mut ValidationResult,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        users: BTreeSet<i64>,
        notes: BTreeSet<i64>,
    }

    impl ReferenceLookup for Fixture {
        fn user_exists(&self, id: Id) -> Result<bool> {
            Ok(self.users.contains(&id.raw()))
        }
    }

    impl IdOccupancy for Fixture {
        fn id_in_use(&self, model: &'static str, id: Id) -> Result<bool> {
            assert_eq!(model, "note");
            Ok(self.notes.contains(&id.raw()))
        }
    }

    struct Broken;

    impl ReferenceLookup for Broken {
        fn user_exists(&self, _id: Id) -> Result<bool> {
            Err(Error::Lookup("disk gone".into()))
        }
    }

    fn note(id: i64, registerer: Id, administrator: Id) -> Note {
        Note {
            header: ObjectHeader {
                id: Id(id),
                registerer,
                administrator,
                history_index: 1,
            },
            text: "hello".into(),
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            users: [0, 1, 2].into_iter().collect(),
            notes: [5].into_iter().collect(),
        }
    }

    #[test]
    fn create_requires_unset_id() {
        let ok = note(-1, Id::SYSTEM, Id(1));
        assert!(validate_at_create(&ok).is_valid());

        let bad = note(3, Id::SYSTEM, Id(1));
        assert!(validate_at_create(&bad).has(fields::ID, ErrorKind::Invalid));
    }

    #[test]
    fn unset_author_is_empty() {
        let n = note(-1, Id::UNSET, Id(1));
        let r = validate_at_create(&n);
        assert!(r.has(fields::REGISTERER, ErrorKind::Empty));
    }

    #[test]
    fn disallowed_special_author_is_invalid() {
        let n = note(-1, Id::VOTE, Id::SYSTEM);
        let r = validate_at_create(&n);
        assert!(r.has(fields::REGISTERER, ErrorKind::Invalid));
        assert!(r.has(fields::ADMINISTRATOR, ErrorKind::Invalid));
    }

    #[test]
    fn specified_id_collision() {
        let f = fixture();
        let free = note(6, Id::SYSTEM, Id(1));
        assert!(validate_at_create_specified_id(&free, &f).unwrap().is_valid());

        let taken = note(5, Id::SYSTEM, Id(1));
        let r = validate_at_create_specified_id(&taken, &f).unwrap();
        assert!(r.has(fields::ID, ErrorKind::IdInUse));
    }

    #[test]
    fn update_change_checks() {
        let old = note(5, Id::SYSTEM, Id(1));
        let mut new = old.clone();
        new.header.history_index = 0;
        let r = validate_at_update(&new, Some(&old));
        assert!(r.has(fields::HISTORY_INDEX, ErrorKind::Regressed));

        let mut moved = old.clone();
        moved.header.id = Id(6);
        let r = validate_at_update(&moved, Some(&old));
        assert!(r.has(fields::ID, ErrorKind::ChangedImmutable));

        assert!(validate_at_update(&old, Some(&old)).is_valid());
    }

    #[test]
    fn catch_up_accepts_existing_id_as_update() {
        let f = fixture();
        let existing = note(5, Id::SYSTEM, Id(1));
        assert!(validate_at_catch_up(&existing, &f).unwrap());

        let mut broken = existing.clone();
        broken.text.clear();
        assert!(!validate_at_catch_up(&broken, &f).unwrap());
    }

    #[test]
    fn reference_skips_specials_and_flags_missing() {
        let f = fixture();
        let ok = note(5, Id::SYSTEM, Id::VOTE);
        assert!(validate_reference(&ok, &f).unwrap().is_valid());

        let missing = note(5, Id(9), Id(8));
        let r = validate_reference(&missing, &f).unwrap();
        assert!(r.has(fields::REGISTERER, ErrorKind::NotFoundReference));
        assert!(r.has(fields::ADMINISTRATOR, ErrorKind::NotFoundReference));
    }

    /// A note that administers itself.
    #[derive(Debug, Clone)]
    struct Member(Note);

    impl Validatable for Member {
        const MODEL_NAME: &'static str = "member";

        fn header(&self) -> &ObjectHeader {
            &self.0.header
        }

        fn header_mut(&mut self) -> &mut ObjectHeader {
            &mut self.0.header
        }

        fn special_registerer_ids(&self) -> &'static [Id] {
            &[Id::SYSTEM]
        }

        fn administrator_is_self(&self) -> bool {
            true
        }

        fn validate_create_concrete(&self, result: &mut ValidationResult) {
            self.0.validate_create_concrete(result);
        }

        fn validate_update_concrete(&self, result: &mut ValidationResult) {
            self.0.validate_update_concrete(result);
        }

        fn validate_update_change_concrete(&self, old: &Self, result: &mut ValidationResult) {
            self.0.validate_update_change_concrete(&old.0, result);
        }

        fn validate_reference_concrete(
            &self,
            lookup: &dyn ReferenceLookup,
            result: &mut ValidationResult,
        ) -> Result<()> {
            self.0.validate_reference_concrete(lookup, result)
        }
    }

    #[test]
    fn self_administration_only_covers_own_id() {
        let f = fixture();
        let own = Member(note(7, Id::SYSTEM, Id(7)));
        assert!(validate_reference(&own, &f).unwrap().is_valid());

        let other = Member(note(7, Id::SYSTEM, Id(9)));
        let r = validate_reference(&other, &f).unwrap();
        assert!(r.has(fields::ADMINISTRATOR, ErrorKind::NotFoundReference));

        let existing = Member(note(7, Id::SYSTEM, Id(2)));
        assert!(validate_reference(&existing, &f).unwrap().is_valid());
    }

    #[test]
    fn reference_lookup_failure_is_an_error() {
        let n = note(5, Id(1), Id(1));
        assert!(matches!(validate_reference(&n, &Broken), Err(Error::Lookup(_))));
    }

    #[test]
    fn deletion_reactions() {
        let n = note(5, Id(1), Id(2));
        assert_eq!(on_reference_deleted(&n, Id(1)), Some(ReferrerAction::Cascade));
        assert_eq!(on_reference_deleted(&n, Id(2)), Some(ReferrerAction::Rewrite));
        assert_eq!(on_reference_deleted(&n, Id(3)), None);

        let both = note(5, Id(1), Id(1));
        assert_eq!(on_reference_deleted(&both, Id(1)), Some(ReferrerAction::Cascade));

        let mut m = n.clone();
        rewrite_deleted_reference(&mut m, Id(2));
        assert_eq!(m.header.administrator, Id::DELETED);
        assert_eq!(m.header.registerer, Id(1));
    }

    fn arb_id() -> impl Strategy<Value = Id> {
        prop_oneof![
            (-6i64..10).prop_map(Id),
            Just(Id::SYSTEM),
            Just(Id::VOTE),
        ]
    }

    proptest! {
        #[test]
        fn catch_up_is_create_specified_or_update(
            id in arb_id(),
            registerer in arb_id(),
            administrator in arb_id(),
            empty_text in any::<bool>(),
        ) {
            let f = fixture();
            let mut n = note(id.raw(), registerer, administrator);
            if empty_text {
                n.text.clear();
            }
            let expected = validate_at_create_specified_id(&n, &f).unwrap().is_valid()
                || validate_at_update(&n, None).is_valid();
            prop_assert_eq!(validate_at_catch_up(&n, &f).unwrap(), expected);
        }
    }
}
