//! Registered users.

use accord_identity::{
    content_hash, fields, ContentHash, ErrorKind, Id, ObjectHeader, ReferenceLookup, Validatable,
    ValidationResult,
};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

pub const NAME_MAX_CHARS: usize = 50;

const NAME: &str = "name";
const PUBLIC_KEY: &str = "public_key";

/// A user of the network. Users administer themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub header: ObjectHeader,
    pub name: String,
    #[serde(with = "key_serde")]
    pub public_key: [u8; 32],
}

impl User {
    pub fn id(&self) -> Id {
        self.header.id
    }

    pub fn content_hash(&self) -> accord_identity::Result<ContentHash> {
        content_hash(self)
    }

    fn validate_body(&self, result: &mut ValidationResult) {
        let chars = self.name.chars().count();
        if chars == 0 {
            result.add(NAME, ErrorKind::Empty);
        } else if chars > NAME_MAX_CHARS {
            result.add_detail(NAME, ErrorKind::TooLong, format!("{} chars", chars));
        }

        if VerifyingKey::from_bytes(&self.public_key).is_err() {
            result.add(PUBLIC_KEY, ErrorKind::Invalid);
        }

        if self.header.administrator != self.header.id {
            result.add_detail(
                fields::ADMINISTRATOR,
                ErrorKind::Invalid,
                "a user must administer itself",
            );
        }
    }
}

impl Validatable for User {
    const MODEL_NAME: &'static str = "user";

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }

    fn special_registerer_ids(&self) -> &'static [Id] {
        &[Id::SYSTEM]
    }

    fn administrator_is_self(&self) -> bool {
        true
    }

    fn validate_create_concrete(&self, result: &mut ValidationResult) {
        self.validate_body(result);
    }

    fn validate_update_concrete(&self, result: &mut ValidationResult) {
        self.validate_body(result);
    }

    fn validate_update_change_concrete(&self, old: &Self, result: &mut ValidationResult) {
        if self.public_key != old.public_key {
            result.add(PUBLIC_KEY, ErrorKind::ChangedImmutable);
        }
        if self.header.registerer != old.header.registerer {
            result.add(fields::REGISTERER, ErrorKind::ChangedImmutable);
        }
    }

    fn validate_reference_concrete(
        &self,
        _lookup: &dyn ReferenceLookup,
        _result: &mut ValidationResult,
    ) -> accord_identity::Result<()> {
        Ok(())
    }
}

/// Hex in JSON, raw bytes in the canonical encoding.
mod key_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(key))
        } else {
            serde::Serialize::serialize(key, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
            bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))
        } else {
            <[u8; 32]>::deserialize(deserializer)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use accord_identity::{validate_at_create, validate_at_update};
    use ed25519_dalek::SigningKey;

    pub(crate) fn key(seed: u8) -> [u8; 32] {
        SigningKey::from_bytes(&[seed; 32]).verifying_key().to_bytes()
    }

    pub(crate) fn user(id: i64, name: &str, registerer: Id) -> User {
        User {
            header: ObjectHeader {
                id: Id(id),
                registerer,
                administrator: Id(id),
                history_index: 1,
            },
            name: name.to_string(),
            public_key: key(id as u8),
        }
    }

    #[test]
    fn valid_user() {
        let u = user(3, "alice", Id::SYSTEM);
        assert!(validate_at_update(&u, None).is_valid());
    }

    #[test]
    fn unset_self_administration_passes_create() {
        let u = user(-1, "draft", Id::SYSTEM);
        assert!(validate_at_create(&u).is_valid());
    }

    #[test]
    fn name_length_bounds() {
        let u = user(3, "", Id::SYSTEM);
        assert!(validate_at_update(&u, None).has(NAME, ErrorKind::Empty));

        let long = "é".repeat(51);
        let u = user(3, &long, Id::SYSTEM);
        assert!(validate_at_update(&u, None).has(NAME, ErrorKind::TooLong));

        let max = "é".repeat(50);
        assert!(validate_at_update(&user(3, &max, Id::SYSTEM), None).is_valid());
    }

    #[test]
    fn administrator_must_be_self() {
        let mut u = user(3, "bob", Id::SYSTEM);
        u.header.administrator = Id(4);
        assert!(validate_at_update(&u, None).has(fields::ADMINISTRATOR, ErrorKind::Invalid));
    }

    #[test]
    fn vote_registerer_rejected() {
        let u = user(3, "bob", Id::VOTE);
        assert!(validate_at_update(&u, None).has(fields::REGISTERER, ErrorKind::Invalid));
    }

    #[test]
    fn public_key_is_immutable() {
        let old = user(3, "bob", Id::SYSTEM);
        let mut new = old.clone();
        new.public_key = key(99);
        new.header.history_index = 2;
        assert!(validate_at_update(&new, Some(&old)).has(PUBLIC_KEY, ErrorKind::ChangedImmutable));
    }

    #[test]
    fn json_uses_hex_key() {
        let u = user(3, "bob", Id::SYSTEM);
        let json = serde_json::to_value(&u).unwrap();
        assert_eq!(json["public_key"], hex::encode(u.public_key));
        let back: User = serde_json::from_value(json).unwrap();
        assert_eq!(back, u);
    }
}
