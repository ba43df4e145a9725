//! The objectivity core: network-wide configuration, one per network.

use std::time::Duration;

use accord_identity::{
    content_hash, fields, ContentHash, ErrorKind, Id, ObjectHeader, ReferenceLookup, Validatable,
    ValidationResult,
};
use serde::{Deserialize, Serialize};

/// The core always carries this id.
pub const CORE_ID: Id = Id::FIRST;

pub const MIN_CATCH_UP_INTERVAL_SECS: u64 = 1;
pub const MAX_CATCH_UP_INTERVAL_SECS: u64 = 60 * 60;
pub const MAX_MAJORITY_SAMPLE: u32 = 64;
pub const MAX_NEIGHBOR_CAPACITY: u32 = 2000;
pub const MIN_TENTATIVE_TTL_SECS: u64 = 60;

/// Tunables every node must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectivityCoreConfig {
    pub catch_up_interval_secs: u64,
    /// Peers polled when building a majority snapshot.
    pub majority_sample_size: u32,
    pub neighbor_capacity: u32,
    pub tentative_ttl_secs: u64,
}

impl Default for ObjectivityCoreConfig {
    fn default() -> Self {
        Self {
            catch_up_interval_secs: 5,
            majority_sample_size: 8,
            neighbor_capacity: MAX_NEIGHBOR_CAPACITY,
            tentative_ttl_secs: 10 * 60,
        }
    }
}

impl ObjectivityCoreConfig {
    pub fn catch_up_interval(&self) -> Duration {
        Duration::from_secs(self.catch_up_interval_secs)
    }

    pub fn tentative_ttl(&self) -> Duration {
        Duration::from_secs(self.tentative_ttl_secs)
    }

    fn validate(&self, result: &mut ValidationResult) {
        if !(MIN_CATCH_UP_INTERVAL_SECS..=MAX_CATCH_UP_INTERVAL_SECS).contains(&self.catch_up_interval_secs) {
            result.add_detail(
                "catch_up_interval_secs",
                ErrorKind::OutOfRange,
                self.catch_up_interval_secs.to_string(),
            );
        }
        if !(1..=MAX_MAJORITY_SAMPLE).contains(&self.majority_sample_size) {
            result.add_detail(
                "majority_sample_size",
                ErrorKind::OutOfRange,
                self.majority_sample_size.to_string(),
            );
        }
        if !(1..=MAX_NEIGHBOR_CAPACITY).contains(&self.neighbor_capacity) {
            result.add_detail(
                "neighbor_capacity",
                ErrorKind::OutOfRange,
                self.neighbor_capacity.to_string(),
            );
        }
        if self.tentative_ttl_secs < MIN_TENTATIVE_TTL_SECS {
            result.add_detail(
                "tentative_ttl_secs",
                ErrorKind::OutOfRange,
                self.tentative_ttl_secs.to_string(),
            );
        }
    }
}

/// The single consensus object holding network configuration.
///
/// Compared across nodes by content hash only and replaced whole on
/// catch-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectivityCore {
    pub header: ObjectHeader,
    pub config: ObjectivityCoreConfig,
}

impl ObjectivityCore {
    /// First core of a network, registered by the system.
    pub fn genesis(administrator: Id, config: ObjectivityCoreConfig) -> Self {
        Self {
            header: ObjectHeader {
                id: CORE_ID,
                registerer: Id::SYSTEM,
                administrator,
                history_index: 0,
            },
            config,
        }
    }

    pub fn content_hash(&self) -> accord_identity::Result<ContentHash> {
        content_hash(self)
    }
}

impl Validatable for ObjectivityCore {
    const MODEL_NAME: &'static str = "core";

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }

    fn special_registerer_ids(&self) -> &'static [Id] {
        &[Id::SYSTEM]
    }

    fn registerer_restricted_to_special(&self) -> bool {
        true
    }

    fn special_administrator_ids(&self) -> &'static [Id] {
        &[Id::VOTE, Id::DELETED]
    }

    fn validate_create_concrete(&self, result: &mut ValidationResult) {
        self.validate_update_concrete(result);
    }

    fn validate_update_concrete(&self, result: &mut ValidationResult) {
        if self.header.id != CORE_ID {
            result.add_detail(fields::ID, ErrorKind::Invalid, format!("core id must be {}", CORE_ID));
        }
        self.config.validate(result);
    }

    fn validate_update_change_concrete(&self, old: &Self, result: &mut ValidationResult) {
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
