//! Subjectivity: this node's own, non-replicated view of the network
//!
//! Unlike objectivity, nothing here is agreed with other nodes. The view
//! holds who we are, which peers we trust and how much, and keeps that
//! fresh through four periodic tasks:
//!
//! - neighbor notification (20 min)
//! - neighbor-address discovery and pruning (1 min)
//! - tentative expiry sweep (10 min)
//! - key-exchange refresh (1 h)
//!
//! [`Subjectivity`] also implements `accord_catchup::PeerSelector`, so
//! catch-up machines pick their peers from the confirmed neighbor list.

pub mod config;
mod error;
pub mod neighbor;
mod network;
mod persist;
mod powers;
mod scheduler;
mod view;

pub use config::{SubjectivityConfig, NEIGHBOR_MAX};
pub use error::{Error, Result};
pub use neighbor::{now_millis, Edge, InsertOutcome, NeighborList, MIN_POWER};
pub use network::{Acquaintance, NodeIdentity, PeerAdvert, PeerNetwork};
pub use persist::{MemorySubjectivityStore, SubjectivitySnapshot, SubjectivityStore};
pub use powers::{Powers, DEFAULT_POWER};
pub use scheduler::PeriodicTask;
pub use view::{LocalIdentity, Subjectivity};
