//! Objectivity: replicated, consensus-critical state
//!
//! Every node holds the same objectivity state once it has caught up with
//! the network majority. This crate defines what that state is and how it
//! is stored and repaired:
//!
//! - [`ObjectivityCore`]: the single network configuration object
//! - [`User`]: registered users, the first id-recycled family
//! - [`ObjectStore`]: transactional storage over any [`KvBackend`]
//! - [`create_user`] / [`delete_user`]: sequences keeping ids and
//!   references consistent
//! - [`CoreCatchUp`] / [`UserCatchUp`]: strategies plugged into
//!   `accord_catchup::CatchUpMachine`

mod catchup;
mod core;
mod error;
mod messages;
mod sequence;
mod store;
mod user;

pub use crate::core::{ObjectivityCore, ObjectivityCoreConfig, CORE_ID};
pub use catchup::{local_state_hashes, CoreCatchUp, UserCatchUp};
pub use error::{Error, Result};
pub use messages::{GetCore, GetStateHashes, GetUsers, StateHashes, MAX_USERS_PER_REQUEST};
pub use sequence::{create_user, delete_user, NewUser};
pub use store::{KvBackend, MemoryBackend, MemoryStore, ObjectStore, Txn, WriteOp};
pub use user::{User, NAME_MAX_CHARS};
