//! Requests served by every node for catch-up.

use std::collections::BTreeMap;

use accord_catchup::Request;
use accord_identity::{ContentHash, Id};
use serde::{Deserialize, Serialize};

use crate::core::ObjectivityCore;
use crate::user::User;

/// Most users fetched by one request.
pub const MAX_USERS_PER_REQUEST: usize = 64;

/// Ask for the peer's core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCore {}

impl Request for GetCore {
    type Response = Option<ObjectivityCore>;
    const KIND: &'static str = "get_core";
}

/// Ask for specific users. Unknown ids are silently skipped by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUsers {
    pub ids: Vec<Id>,
}

impl Request for GetUsers {
    type Response = Vec<User>;
    const KIND: &'static str = "get_users";
}

/// Ask for the peer's current state hashes, used to build majorities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStateHashes {}

/// Hash summary of a node's objectivity state.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateHashes {
    pub core: Option<ContentHash>,
    pub users: BTreeMap<Id, ContentHash>,
}

impl Request for GetStateHashes {
    type Response = StateHashes;
    const KIND: &'static str = "get_state_hashes";
}
