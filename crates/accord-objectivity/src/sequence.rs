//! Multi-step operations that keep ids and references consistent.
//!
//! Both sequences run inside a caller-supplied write transaction; returning
//! `Err` rolls every step back, including allocator changes.

use accord_identity::{
    on_reference_deleted, rewrite_deleted_reference, validate_at_create_specified_id,
    validate_reference, Id, ObjectHeader, ReferrerAction,
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::Txn;
use crate::user::User;

/// Input for [`create_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Specific id to claim; allocated when `None`.
    pub id: Option<Id>,
    pub name: String,
    pub public_key: [u8; 32],
    /// Defaults to the new user's own id.
    pub registerer: Option<Id>,
    pub history_index: u64,
}

/// Create a user, validate it and its references, and store it.
pub fn create_user(txn: &mut Txn<'_>, new: NewUser) -> Result<User> {
    let mut allocator = txn.user_allocator()?;
    let id = match new.id {
        Some(id) => id,
        None => allocator.allocate(),
    };

    let user = User {
        header: ObjectHeader {
            id,
            registerer: new.registerer.unwrap_or(id),
            administrator: id,
            history_index: new.history_index,
        },
        name: new.name,
        public_key: new.public_key,
    };

    let result = validate_at_create_specified_id(&user, &*txn)?;
    if !result.is_valid() {
        return Err(Error::Validation(result));
    }
    if new.id.is_some() {
        allocator.claim(id)?;
    }

    // Saved before the reference check so a self-registered user resolves.
    txn.save_user(&user)?;
    let result = validate_reference(&user, &*txn)?;
    if !result.is_valid() {
        return Err(Error::Validation(result));
    }
    txn.save_user_allocator(&allocator)?;

    info!(user = %id, name = %user.name, "user created");
    Ok(user)
}

/// Delete a user and everything that depends on it.
///
/// Users it registered are deleted as well; administrator references
/// (including the core's) are rewritten to [`Id::DELETED`]. Every deleted
/// id is released for recycling. Returns the deleted ids in deletion order.
pub fn delete_user(txn: &mut Txn<'_>, id: Id) -> Result<Vec<Id>> {
    if txn.user(id)?.is_none() {
        return Err(Error::NotFound(format!("user {}", id)));
    }

    let mut allocator = txn.user_allocator()?;
    let mut queue = vec![id];
    let mut deleted = Vec::new();

    while let Some(target) = queue.pop() {
        if deleted.contains(&target) || txn.user(target)?.is_none() {
            continue;
        }
        txn.remove_user_record(target);
        deleted.push(target);

        for mut referrer in txn.users()? {
            match on_reference_deleted(&referrer, target) {
                Some(ReferrerAction::Cascade) => queue.push(referrer.id()),
                Some(ReferrerAction::Rewrite) => {
                    rewrite_deleted_reference(&mut referrer, target);
                    txn.save_user(&referrer)?;
                }
                None => {}
            }
        }

        if let Some(mut core) = txn.core()? {
            if on_reference_deleted(&core, target).is_some() {
                rewrite_deleted_reference(&mut core, target);
                txn.save_core(&core)?;
                debug!(user = %target, "core administrator rewritten to deleted");
            }
        }

        if allocator.is_allocated(target) {
            allocator.release(target)?;
        }
    }

    txn.save_user_allocator(&allocator)?;
    info!(user = %id, cascaded = deleted.len() - 1, "user deleted");
    Ok(deleted)
}
