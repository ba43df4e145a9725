//! Transactional storage for objectivity state.
//!
//! Storage engines implement [`KvBackend`], a plain ordered key-value map
//! with atomic batch writes. [`ObjectStore`] layers typed transactions on
//! top: writes are staged in memory and applied as one batch when the
//! transaction closure returns `Ok`, and discarded otherwise.
//!
//! Keys:
//!
//! ```text
//! core                 ObjectivityCore
//! user:{id:020}        User
//! alloc:user           IdAllocator for users
//! ```

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use accord_identity::{ContentHash, Id, IdAllocator, IdOccupancy, ReferenceLookup, Validatable};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::ObjectivityCore;
use crate::error::{Error, Result};
use crate::user::User;

const CORE_KEY: &[u8] = b"core";
const USER_PREFIX: &str = "user:";
const USER_ALLOC_KEY: &[u8] = b"alloc:user";

/// A staged write. `None` deletes the key.
pub type WriteOp = (Vec<u8>, Option<Vec<u8>>);

/// Ordered key-value storage with atomic batches.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply all ops or none.
    fn apply(&self, batch: Vec<WriteOp>) -> Result<()>;
}

/// In-memory backend for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.map.read().map_err(|_| Error::Storage("memory store poisoned".into()))?;
        Ok(map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read().map_err(|_| Error::Storage("memory store poisoned".into()))?;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply(&self, batch: Vec<WriteOp>) -> Result<()> {
        let mut map = self.map.write().map_err(|_| Error::Storage("memory store poisoned".into()))?;
        for (key, value) in batch {
            match value {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Typed transactional store over a backend.
pub struct ObjectStore<B> {
    backend: B,
    /// Serializes write transactions.
    write_lock: Mutex<()>,
}

/// Store backed by [`MemoryBackend`].
pub type MemoryStore = ObjectStore<MemoryBackend>;

impl MemoryStore {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::default())
    }
}

impl<B: KvBackend> ObjectStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `f` against a read-only view.
    pub fn read_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T>,
    {
        let txn = Txn::new(&self.backend);
        f(&txn)
    }

    /// Run `f` and commit its writes if it returns `Ok`.
    pub fn write_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T>,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Storage("write lock poisoned".into()))?;
        let mut txn = Txn::new(&self.backend);
        let value = f(&mut txn)?;
        let batch = txn.into_batch();
        if !batch.is_empty() {
            self.backend.apply(batch)?;
        }
        Ok(value)
    }
}

/// A transaction: reads see its own staged writes.
///
/// Read transactions only ever hand out `&Txn`, so staging is unreachable
/// from them.
pub struct Txn<'a> {
    backend: &'a dyn KvBackend,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

fn user_key(id: Id) -> Vec<u8> {
    format!("{}{:020}", USER_PREFIX, id.raw()).into_bytes()
}

impl<'a> Txn<'a> {
    fn new(backend: &'a dyn KvBackend) -> Self {
        Self {
            backend,
            staged: BTreeMap::new(),
        }
    }

    fn into_batch(self) -> Vec<WriteOp> {
        self.staged.into_iter().collect()
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.staged.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.backend.get(key),
        }
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self.backend.scan_prefix(prefix)?.into_iter().collect();
        for (key, value) in self.staged.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged
            .values()
            .map(|bytes| serde_json::from_slice(bytes).map_err(Error::from))
            .collect()
    }

    fn put<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<()> {
        self.staged.insert(key, Some(serde_json::to_vec(value)?));
        Ok(())
    }

    fn remove(&mut self, key: Vec<u8>) {
        self.staged.insert(key, None);
    }

    // --- Core ---

    pub fn core(&self) -> Result<Option<ObjectivityCore>> {
        self.get(CORE_KEY)
    }

    pub fn save_core(&mut self, core: &ObjectivityCore) -> Result<()> {
        self.put(CORE_KEY.to_vec(), core)
    }

    // --- Users ---

    pub fn user(&self, id: Id) -> Result<Option<User>> {
        if !id.is_standard() {
            return Ok(None);
        }
        self.get(&user_key(id))
    }

    /// All users in id order.
    pub fn users(&self) -> Result<Vec<User>> {
        self.scan(USER_PREFIX.as_bytes())
    }

    pub fn user_ids(&self) -> Result<Vec<Id>> {
        Ok(self.users()?.into_iter().map(|u| u.id()).collect())
    }

    /// Content hash of every stored user.
    pub fn user_hashes(&self) -> Result<BTreeMap<Id, ContentHash>> {
        self.users()?
            .into_iter()
            .map(|u| -> Result<(Id, ContentHash)> { Ok((u.id(), u.content_hash()?)) })
            .collect()
    }

    /// Write a user record. Id bookkeeping is the caller's concern.
    pub fn save_user(&mut self, user: &User) -> Result<()> {
        if !user.id().is_standard() {
            return Err(Error::Invariant(format!("saving user with id {}", user.id())));
        }
        self.put(user_key(user.id()), user)
    }

    /// Remove a user record without touching referrers or the allocator.
    pub fn remove_user_record(&mut self, id: Id) {
        self.remove(user_key(id));
    }

    pub fn user_allocator(&self) -> Result<IdAllocator> {
        Ok(self.get(USER_ALLOC_KEY)?.unwrap_or_default())
    }

    pub fn save_user_allocator(&mut self, allocator: &IdAllocator) -> Result<()> {
        self.put(USER_ALLOC_KEY.to_vec(), allocator)
    }

    /// Mark `id` as held in the user allocator if it is not already.
    pub fn claim_user_id(&mut self, id: Id) -> Result<()> {
        let mut allocator = self.user_allocator()?;
        if !allocator.is_allocated(id) {
            allocator.claim(id)?;
            self.save_user_allocator(&allocator)?;
        }
        Ok(())
    }
}

impl ReferenceLookup for Txn<'_> {
    fn user_exists(&self, id: Id) -> accord_identity::Result<bool> {
        self.user(id)
            .map(|u| u.is_some())
            .map_err(|e| accord_identity::Error::Lookup(e.to_string()))
    }
}

impl IdOccupancy for Txn<'_> {
    fn id_in_use(&self, model: &'static str, id: Id) -> accord_identity::Result<bool> {
        let found = if model == ObjectivityCore::MODEL_NAME {
            self.core().map(|c| c.map(|c| c.header.id) == Some(id))
        } else if model == User::MODEL_NAME {
            self.user(id).map(|u| u.is_some())
        } else {
            Err(Error::Invariant(format!("unknown model {}", model)))
        };
        found.map_err(|e| accord_identity::Error::Lookup(e.to_string()))
    }
}
