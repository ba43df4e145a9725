//! Persistent storage using RocksDB.
//!
//! One database holds the objectivity keys (see `accord_objectivity`), the
//! saved local view and the node's signing key.

use std::path::Path;
use std::sync::Arc;

use accord_objectivity::{KvBackend, WriteOp};
use accord_subjectivity::{SubjectivitySnapshot, SubjectivityStore};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use rocksdb::{Options, WriteBatch, DB};

use crate::error::{Error, Result};

const NODE_KEY: &[u8] = b"node:signing_key";
const VIEW_KEY: &[u8] = b"view:snapshot";

/// Shared handle to the node's database.
#[derive(Clone)]
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Get or create the node's signing key (persistent identity).
    pub fn get_or_create_node_key(&self) -> Result<SigningKey> {
        if let Some(data) = self.db.get(NODE_KEY)? {
            let bytes: [u8; 32] = data
                .as_slice()
                .try_into()
                .map_err(|_| Error::Storage("Invalid stored key".into()))?;
            Ok(SigningKey::from_bytes(&bytes))
        } else {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            let signing_key = SigningKey::from_bytes(&bytes);
            self.db.put(NODE_KEY, signing_key.as_bytes())?;
            Ok(signing_key)
        }
    }
}

fn objectivity_err(e: rocksdb::Error) -> accord_objectivity::Error {
    accord_objectivity::Error::Storage(e.to_string())
}

impl KvBackend for Storage {
    fn get(&self, key: &[u8]) -> accord_objectivity::Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(objectivity_err)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> accord_objectivity::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.db.prefix_iterator(prefix) {
            let (key, value) = item.map_err(objectivity_err)?;
            if key.starts_with(prefix) {
                entries.push((key.to_vec(), value.to_vec()));
            } else {
                break;
            }
        }
        Ok(entries)
    }

    fn apply(&self, batch: Vec<WriteOp>) -> accord_objectivity::Result<()> {
        let mut write = WriteBatch::default();
        for (key, value) in batch {
            match value {
                Some(v) => write.put(key, v),
                None => write.delete(key),
            }
        }
        self.db.write(write).map_err(objectivity_err)
    }
}

impl SubjectivityStore for Storage {
    fn load(&self) -> accord_subjectivity::Result<Option<SubjectivitySnapshot>> {
        let data = self
            .db
            .get(VIEW_KEY)
            .map_err(|e| accord_subjectivity::Error::Storage(e.to_string()))?;
        match data {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| accord_subjectivity::Error::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &SubjectivitySnapshot) -> accord_subjectivity::Result<()> {
        let value = serde_json::to_vec(snapshot)
            .map_err(|e| accord_subjectivity::Error::Storage(e.to_string()))?;
        self.db
            .put(VIEW_KEY, value)
            .map_err(|e| accord_subjectivity::Error::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_identity::Id;
    use accord_objectivity::{create_user, NewUser, ObjectStore};
    use tempfile::TempDir;

    fn temp_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_node_key_is_stable() {
        let (dir, storage) = temp_storage();
        let first = storage.get_or_create_node_key().unwrap();
        drop(storage);

        let reopened = Storage::open(dir.path()).unwrap();
        let second = reopened.get_or_create_node_key().unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let (_dir, storage) = temp_storage();
        storage
            .apply(vec![
                (b"user:1".to_vec(), Some(b"a".to_vec())),
                (b"user:2".to_vec(), Some(b"b".to_vec())),
                (b"usez".to_vec(), Some(b"c".to_vec())),
                (b"alloc:user".to_vec(), Some(b"d".to_vec())),
            ])
            .unwrap();
        let entries = storage.scan_prefix(b"user:").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"user:1".to_vec());

        storage.apply(vec![(b"user:1".to_vec(), None)]).unwrap();
        assert_eq!(storage.scan_prefix(b"user:").unwrap().len(), 1);
        assert_eq!(storage.get(b"user:1").unwrap(), None);
    }

    #[test]
    fn test_object_store_over_rocksdb() {
        let (_dir, storage) = temp_storage();
        let store = ObjectStore::new(storage);
        let user = store
            .write_in_transaction(|txn| {
                create_user(
                    txn,
                    NewUser {
                        id: None,
                        name: "alice".into(),
                        public_key: SigningKey::from_bytes(&[1; 32]).verifying_key().to_bytes(),
                        registerer: None,
                        history_index: 1,
                    },
                )
            })
            .unwrap();
        assert_eq!(user.id(), Id(0));

        let loaded = store.read_in_transaction(|txn| txn.user(Id(0))).unwrap();
        assert_eq!(loaded, Some(user));
    }

    #[test]
    fn test_view_snapshot_roundtrip_and_absence() {
        let (_dir, storage) = temp_storage();
        assert_eq!(storage.load().unwrap(), None);

        let mut snapshot = SubjectivitySnapshot::default();
        snapshot.message_seq = 42;
        snapshot.powers.insert(Id(2), 0.75);
        storage.save(&snapshot).unwrap();
        assert_eq!(storage.load().unwrap(), Some(snapshot));
    }
}
