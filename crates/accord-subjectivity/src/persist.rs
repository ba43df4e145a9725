//! What survives a restart, and where it goes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use accord_identity::Id;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::neighbor::Edge;

/// Persisted local view. The tentative list is deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectivitySnapshot {
    pub confirmed: Vec<Edge>,
    pub powers: BTreeMap<Id, f64>,
    pub message_seq: u64,
    pub last_announced_addr: Option<SocketAddr>,
}

pub trait SubjectivityStore: Send + Sync {
    fn load(&self) -> Result<Option<SubjectivitySnapshot>>;
    fn save(&self, snapshot: &SubjectivitySnapshot) -> Result<()>;
}

/// Keeps the snapshot in memory. Useful for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemorySubjectivityStore {
    snapshot: Mutex<Option<SubjectivitySnapshot>>,
}

impl MemorySubjectivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: SubjectivitySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    pub fn saved(&self) -> Option<SubjectivitySnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SubjectivityStore for MemorySubjectivityStore {
    fn load(&self) -> Result<Option<SubjectivitySnapshot>> {
        Ok(self.saved())
    }

    fn save(&self, snapshot: &SubjectivitySnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }
}
