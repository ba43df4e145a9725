//! Owns the catch-up machines and feeds them majorities.
//!
//! Ticks and resets for both machines are serialized behind one mutex. The
//! majority is sampled outside the lock, so a slow sample never delays a
//! tick.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use accord_catchup::{CatchUpMachine, CatchUpState, CatchUpStatus, PeerSelector};
use accord_identity::{ContentHash, Id};
use accord_objectivity::{CoreCatchUp, KvBackend, ObjectStore, UserCatchUp};
use accord_subjectivity::Subjectivity;
use tracing::{error, info};

use crate::majority::{Majorities, MajorityOracle};
use crate::transport::TcpTransport;

struct Machines<B: KvBackend + 'static> {
    core: CatchUpMachine<CoreCatchUp<B>>,
    users: CatchUpMachine<UserCatchUp<B>>,
    core_majority: Option<ContentHash>,
    user_majority: Option<BTreeMap<Id, ContentHash>>,
}

pub struct CatchUpDriver<B: KvBackend + 'static> {
    machines: Mutex<Machines<B>>,
    oracle: MajorityOracle,
}

impl<B: KvBackend + 'static> CatchUpDriver<B> {
    pub fn new(
        store: Arc<ObjectStore<B>>,
        view: Arc<Subjectivity>,
        transport: TcpTransport,
        sample_size: usize,
    ) -> Self {
        let selector: Arc<dyn PeerSelector> = view.clone();
        let wire = Arc::new(transport.clone());
        let machines = Machines {
            core: CatchUpMachine::new(CoreCatchUp::new(store.clone()), selector.clone(), wire.clone()),
            users: CatchUpMachine::new(UserCatchUp::new(store), selector, wire),
            core_majority: None,
            user_majority: None,
        };
        Self {
            machines: Mutex::new(machines),
            oracle: MajorityOracle::new(transport, view, sample_size),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Machines<B>> {
        self.machines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sample the network and install whatever majorities it yields.
    pub async fn refresh_majority(&self) {
        let majorities = self.oracle.sample().await;
        self.install(majorities);
    }

    /// Reset a machine when its majority value changed or it is faulted.
    pub fn install(&self, majorities: Majorities) {
        let mut m = self.lock();
        if let Some(core) = majorities.core {
            if m.core_majority.as_ref() != Some(&core.value) || m.core.state() == CatchUpState::Faulted {
                info!("Core majority {} from {} peers", core.value, core.contributors.len());
                m.core_majority = Some(core.value);
                m.core.reset(core);
            }
        }
        if let Some(users) = majorities.users {
            if m.user_majority.as_ref() != Some(&users.value)
                || m.users.state() == CatchUpState::Faulted
            {
                info!(
                    "User majority of {} users from {} peers",
                    users.value.len(),
                    users.contributors.len()
                );
                m.user_majority = Some(users.value.clone());
                m.users.reset(users);
            }
        }
    }

    /// Tick both machines once.
    pub fn tick(&self) -> (CatchUpState, CatchUpState) {
        let mut m = self.lock();
        let core = m.core.tick().unwrap_or_else(|e| {
            error!(family = "core", error = %e, "Catch-up faulted");
            CatchUpState::Faulted
        });
        let users = m.users.tick().unwrap_or_else(|e| {
            error!(family = "user", error = %e, "Catch-up faulted");
            CatchUpState::Faulted
        });
        (core, users)
    }

    pub fn states(&self) -> (CatchUpState, CatchUpState) {
        let m = self.lock();
        (m.core.state(), m.users.state())
    }

    pub fn statuses(&self) -> Vec<CatchUpStatus> {
        let m = self.lock();
        vec![m.core.status(), m.users.status()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_catchup::{MajorityAtStart, NodeId};
    use accord_objectivity::{MemoryStore, ObjectivityCore, ObjectivityCoreConfig};
    use accord_subjectivity::{
        Acquaintance, LocalIdentity, MemorySubjectivityStore, NodeIdentity, PeerAdvert,
        PeerNetwork, Result as ViewResult, SubjectivityConfig,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct Offline;

    #[async_trait]
    impl PeerNetwork for Offline {
        async fn notify(&self, _: &NodeIdentity, _: accord_catchup::PeerEdge) -> ViewResult<()> {
            Ok(())
        }
        async fn discover(&self, _: accord_catchup::PeerEdge) -> ViewResult<Vec<PeerAdvert>> {
            Ok(Vec::new())
        }
        async fn acquaint(
            &self,
            _: &NodeIdentity,
            _: accord_catchup::PeerEdge,
        ) -> ViewResult<Acquaintance> {
            Err(accord_subjectivity::Error::Network("offline".into()))
        }
        async fn announce_address(&self, _: &NodeIdentity) -> ViewResult<()> {
            Ok(())
        }
    }

    fn driver() -> (Arc<MemoryStore>, CatchUpDriver<accord_objectivity::MemoryBackend>) {
        let store = Arc::new(MemoryStore::in_memory());
        let view = Subjectivity::load_or_create(
            SubjectivityConfig::default(),
            LocalIdentity {
                public_key: [1; 32],
                node_number: 0,
                administrator: Id::UNSET,
                listen_addr: "127.0.0.1:9000".parse().unwrap(),
            },
            Arc::new(MemorySubjectivityStore::new()),
            Arc::new(Offline),
        );
        let driver = CatchUpDriver::new(
            store.clone(),
            view,
            TcpTransport::new(Duration::from_secs(1)),
            8,
        );
        (store, driver)
    }

    fn core_majority(hash: ContentHash) -> Majorities {
        Majorities {
            core: Some(MajorityAtStart::new(hash, vec![NodeId([9; 32])])),
            users: None,
            respondents: 1,
        }
    }

    #[test]
    fn test_no_majority_until_installed() {
        let (_store, driver) = driver();
        assert_eq!(
            driver.tick(),
            (CatchUpState::NoMajority, CatchUpState::NoMajority)
        );
        let statuses = driver.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].family, "core");
    }

    #[test]
    fn test_same_majority_does_not_reset() {
        let (_store, driver) = driver();
        driver.install(core_majority(ContentHash([1; 32])));
        assert_eq!(driver.states().0, CatchUpState::Reset);

        // No neighbors to ask: the machine idles.
        assert_eq!(driver.tick().0, CatchUpState::Idle);

        driver.install(core_majority(ContentHash([1; 32])));
        assert_eq!(driver.states().0, CatchUpState::Idle);

        driver.install(core_majority(ContentHash([2; 32])));
        assert_eq!(driver.states().0, CatchUpState::Reset);
    }

    #[test]
    fn test_local_core_matching_majority_converges() {
        let (store, driver) = driver();
        let core = ObjectivityCore::genesis(Id::VOTE, ObjectivityCoreConfig::default());
        let hash = core.content_hash().unwrap();
        store.write_in_transaction(|txn| txn.save_core(&core)).unwrap();

        driver.install(core_majority(hash));
        assert_eq!(driver.tick().0, CatchUpState::Converged);
        assert_eq!(driver.statuses()[0].requests_issued, 0);
    }
}
