//! Catch-up strategies for the core and the user family.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use accord_catchup::{CatchUpStrategy, Result as CatchUpResult, Verdict};
use accord_identity::{
    validate_at_catch_up, validate_reference, ContentHash, Id, IdAllocator, ReferenceLookup,
};
use tracing::{debug, warn};

use crate::core::ObjectivityCore;
use crate::error::{Error, Result};
use crate::messages::{GetCore, GetUsers, StateHashes, MAX_USERS_PER_REQUEST};
use crate::sequence::delete_user;
use crate::store::{KvBackend, ObjectStore, Txn};
use crate::user::User;

/// Hash summary of local state, as served to peers.
pub fn local_state_hashes(txn: &Txn<'_>) -> Result<StateHashes> {
    let core = match txn.core()? {
        Some(core) => Some(core.content_hash()?),
        None => None,
    };
    Ok(StateHashes {
        core,
        users: txn.user_hashes()?,
    })
}

/// Keeps the local core equal to the majority core, by hash.
pub struct CoreCatchUp<B> {
    store: Arc<ObjectStore<B>>,
}

impl<B> CoreCatchUp<B> {
    pub fn new(store: Arc<ObjectStore<B>>) -> Self {
        Self { store }
    }
}

impl<B: KvBackend + 'static> CatchUpStrategy for CoreCatchUp<B> {
    type Majority = ContentHash;
    type Request = GetCore;

    fn name(&self) -> &'static str {
        "core"
    }

    fn check_convergence(&self, majority: &ContentHash) -> CatchUpResult<bool> {
        let local = self.store.read_in_transaction(|txn| match txn.core()? {
            Some(core) => Ok(Some(core.content_hash()?)),
            None => Ok(None),
        })?;
        Ok(local.as_ref() == Some(majority))
    }

    fn build_request(&self, _majority: &ContentHash) -> CatchUpResult<Option<GetCore>> {
        Ok(Some(GetCore {}))
    }

    fn process_response(
        &mut self,
        majority: &ContentHash,
        _request: &GetCore,
        response: Option<ObjectivityCore>,
    ) -> CatchUpResult<Verdict> {
        let Some(core) = response else {
            return Ok(Verdict::Rejected("peer has no core".into()));
        };
        let hash = core.content_hash().map_err(Error::from)?;
        if hash != *majority {
            return Ok(Verdict::Rejected(format!(
                "core hash {} does not match majority {}",
                hash, majority
            )));
        }

        let verdict = self.store.write_in_transaction(|txn| {
            if !validate_at_catch_up(&core, &*txn)? {
                return Ok(Verdict::Rejected("core failed catch-up validation".into()));
            }
            txn.save_core(&core)?;
            Ok(Verdict::Committed)
        })?;
        Ok(verdict)
    }
}

/// Keeps the local user set equal to the majority, by per-id hash.
pub struct UserCatchUp<B> {
    store: Arc<ObjectStore<B>>,
    /// Majority ids that refused users depend on; requested first.
    priority: BTreeSet<Id>,
}

impl<B> UserCatchUp<B> {
    pub fn new(store: Arc<ObjectStore<B>>) -> Self {
        Self {
            store,
            priority: BTreeSet::new(),
        }
    }
}

/// Ids whose local hash is missing or differs from the majority, in id order.
fn diverged_ids<'a>(
    local: &'a BTreeMap<Id, ContentHash>,
    majority: &'a BTreeMap<Id, ContentHash>,
) -> impl Iterator<Item = Id> + 'a {
    majority
        .iter()
        .filter(move |(id, hash)| local.get(*id) != Some(*hash))
        .map(|(id, _)| *id)
}

/// Delete local users the majority does not have.
fn delete_extras(txn: &mut Txn<'_>, majority: &BTreeMap<Id, ContentHash>) -> Result<usize> {
    let mut deleted = 0;
    for id in txn.user_ids()? {
        if majority.contains_key(&id) || txn.user(id)?.is_none() {
            continue;
        }
        deleted += delete_user(txn, id)?.len();
    }
    Ok(deleted)
}

/// Candidates the allocator cannot take, claiming in id order.
fn unclaimable(allocator: &IdAllocator, candidates: &BTreeMap<Id, User>) -> Vec<Id> {
    let mut scratch = allocator.clone();
    let mut failing = Vec::new();
    for id in candidates.keys() {
        if scratch.is_allocated(*id) {
            continue;
        }
        if let Err(e) = scratch.claim(*id) {
            warn!(user = %id, error = %e, "refusing user whose id cannot be claimed");
            failing.push(*id);
        }
    }
    failing
}

/// Resolves references against committed users plus a pending batch.
struct BatchLookup<'t, 'a> {
    txn: &'t Txn<'a>,
    batch: &'t BTreeMap<Id, User>,
}

impl ReferenceLookup for BatchLookup<'_, '_> {
    fn user_exists(&self, id: Id) -> accord_identity::Result<bool> {
        if self.batch.contains_key(&id) {
            return Ok(true);
        }
        self.txn.user_exists(id)
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    accepted: Vec<Id>,
    refused: usize,
    deleted: usize,
    /// Majority ids missing locally that refused users reference.
    wanted: BTreeSet<Id>,
}

impl<B: KvBackend + 'static> UserCatchUp<B> {
    fn apply_batch(
        &self,
        majority: &BTreeMap<Id, ContentHash>,
        request: &GetUsers,
        response: Vec<User>,
    ) -> Result<BatchOutcome> {
        self.store.write_in_transaction(|txn| {
            let mut outcome = BatchOutcome {
                deleted: delete_extras(txn, majority)?,
                ..BatchOutcome::default()
            };
            let mut candidates: BTreeMap<Id, User> = BTreeMap::new();

            for user in response {
                let id = user.id();
                let hash = user.content_hash()?;
                if !request.ids.contains(&id) || majority.get(&id) != Some(&hash) {
                    debug!(user = %id, "refusing user not matching majority hash");
                    outcome.refused += 1;
                    continue;
                }
                if !validate_at_catch_up(&user, &*txn)? {
                    outcome.refused += 1;
                    continue;
                }
                candidates.insert(id, user);
            }

            // Refusing one candidate can break the references or the id
            // claims of others, so repeat until the set is stable.
            let allocator = txn.user_allocator()?;
            loop {
                let mut failing = unclaimable(&allocator, &candidates);
                {
                    let lookup = BatchLookup {
                        txn: &*txn,
                        batch: &candidates,
                    };
                    for (id, user) in &candidates {
                        if failing.contains(id) || validate_reference(user, &lookup)?.is_valid() {
                            continue;
                        }
                        debug!(user = %id, "refusing user with unresolved references");
                        failing.push(*id);
                        for referenced in [user.header.registerer, user.header.administrator] {
                            if referenced != *id
                                && majority.contains_key(&referenced)
                                && !lookup.user_exists(referenced)?
                            {
                                outcome.wanted.insert(referenced);
                            }
                        }
                    }
                }
                if failing.is_empty() {
                    break;
                }
                for id in failing {
                    candidates.remove(&id);
                    outcome.refused += 1;
                }
            }

            for user in candidates.values() {
                txn.claim_user_id(user.id())?;
                txn.save_user(user)?;
            }
            outcome.accepted = candidates.into_keys().collect();
            Ok(outcome)
        })
    }
}

impl<B: KvBackend + 'static> CatchUpStrategy for UserCatchUp<B> {
    type Majority = BTreeMap<Id, ContentHash>;
    type Request = GetUsers;

    fn name(&self) -> &'static str {
        "user"
    }

    fn check_convergence(&self, majority: &Self::Majority) -> CatchUpResult<bool> {
        let local = self.store.read_in_transaction(|txn| txn.user_hashes())?;
        Ok(local == *majority)
    }

    /// Referenced ids asked for by earlier refusals go first, then the
    /// rest of the diverged ids in id order.
    fn build_request(&self, majority: &Self::Majority) -> CatchUpResult<Option<GetUsers>> {
        let local = self.store.read_in_transaction(|txn| txn.user_hashes())?;
        let first = self
            .priority
            .iter()
            .copied()
            .filter(|id| majority.contains_key(id) && local.get(id) != majority.get(id));
        let mut ids: Vec<Id> = Vec::with_capacity(MAX_USERS_PER_REQUEST);
        for id in first.chain(diverged_ids(&local, majority)) {
            if ids.len() == MAX_USERS_PER_REQUEST {
                break;
            }
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok((!ids.is_empty()).then_some(GetUsers { ids }))
    }

    fn process_response(
        &mut self,
        majority: &Self::Majority,
        request: &GetUsers,
        response: Vec<User>,
    ) -> CatchUpResult<Verdict> {
        let outcome = self.apply_batch(majority, request, response)?;
        self.priority.retain(|id| majority.contains_key(id) && !outcome.accepted.contains(id));
        self.priority.extend(outcome.wanted.iter().copied());
        if outcome.refused > 0 {
            warn!(
                accepted = outcome.accepted.len(),
                refused = outcome.refused,
                wanted = outcome.wanted.len(),
                "some users refused during catch-up"
            );
        }
        if outcome.accepted.is_empty() && outcome.deleted == 0 {
            return Ok(Verdict::Rejected(format!(
                "no acceptable users ({} refused)",
                outcome.refused
            )));
        }
        Ok(Verdict::Committed)
    }

    fn reconcile_local(&mut self, majority: &Self::Majority) -> CatchUpResult<Verdict> {
        let deleted = self
            .store
            .write_in_transaction(|txn| delete_extras(txn, majority))?;
        if deleted == 0 {
            return Ok(Verdict::Rejected("no local users to remove".into()));
        }
        Ok(Verdict::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ObjectivityCoreConfig;
    use crate::sequence::{create_user, NewUser};
    use crate::store::MemoryStore;
    use crate::user::tests::{key, user};
    use accord_catchup::{
        CatchUpMachine, CatchUpState, Envelope, MajorityAtStart, NodeId, PeerEdge, PeerSelector,
        Request, ResponseHandle, Transport,
    };
    use accord_identity::{
        validate_at_create_specified_id, validate_at_update, ObjectHeader, MAX_CLAIM_GAP,
    };
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Serves requests straight out of a remote store.
    struct StoreTransport {
        remote: Arc<MemoryStore>,
        sent: AtomicU64,
    }

    impl Transport<GetCore> for StoreTransport {
        fn request_async(&self, _e: Envelope<GetCore>, _peer: &PeerEdge) -> ResponseHandle<Option<ObjectivityCore>> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            let core = self.remote.read_in_transaction(|txn| txn.core()).unwrap();
            ResponseHandle::resolved(Ok(core))
        }
    }

    impl Transport<GetUsers> for StoreTransport {
        fn request_async(&self, e: Envelope<GetUsers>, _peer: &PeerEdge) -> ResponseHandle<Vec<User>> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            let users = self
                .remote
                .read_in_transaction(|txn| {
                    let mut found = Vec::new();
                    for id in &e.payload.ids {
                        if let Some(u) = txn.user(*id)? {
                            found.push(u);
                        }
                    }
                    Ok(found)
                })
                .unwrap();
            ResponseHandle::resolved(Ok(users))
        }
    }

    struct OnePeer(AtomicU64);

    impl PeerSelector for OnePeer {
        fn select_weighted(&self) -> Option<PeerEdge> {
            Some(PeerEdge {
                node: NodeId([9; 32]),
                addr: "127.0.0.1:4000".parse().unwrap(),
            })
        }

        fn next_message_id(&self) -> u64 {
            self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn machine<S>(strategy: S, remote: &Arc<MemoryStore>) -> (CatchUpMachine<S>, Arc<StoreTransport>)
    where
        S: CatchUpStrategy,
        StoreTransport: Transport<S::Request>,
    {
        let transport = Arc::new(StoreTransport {
            remote: remote.clone(),
            sent: AtomicU64::new(0),
        });
        let machine = CatchUpMachine::new(strategy, Arc::new(OnePeer(AtomicU64::new(1))), transport.clone());
        (machine, transport)
    }

    fn run_until_converged<S: CatchUpStrategy>(m: &mut CatchUpMachine<S>, max_ticks: usize) -> usize {
        for tick in 1..=max_ticks {
            if m.tick().unwrap() == CatchUpState::Converged {
                return tick;
            }
        }
        panic!("did not converge in {} ticks", max_ticks);
    }

    fn seed_users(store: &MemoryStore, count: usize) {
        store
            .write_in_transaction(|txn| {
                for i in 0..count {
                    create_user(
                        txn,
                        NewUser {
                            id: None,
                            name: format!("user{}", i),
                            public_key: key(i as u8),
                            registerer: Some(Id::SYSTEM),
                            history_index: 1,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn hashes(store: &MemoryStore) -> StateHashes {
        store.read_in_transaction(|txn| local_state_hashes(txn)).unwrap()
    }

    #[test]
    fn core_is_fetched_and_committed() {
        let remote = Arc::new(MemoryStore::in_memory());
        let core = ObjectivityCore::genesis(Id::VOTE, ObjectivityCoreConfig::default());
        remote.write_in_transaction(|txn| txn.save_core(&core)).unwrap();

        let local = Arc::new(MemoryStore::in_memory());
        let (mut m, transport) = machine(CoreCatchUp::new(local.clone()), &remote);
        m.reset(MajorityAtStart::new(core.content_hash().unwrap(), vec![]));

        assert_eq!(m.tick().unwrap(), CatchUpState::AwaitingResponse);
        assert_eq!(m.tick().unwrap(), CatchUpState::Idle);
        assert_eq!(m.tick().unwrap(), CatchUpState::Converged);
        assert_eq!(m.status().commits, 1);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);

        let stored = local.read_in_transaction(|txn| txn.core()).unwrap();
        assert_eq!(stored, Some(core));
    }

    #[test]
    fn core_with_wrong_hash_is_not_committed() {
        let remote = Arc::new(MemoryStore::in_memory());
        let remote_core = ObjectivityCore::genesis(Id::VOTE, ObjectivityCoreConfig::default());
        remote.write_in_transaction(|txn| txn.save_core(&remote_core)).unwrap();

        let majority_core = ObjectivityCore::genesis(Id::DELETED, ObjectivityCoreConfig::default());
        let local = Arc::new(MemoryStore::in_memory());
        let (mut m, _) = machine(CoreCatchUp::new(local.clone()), &remote);
        m.reset(MajorityAtStart::new(majority_core.content_hash().unwrap(), vec![]));

        m.tick().unwrap();
        assert_eq!(m.tick().unwrap(), CatchUpState::Idle);
        let status = m.status();
        assert_eq!(status.commits, 0);
        assert_eq!(status.rejections, 1);
        assert!(local.read_in_transaction(|txn| txn.core()).unwrap().is_none());
    }

    #[test]
    fn users_converge_in_batches() {
        let remote = Arc::new(MemoryStore::in_memory());
        seed_users(&remote, 70);
        let majority = hashes(&remote).users;

        let local = Arc::new(MemoryStore::in_memory());
        let (mut m, transport) = machine(UserCatchUp::new(local.clone()), &remote);
        m.reset(MajorityAtStart::new(majority.clone(), vec![]));

        run_until_converged(&mut m, 10);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
        assert_eq!(hashes(&local).users, majority);

        // Caught-up ids are held by the local allocator.
        let next = local
            .write_in_transaction(|txn| Ok(txn.user_allocator()?.next_fresh()))
            .unwrap();
        assert_eq!(next, Id(70));
    }

    #[test]
    fn diverged_and_extra_users_are_repaired() {
        let remote = Arc::new(MemoryStore::in_memory());
        seed_users(&remote, 3);
        let majority = hashes(&remote).users;

        let local = Arc::new(MemoryStore::in_memory());
        local
            .write_in_transaction(|txn| {
                let mut stale = user(1, "stale", Id::SYSTEM);
                stale.public_key = key(1);
                txn.save_user(&stale)?;
                txn.claim_user_id(Id(1))?;
                txn.save_user(&user(5, "extra", Id::SYSTEM))?;
                txn.claim_user_id(Id(5))
            })
            .unwrap();

        let (mut m, _) = machine(UserCatchUp::new(local.clone()), &remote);
        m.reset(MajorityAtStart::new(majority.clone(), vec![]));
        run_until_converged(&mut m, 10);

        assert_eq!(hashes(&local).users, majority);
        let ids = local.read_in_transaction(|txn| txn.user_ids()).unwrap();
        assert_eq!(ids, vec![Id(0), Id(1), Id(2)]);
    }

    #[test]
    fn only_extras_are_removed_without_fetching() {
        let remote = Arc::new(MemoryStore::in_memory());
        let local = Arc::new(MemoryStore::in_memory());
        seed_users(&local, 2);

        let (mut m, transport) = machine(UserCatchUp::new(local.clone()), &remote);
        m.reset(MajorityAtStart::new(BTreeMap::new(), vec![]));

        assert_eq!(m.tick().unwrap(), CatchUpState::Idle);
        assert_eq!(m.tick().unwrap(), CatchUpState::Converged);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn user_with_unresolved_registerer_is_refused() {
        let remote = Arc::new(MemoryStore::in_memory());
        seed_users(&remote, 1);
        remote
            .write_in_transaction(|txn| {
                create_user(
                    txn,
                    NewUser {
                        id: None,
                        name: "child".into(),
                        public_key: key(50),
                        registerer: Some(Id(0)),
                        history_index: 1,
                    },
                )
            })
            .unwrap();

        // Majority lists the child but not its registerer.
        let mut majority = hashes(&remote).users;
        majority.remove(&Id(0));

        let local = Arc::new(MemoryStore::in_memory());
        let (mut m, _) = machine(UserCatchUp::new(local.clone()), &remote);
        m.reset(MajorityAtStart::new(majority, vec![]));
        m.tick().unwrap();
        assert_eq!(m.tick().unwrap(), CatchUpState::Idle);
        assert_eq!(m.status().rejections, 1);
        assert!(local.read_in_transaction(|txn| txn.user_ids()).unwrap().is_empty());
    }

    #[test]
    fn registerer_beyond_first_batch_is_fetched_first() {
        let remote = Arc::new(MemoryStore::in_memory());
        remote
            .write_in_transaction(|txn| {
                create_user(
                    txn,
                    NewUser {
                        id: Some(Id(100)),
                        name: "founder".into(),
                        public_key: key(200),
                        registerer: Some(Id::SYSTEM),
                        history_index: 1,
                    },
                )?;
                for i in 0..MAX_USERS_PER_REQUEST {
                    create_user(
                        txn,
                        NewUser {
                            id: None,
                            name: format!("member{}", i),
                            public_key: key(i as u8),
                            registerer: Some(Id(100)),
                            history_index: 1,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();
        let majority = hashes(&remote).users;
        assert_eq!(majority.len(), MAX_USERS_PER_REQUEST + 1);

        let local = Arc::new(MemoryStore::in_memory());
        let (mut m, transport) = machine(UserCatchUp::new(local.clone()), &remote);
        m.reset(MajorityAtStart::new(majority.clone(), vec![]));

        // First batch is all members and is refused as a whole.
        m.tick().unwrap();
        assert_eq!(m.tick().unwrap(), CatchUpState::Idle);
        assert_eq!(m.status().rejections, 1);

        run_until_converged(&mut m, 20);
        assert_eq!(hashes(&local).users, majority);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unclaimable_id_does_not_block_the_batch() {
        let far = MAX_CLAIM_GAP + 4_464;
        let remote = Arc::new(MemoryStore::in_memory());
        seed_users(&remote, 2);
        remote
            .write_in_transaction(|txn| txn.save_user(&user(far, "far", Id::SYSTEM)))
            .unwrap();
        let majority = hashes(&remote).users;
        assert!(majority.contains_key(&Id(far)));

        let local = Arc::new(MemoryStore::in_memory());
        let (mut m, _) = machine(UserCatchUp::new(local.clone()), &remote);
        m.reset(MajorityAtStart::new(majority, vec![]));

        m.tick().unwrap();
        assert_eq!(m.tick().unwrap(), CatchUpState::Idle);
        assert_eq!(m.status().commits, 1);
        let ids = local.read_in_transaction(|txn| txn.user_ids()).unwrap();
        assert_eq!(ids, vec![Id(0), Id(1)]);

        // Only the far id is left; it keeps being refused without a fault.
        for _ in 0..4 {
            assert_ne!(m.tick().unwrap(), CatchUpState::Faulted);
        }
        assert!(m.status().rejections >= 1);
        assert!(local.read_in_transaction(|txn| txn.user(Id(far))).unwrap().is_none());
    }

    fn arb_user() -> impl Strategy<Value = User> {
        (-6i64..6, -6i64..6, -6i64..6, "[a-z]{0,3}", any::<u8>()).prop_map(|(id, reg, admin, name, seed)| User {
            header: ObjectHeader {
                id: Id(id),
                registerer: Id(reg),
                administrator: Id(admin),
                history_index: 1,
            },
            name,
            public_key: key(seed),
        })
    }

    proptest! {
        #[test]
        fn catch_up_validation_is_create_or_update(u in arb_user(), taken in prop::collection::btree_set(0i64..6, 0..4)) {
            let store = MemoryStore::in_memory();
            store.write_in_transaction(|txn| {
                for id in &taken {
                    txn.save_user(&user(*id, "x", Id::SYSTEM))?;
                }
                Ok(())
            }).unwrap();

            store.read_in_transaction(|txn| {
                let expected = validate_at_create_specified_id(&u, txn).unwrap().is_valid()
                    || validate_at_update(&u, None).is_valid();
                assert_eq!(validate_at_catch_up(&u, txn).unwrap(), expected);
                Ok(())
            }).unwrap();
        }
    }

    #[test]
    fn request_kinds() {
        assert_eq!(GetCore::KIND, "get_core");
        assert_eq!(GetUsers::KIND, "get_users");
    }
}
