//! Majority snapshots.
//!
//! The catch-up machine never decides what the majority is. It receives a
//! [`MajorityAtStart`] from outside and converges towards it until the next
//! reset. [`tally`] is the helper oracles use to build one from per-peer
//! reports.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use crate::transport::NodeId;

/// Reports needed for a strict majority of `n`.
pub const fn majority_threshold(n: usize) -> usize {
    n / 2 + 1
}

/// The majority value captured when a catch-up round began.
#[derive(Debug, Clone, PartialEq)]
pub struct MajorityAtStart<V> {
    pub value: V,
    /// Peers that reported `value`, sorted.
    pub contributors: Vec<NodeId>,
    pub captured_at: SystemTime,
}

impl<V> MajorityAtStart<V> {
    pub fn new(value: V, mut contributors: Vec<NodeId>) -> Self {
        contributors.sort();
        contributors.dedup();
        Self {
            value,
            contributors,
            captured_at: SystemTime::now(),
        }
    }
}

/// Find the value reported by a strict majority of peers.
///
/// A peer that reports more than one distinct value is ignored but still
/// counts towards `n`. The result does not depend on report order.
pub fn tally<V: Ord + Clone>(reports: &[(NodeId, V)]) -> Option<MajorityAtStart<V>> {
    let mut by_peer: BTreeMap<NodeId, BTreeSet<&V>> = BTreeMap::new();
    for (peer, value) in reports {
        by_peer.entry(*peer).or_default().insert(value);
    }

    let n = by_peer.len();
    if n == 0 {
        return None;
    }

    let mut by_value: BTreeMap<&V, Vec<NodeId>> = BTreeMap::new();
    for (peer, values) in &by_peer {
        if values.len() == 1 {
            if let Some(value) = values.iter().next() {
                by_value.entry(*value).or_default().push(*peer);
            }
        }
    }

    let needed = majority_threshold(n);
    by_value
        .into_iter()
        .find(|(_, peers)| peers.len() >= needed)
        .map(|(value, peers)| MajorityAtStart::new(value.clone(), peers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(n: u8) -> NodeId {
        NodeId([n; 32])
    }

    #[test]
    fn threshold_is_strict_majority() {
        assert_eq!(majority_threshold(1), 1);
        assert_eq!(majority_threshold(2), 2);
        assert_eq!(majority_threshold(3), 2);
        assert_eq!(majority_threshold(4), 3);
        assert_eq!(majority_threshold(5), 3);
    }

    #[test]
    fn finds_majority() {
        let reports = vec![(peer(1), 10u64), (peer(2), 10), (peer(3), 11)];
        let m = tally(&reports).unwrap();
        assert_eq!(m.value, 10);
        assert_eq!(m.contributors, vec![peer(1), peer(2)]);
    }

    #[test]
    fn even_split_has_no_majority() {
        let reports = vec![(peer(1), 1u64), (peer(2), 2)];
        assert!(tally(&reports).is_none());
        assert!(tally::<u64>(&[]).is_none());
    }

    #[test]
    fn equivocating_peer_is_ignored() {
        let reports = vec![(peer(1), 1u64), (peer(1), 2), (peer(2), 1), (peer(3), 1)];
        let m = tally(&reports).unwrap();
        assert_eq!(m.value, 1);
        assert_eq!(m.contributors, vec![peer(2), peer(3)]);
    }

    proptest! {
        #[test]
        fn order_does_not_matter(
            mut reports in prop::collection::vec((0u8..8, 0u64..3), 0..20),
            seed in any::<u64>(),
        ) {
            let a: Vec<_> = reports.iter().map(|(p, v)| (peer(*p), *v)).collect();
            let len = reports.len().max(1);
            reports.rotate_left((seed as usize) % len);
            reports.reverse();
            let b: Vec<_> = reports.iter().map(|(p, v)| (peer(*p), *v)).collect();

            let ta = tally(&a).map(|m| (m.value, m.contributors));
            let tb = tally(&b).map(|m| (m.value, m.contributors));
            prop_assert_eq!(ta, tb);
        }
    }
}
