//! Timing and capacity settings for the local view.

use std::time::Duration;

/// Most confirmed (and, separately, tentative) neighbors kept.
pub const NEIGHBOR_MAX: usize = 2000;

#[derive(Debug, Clone)]
pub struct SubjectivityConfig {
    /// Capacity of the confirmed neighbor list.
    pub neighbor_capacity: usize,
    /// Capacity of the tentative list.
    pub tentative_capacity: usize,

    /// Delay before the first run of every periodic task.
    pub initial_wait: Duration,

    /// Broadcast of our identity to confirmed neighbors.
    pub notification_interval: Duration,
    /// Neighbor-address discovery and pruning.
    pub address_discovery_interval: Duration,
    /// Tentative expiry sweep.
    pub tentative_sweep_interval: Duration,
    /// Key-exchange refresh.
    pub key_exchange_interval: Duration,

    /// Tentative entries older than this are swept.
    pub tentative_ttl: Duration,
    /// Confirmed neighbors without a key exchange this recent are re-acquainted.
    pub key_exchange_max_age: Duration,
    /// Confirmed neighbors not seen this recently are pruned.
    pub prune_after: Duration,
    /// Neighbors asked for their neighbors on each discovery run.
    pub discovery_fanout: usize,
    /// Tentative peers acquainted per discovery run.
    pub acquaint_batch: usize,

    /// Wait after cancelling tasks, before persisting.
    pub stop_grace: Duration,
    /// Extra wait when a task was actually cancelled.
    pub cancel_grace: Duration,
}

impl Default for SubjectivityConfig {
    fn default() -> Self {
        Self {
            neighbor_capacity: NEIGHBOR_MAX,
            tentative_capacity: NEIGHBOR_MAX,
            initial_wait: Duration::from_secs(5),
            notification_interval: Duration::from_secs(20 * 60),
            address_discovery_interval: Duration::from_secs(60),
            tentative_sweep_interval: Duration::from_secs(10 * 60),
            key_exchange_interval: Duration::from_secs(60 * 60),
            tentative_ttl: Duration::from_secs(10 * 60),
            key_exchange_max_age: Duration::from_secs(24 * 60 * 60),
            prune_after: Duration::from_secs(60 * 60),
            discovery_fanout: 3,
            acquaint_batch: 16,
            stop_grace: Duration::from_millis(1500),
            cancel_grace: Duration::from_secs(20),
        }
    }
}
