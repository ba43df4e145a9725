//! The pluggable parts of a catch-up machine.

use crate::error::Result;
use crate::transport::{PeerEdge, Request};

/// Outcome of handing a response to a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The payload was validated and written to storage.
    Committed,
    /// The payload was refused; nothing was written.
    Rejected(String),
}

/// Supplies peers and correlation ids to catch-up machines.
pub trait PeerSelector: Send + Sync {
    /// Pick a peer at random, weighted by trust and latency.
    fn select_weighted(&self) -> Option<PeerEdge>;

    /// Next value of the local message sequence.
    fn next_message_id(&self) -> u64;
}

/// How one family of replicated state is compared, fetched and committed.
pub trait CatchUpStrategy: Send {
    /// What the network majority holds (a hash, or a map of hashes).
    type Majority: Clone + Send + Sync + 'static;

    type Request: Request;

    /// Family name for logs and status.
    fn name(&self) -> &'static str;

    /// Whether local storage already matches the majority.
    fn check_convergence(&self, majority: &Self::Majority) -> Result<bool>;

    /// Request for the data still missing. `None` when nothing needs
    /// fetching and the divergence can be repaired locally.
    fn build_request(&self, majority: &Self::Majority) -> Result<Option<Self::Request>>;

    /// Validate a response and commit it atomically when acceptable.
    fn process_response(
        &mut self,
        majority: &Self::Majority,
        request: &Self::Request,
        response: <Self::Request as Request>::Response,
    ) -> Result<Verdict>;

    /// Repair divergence that needs no remote data.
    fn reconcile_local(&mut self, _majority: &Self::Majority) -> Result<Verdict> {
        Ok(Verdict::Rejected("nothing to reconcile locally".into()))
    }
}
