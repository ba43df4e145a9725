//! The generic catch-up state machine.
//!
//! One machine tracks one family of replicated state against a majority
//! snapshot. It is driven by calling [`CatchUpMachine::tick`] on a fixed
//! cadence; a tick never waits on the network.
//!
//! # Tick order
//!
//! 1. Converged with the majority → `Converged`, any outstanding request is
//!    discarded unprocessed.
//! 2. Request outstanding, not resolved → `AwaitingResponse`.
//! 3. Request resolved → hand it to the strategy, clear it → `Idle`.
//! 4. Nothing outstanding → pick a peer and issue → `AwaitingResponse`
//!    (or stay `Idle` when no peer is known).

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::correlator::AsyncRequest;
use crate::error::{Error, Result};
use crate::majority::MajorityAtStart;
use crate::strategy::{CatchUpStrategy, PeerSelector, Verdict};
use crate::transport::{RequestFailure, Transport};

/// Where a machine stands after its last tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpState {
    /// No majority snapshot installed yet.
    NoMajority,
    /// A new majority was just installed.
    Reset,
    /// Diverged, nothing outstanding.
    Idle,
    AwaitingResponse,
    Converged,
    /// An invariant was violated; ticks are no-ops until reset.
    Faulted,
}

impl std::fmt::Display for CatchUpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMajority => write!(f, "NoMajority"),
            Self::Reset => write!(f, "Reset"),
            Self::Idle => write!(f, "Idle"),
            Self::AwaitingResponse => write!(f, "AwaitingResponse"),
            Self::Converged => write!(f, "Converged"),
            Self::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Read-only snapshot of a machine for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct CatchUpStatus {
    pub family: &'static str,
    pub state: CatchUpState,
    /// Unix millis of the installed majority, if any.
    pub majority_captured_at: Option<u64>,
    pub requests_issued: u64,
    pub commits: u64,
    pub rejections: u64,
    pub failures: u64,
    pub ticks_since_convergence: u64,
    /// Node id (hex) of the peer currently being waited on.
    pub awaiting_peer: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    requests_issued: u64,
    commits: u64,
    rejections: u64,
    failures: u64,
    ticks_since_convergence: u64,
}

/// Drives one family of replicated state towards the majority.
pub struct CatchUpMachine<S: CatchUpStrategy> {
    strategy: S,
    selector: Arc<dyn PeerSelector>,
    transport: Arc<dyn Transport<S::Request>>,
    majority: Option<MajorityAtStart<S::Majority>>,
    outstanding: Option<AsyncRequest<S::Request>>,
    state: CatchUpState,
    counters: Counters,
}

impl<S: CatchUpStrategy> CatchUpMachine<S> {
    pub fn new(
        strategy: S,
        selector: Arc<dyn PeerSelector>,
        transport: Arc<dyn Transport<S::Request>>,
    ) -> Self {
        Self {
            strategy,
            selector,
            transport,
            majority: None,
            outstanding: None,
            state: CatchUpState::NoMajority,
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> CatchUpState {
        self.state
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Install a new majority snapshot, dropping any outstanding request and
    /// clearing a fault.
    pub fn reset(&mut self, majority: MajorityAtStart<S::Majority>) {
        if let Some(dropped) = self.outstanding.take() {
            debug!(
                family = self.strategy.name(),
                correlation_id = dropped.correlation_id(),
                "dropping outstanding request on reset"
            );
        }
        self.majority = Some(majority);
        self.state = CatchUpState::Reset;
    }

    /// Run one step. See the module docs for the order of checks.
    pub fn tick(&mut self) -> Result<CatchUpState> {
        if self.state == CatchUpState::Faulted {
            return Ok(self.state);
        }
        let Some(majority) = self.majority.as_ref() else {
            self.state = CatchUpState::NoMajority;
            return Ok(self.state);
        };

        let converged = self.strategy.check_convergence(&majority.value);
        match converged {
            Ok(true) => {
                if let Some(discarded) = self.outstanding.take() {
                    debug!(
                        family = self.strategy.name(),
                        correlation_id = discarded.correlation_id(),
                        "converged; discarding outstanding request"
                    );
                }
                self.counters.ticks_since_convergence = 0;
                self.state = CatchUpState::Converged;
                return Ok(self.state);
            }
            Ok(false) => {}
            Err(e) => return self.fail(e),
        }
        self.counters.ticks_since_convergence += 1;

        if let Some(mut pending) = self.outstanding.take() {
            if !pending.is_done() {
                self.outstanding = Some(pending);
                self.state = CatchUpState::AwaitingResponse;
                return Ok(self.state);
            }
            return self.complete(pending);
        }

        self.issue()
    }

    fn complete(&mut self, mut pending: AsyncRequest<S::Request>) -> Result<CatchUpState> {
        let family = self.strategy.name();
        let outcome = match pending.take_outcome() {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(e),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(failure) => {
                self.counters.failures += 1;
                match failure {
                    RequestFailure::Timeout | RequestFailure::Dropped => debug!(
                        family,
                        peer = %pending.peer().node,
                        correlation_id = pending.correlation_id(),
                        %failure,
                        "catch-up request failed"
                    ),
                    _ => warn!(
                        family,
                        peer = %pending.peer().node,
                        correlation_id = pending.correlation_id(),
                        %failure,
                        "catch-up request failed"
                    ),
                }
                self.state = CatchUpState::Idle;
                return Ok(self.state);
            }
        };

        let Some(majority) = self.majority.as_ref() else {
            return self.fail(Error::Invariant("response processed without a majority".into()));
        };
        let verdict = self
            .strategy
            .process_response(&majority.value, pending.request(), response);

        match verdict {
            Ok(Verdict::Committed) => {
                self.counters.commits += 1;
                info!(
                    family,
                    peer = %pending.peer().node,
                    correlation_id = pending.correlation_id(),
                    "committed catch-up data"
                );
            }
            Ok(Verdict::Rejected(reason)) => {
                self.counters.rejections += 1;
                warn!(
                    family,
                    peer = %pending.peer().node,
                    correlation_id = pending.correlation_id(),
                    reason = %reason,
                    "rejected catch-up response"
                );
            }
            Err(e) => return self.fail(e),
        }
        self.state = CatchUpState::Idle;
        Ok(self.state)
    }

    fn issue(&mut self) -> Result<CatchUpState> {
        let family = self.strategy.name();
        let Some(majority) = self.majority.as_ref() else {
            return self.fail(Error::Invariant("issue without a majority".into()));
        };

        let request = match self.strategy.build_request(&majority.value) {
            Ok(Some(request)) => request,
            Ok(None) => {
                let verdict = self.strategy.reconcile_local(&majority.value);
                match verdict {
                    Ok(Verdict::Committed) => {
                        self.counters.commits += 1;
                        info!(family, "reconciled local state");
                    }
                    Ok(Verdict::Rejected(reason)) => {
                        debug!(family, reason = %reason, "local reconcile made no change");
                    }
                    Err(e) => return self.fail(e),
                }
                self.state = CatchUpState::Idle;
                return Ok(self.state);
            }
            Err(e) => return self.fail(e),
        };

        let Some(peer) = self.selector.select_weighted() else {
            debug!(family, "no peer available for catch-up");
            self.state = CatchUpState::Idle;
            return Ok(self.state);
        };

        let correlation_id = self.selector.next_message_id();
        let pending = AsyncRequest::issue(self.transport.as_ref(), peer, request, correlation_id);
        self.counters.requests_issued += 1;
        debug!(family, peer = %peer.node, correlation_id, "catch-up request issued");

        self.outstanding = Some(pending);
        self.state = CatchUpState::AwaitingResponse;
        Ok(self.state)
    }

    /// Abandon the current step. Fatal errors fault the machine and are
    /// returned; anything else is retried on a later tick.
    fn fail(&mut self, err: Error) -> Result<CatchUpState> {
        self.outstanding = None;
        if err.is_fatal() {
            error!(family = self.strategy.name(), error = %err, "catch-up machine faulted");
            self.state = CatchUpState::Faulted;
            return Err(err);
        }
        warn!(family = self.strategy.name(), error = %err, "catch-up step failed");
        self.state = CatchUpState::Idle;
        Ok(self.state)
    }

    pub fn status(&self) -> CatchUpStatus {
        CatchUpStatus {
            family: self.strategy.name(),
            state: self.state,
            majority_captured_at: self.majority.as_ref().and_then(|m| {
                m.captured_at
                    .duration_since(UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_millis() as u64)
            }),
            requests_issued: self.counters.requests_issued,
            commits: self.counters.commits,
            rejections: self.counters.rejections,
            failures: self.counters.failures,
            ticks_since_convergence: self.counters.ticks_since_convergence,
            awaiting_peer: self.outstanding.as_ref().map(|p| p.peer().node.to_hex()),
        }
    }
}
