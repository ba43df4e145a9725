//! One outstanding request to one peer.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};
use crate::transport::{Envelope, PeerEdge, Request, RequestOutcome, ResponseHandle, Transport};

/// Whether a request has resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Done,
}

/// An issued request waiting for its response.
///
/// Created by [`AsyncRequest::issue`], which hands the request to the
/// transport. Completion is observed by polling [`is_done`](Self::is_done)
/// from later ticks; the outcome can be taken exactly once.
pub struct AsyncRequest<Q: Request> {
    request: Q,
    peer: PeerEdge,
    correlation_id: u64,
    issued_at: Instant,
    handle: ResponseHandle<Q::Response>,
    outcome: Option<RequestOutcome<Q::Response>>,
    taken: bool,
}

impl<Q: Request + std::fmt::Debug> std::fmt::Debug for AsyncRequest<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRequest")
            .field("request", &self.request)
            .field("peer", &self.peer)
            .field("correlation_id", &self.correlation_id)
            .field("resolved", &self.outcome.is_some())
            .field("taken", &self.taken)
            .finish()
    }
}

impl<Q: Request> AsyncRequest<Q> {
    /// Send `request` to `peer` and start tracking it.
    pub fn issue<T>(transport: &T, peer: PeerEdge, request: Q, correlation_id: u64) -> Self
    where
        T: Transport<Q> + ?Sized,
    {
        trace!(kind = Q::KIND, peer = %peer.node, correlation_id, "issuing request");
        let handle = transport.request_async(Envelope::new(correlation_id, request.clone()), &peer);
        Self {
            request,
            peer,
            correlation_id,
            issued_at: Instant::now(),
            handle,
            outcome: None,
            taken: false,
        }
    }

    /// Non-blocking completion check.
    pub fn is_done(&mut self) -> bool {
        if self.taken || self.outcome.is_some() {
            return true;
        }
        match self.handle.try_poll() {
            Some(outcome) => {
                self.outcome = Some(outcome);
                true
            }
            None => false,
        }
    }

    pub fn state(&mut self) -> CompletionState {
        if self.is_done() {
            CompletionState::Done
        } else {
            CompletionState::Pending
        }
    }

    /// Take the response or failure.
    ///
    /// Taking before completion, or taking twice, is an invariant violation.
    pub fn take_outcome(&mut self) -> Result<RequestOutcome<Q::Response>> {
        if self.taken {
            return Err(Error::Invariant(format!(
                "outcome of request {} taken twice",
                self.correlation_id
            )));
        }
        if !self.is_done() {
            return Err(Error::Invariant(format!(
                "outcome of request {} taken before completion",
                self.correlation_id
            )));
        }
        self.taken = true;
        self.outcome.take().ok_or_else(|| {
            Error::Invariant(format!("request {} completed without outcome", self.correlation_id))
        })
    }

    pub fn request(&self) -> &Q {
        &self.request
    }

    pub fn peer(&self) -> &PeerEdge {
        &self.peer
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }
}
