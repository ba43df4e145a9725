//! Catch-up for replicated state
//!
//! A node's replicated ("objective") state must end up equal to what the
//! network majority holds. This crate provides the machinery that gets it
//! there without ever blocking the node's other periodic work:
//!
//! - [`AsyncRequest`]: one outstanding request to one peer, polled without
//!   waiting
//! - [`CatchUpMachine`]: a tick-driven state machine, generic over a
//!   [`CatchUpStrategy`] that knows how to compare, fetch and commit one
//!   family of state
//! - [`MajorityAtStart`] and [`tally`]: the majority snapshot a machine
//!   converges towards
//!
//! The crate does not decide what the majority is, store anything, or open
//! sockets. Those are supplied through [`Transport`], [`PeerSelector`] and
//! the strategy.

mod correlator;
mod error;
mod machine;
mod majority;
mod strategy;
mod transport;

pub use correlator::{AsyncRequest, CompletionState};
pub use error::{Error, Result};
pub use machine::{CatchUpMachine, CatchUpState, CatchUpStatus};
pub use majority::{majority_threshold, tally, MajorityAtStart};
pub use strategy::{CatchUpStrategy, PeerSelector, Verdict};
pub use transport::{
    response_channel, Envelope, NodeId, PeerEdge, Request, RequestFailure, RequestOutcome,
    ResponseHandle, ResponseSender, Transport,
};
