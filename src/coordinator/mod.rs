//! Barrier coordination.
//!
//! The coordinator is the only place where peers meet. A peer hands
//! its outgoing messages to [`Transport::exchange`] and blocks; once
//! every peer has done the same for that superstep, all messages are
//! partitioned by target and each peer gets back its own delivery.
//! No message is visible before the barrier it was sent under
//! completes.
//!
//! There are two transports with the same contract:
//!
//! - [`LocalCoordinator`]: peers are threads in this process and meet
//!   at a mutex and condition variable.
//!
//! - [`ClusterTransport`]: peers are timely workers, possibly in
//!   different processes; messages travel through a timely exchange
//!   and the barrier is the timely progress frontier.

use crate::errors::BspResult;
use crate::message::Envelope;

pub mod cluster;
pub mod local;

pub use cluster::ClusterTransport;
pub use local::{LocalCoordinator, LocalEndpoint};

/// One peer's connection to the barrier.
pub trait Transport<M> {
    /// Hand over everything this peer sent during `superstep` and
    /// block until all peers reached the barrier for it.
    ///
    /// Returns the messages addressed to this peer, ordered by sender
    /// ordinal and then by send order.
    fn exchange(&mut self, superstep: u64, outgoing: Vec<Envelope<M>>)
        -> BspResult<Vec<Envelope<M>>>;

    /// This peer will not reach any more barriers.
    fn leave(&mut self);
}
