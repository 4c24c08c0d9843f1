//! Messages, and the two buffers each peer keeps for them.
//!
//! A peer writes into its private [`Outbox`] during a superstep. At
//! the barrier every outbox is handed to the coordinator, which uses
//! [`partition_by_target`] to build each peer's delivery, and that
//! delivery replaces the contents of the peer's [`Mailbox`].

use std::collections::VecDeque;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::registry::{PeerCount, PeerIndex};

/// Anything that can be sent between peers.
///
/// Serializable so it can cross process boundaries when running on a
/// cluster.
pub trait Message: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Message for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A message plus its routing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub source: PeerIndex,
    pub target: PeerIndex,
    /// Position of this message among everything `source` sent in
    /// the current superstep.
    pub seq: u64,
    pub payload: M,
}

/// Write side: messages sent during the current superstep.
#[derive(Debug)]
pub(crate) struct Outbox<M> {
    source: PeerIndex,
    next_seq: u64,
    pending: Vec<Envelope<M>>,
}

impl<M> Outbox<M> {
    pub(crate) fn new(source: PeerIndex) -> Self {
        Self {
            source,
            next_seq: 0,
            pending: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, target: PeerIndex, payload: M) {
        self.pending.push(Envelope {
            source: self.source,
            target,
            seq: self.next_seq,
            payload,
        });
        self.next_seq += 1;
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Hand over everything sent this superstep and start fresh.
    pub(crate) fn take(&mut self) -> Vec<Envelope<M>> {
        self.next_seq = 0;
        std::mem::take(&mut self.pending)
    }
}

/// Read side: messages delivered by the most recent barrier.
#[derive(Debug)]
pub(crate) struct Mailbox<M> {
    messages: VecDeque<M>,
}

impl<M> Mailbox<M> {
    pub(crate) fn new() -> Self {
        Self {
            messages: VecDeque::new(),
        }
    }

    /// Install a barrier's delivery, dropping anything left unread.
    pub(crate) fn replace(&mut self, delivered: Vec<Envelope<M>>) -> usize {
        let dropped = self.messages.len();
        self.messages = delivered.into_iter().map(|env| env.payload).collect();
        dropped
    }

    pub(crate) fn pop(&mut self) -> Option<M> {
        self.messages.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }
}

/// Put envelopes into delivery order: by sender ordinal, then in the
/// order each sender sent them.
pub(crate) fn sort_delivery<M>(delivery: &mut [Envelope<M>]) {
    delivery.sort_by_key(|env| (env.source, env.seq));
}

/// Group every sender's batch by target.
///
/// Entry `i` of the result is peer `i`'s delivery. Every envelope
/// ends up in exactly one delivery.
pub(crate) fn partition_by_target<M>(
    batches: impl IntoIterator<Item = Vec<Envelope<M>>>,
    count: PeerCount,
) -> Vec<Vec<Envelope<M>>> {
    let mut deliveries: Vec<Vec<Envelope<M>>> = count.iter().map(|_| Vec::new()).collect();
    for batch in batches {
        for env in batch {
            deliveries[env.target.0].push(env);
        }
    }
    for delivery in deliveries.iter_mut() {
        sort_delivery(delivery);
    }
    deliveries
}
