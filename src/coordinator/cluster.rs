//! Barrier built on a timely dataflow, for peers spread over
//! processes.
//!
//! Each peer is a timely worker. Supersteps are timely epochs: sent
//! envelopes are introduced into a per-worker input at the current
//! superstep, routed to their target worker with an exchange, and
//! buffered there per epoch. A barrier is "advance the input to the
//! next superstep, then step the worker until the probe says no
//! worker can still produce data for this one". At that point the
//! buffered epoch is complete and becomes the delivery.
//!
//! A worker that closes its input also lets the frontier move, so the
//! frontier alone can't tell "everyone arrived" from "someone left".
//! Every worker therefore also sends an arrival token to every worker
//! at each barrier, and a barrier that completes with fewer than `N`
//! tokens fails with [`BspError::PeerDeparted`].

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use timely::communication::Allocate;
use timely::dataflow::operators::{Exchange, Input, Inspect, Probe};
use timely::dataflow::{InputHandle, ProbeHandle};
use timely::worker::Worker;

use crate::errors::{BspError, BspResult};
use crate::message::{sort_delivery, Envelope, Message};
use crate::registry::{PeerCount, PeerIndex};

use super::Transport;

/// What travels through the exchange, keyed by the target worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Signal<M> {
    /// The source reached the barrier closing this epoch.
    Arrived(PeerIndex),
    Message(Envelope<M>),
}

/// One epoch as seen by the receiving worker.
struct Epoch<M> {
    arrived: BTreeSet<PeerIndex>,
    delivery: Vec<Envelope<M>>,
}

impl<M> Default for Epoch<M> {
    fn default() -> Self {
        Self {
            arrived: BTreeSet::new(),
            delivery: Vec::new(),
        }
    }
}

/// Signals that arrived at this worker, by epoch.
struct DeliveryBuffer<M> {
    buffer: HashMap<u64, Epoch<M>>,
}

impl<M> DeliveryBuffer<M> {
    fn new() -> Self {
        Self {
            buffer: HashMap::new(),
        }
    }

    fn push(&mut self, epoch: u64, signal: Signal<M>) {
        let entry = self.buffer.entry(epoch).or_default();
        match signal {
            Signal::Arrived(source) => {
                entry.arrived.insert(source);
            }
            Signal::Message(env) => entry.delivery.push(env),
        }
    }

    /// Everything received on a given epoch.
    ///
    /// It's the caller's job to check the epoch is closed using the
    /// probe.
    fn remove(&mut self, epoch: u64) -> Epoch<M> {
        self.buffer.remove(&epoch).unwrap_or_default()
    }
}

/// A timely worker acting as one peer's connection to the barrier.
pub struct ClusterTransport<'w, A, M>
where
    A: Allocate,
    M: Message,
{
    worker: &'w mut Worker<A>,
    input: Option<InputHandle<u64, (PeerIndex, Signal<M>)>>,
    probe: ProbeHandle<u64>,
    inbox: Rc<RefCell<DeliveryBuffer<M>>>,
}

impl<'w, A, M> ClusterTransport<'w, A, M>
where
    A: Allocate,
    M: Message,
{
    /// Install the exchange dataflow on this worker.
    ///
    /// Every worker in the cluster must call this exactly once, since
    /// timely requires the same dataflows on all workers.
    pub fn new(worker: &'w mut Worker<A>) -> Self {
        let inbox = Rc::new(RefCell::new(DeliveryBuffer::new()));
        let mut input = InputHandle::new();

        let inbox_w = inbox.clone();
        let probe = worker.dataflow::<u64, _, _>(|scope| {
            let mut probe = ProbeHandle::new();
            scope
                .input_from(&mut input)
                // The exchange operator wraps the route to a modulo
                // of the worker count, and peer ordinals are worker
                // indices.
                .exchange(|(target, _signal): &(PeerIndex, Signal<M>)| target.0 as u64)
                .inspect_time(move |epoch, (_target, signal)| {
                    inbox_w.borrow_mut().push(*epoch, signal.clone());
                })
                .probe_with(&mut probe);
            probe
        });

        Self {
            worker,
            input: Some(input),
            probe,
            inbox,
        }
    }

    pub fn index(&self) -> PeerIndex {
        PeerIndex(self.worker.index())
    }

    pub fn peer_count(&self) -> PeerCount {
        PeerCount(self.worker.peers())
    }
}

impl<'w, A, M> Transport<M> for ClusterTransport<'w, A, M>
where
    A: Allocate,
    M: Message,
{
    fn exchange(
        &mut self,
        superstep: u64,
        outgoing: Vec<Envelope<M>>,
    ) -> BspResult<Vec<Envelope<M>>> {
        let me = self.index();
        let count = self.peer_count();
        let next = superstep + 1;
        if let Some(input) = self.input.as_mut() {
            debug_assert_eq!(*input.time(), superstep);
            for env in outgoing {
                input.send((env.target, Signal::Message(env)));
            }
            for target in count.iter() {
                input.send((target, Signal::Arrived(me)));
            }
            input.advance_to(next);
        }

        let cooldown = Duration::from_millis(1);
        tracing::debug_span!("barrier", superstep).in_scope(|| {
            while self.probe.less_than(&next) {
                self.worker.step_or_park(Some(cooldown));
            }
        });

        let Epoch {
            arrived,
            mut delivery,
        } = self.inbox.borrow_mut().remove(superstep);
        if arrived.len() < count.0 {
            let departed = count.0 - arrived.len();
            tracing::debug!(peer = %me, superstep, departed, "Barrier lost peers");
            return Err(BspError::PeerDeparted {
                waiting: me,
                superstep,
                departed,
            });
        }
        sort_delivery(&mut delivery);
        Ok(delivery)
    }

    fn leave(&mut self) {
        // Closing the input lets the other workers' frontiers move
        // past this one; they notice the missing arrival.
        if let Some(input) = self.input.take() {
            input.close();
        }
    }
}

impl<'w, A, M> Drop for ClusterTransport<'w, A, M>
where
    A: Allocate,
    M: Message,
{
    fn drop(&mut self) {
        self.leave();
    }
}
